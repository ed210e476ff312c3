//! Choice Generators
//!
//! A choice generator enumerates the alternatives at one point where
//! execution may proceed in more than one way. Every transition starts by
//! advancing the current generator; the search backtracks into generators
//! that still have choices left.
//!
//! ```text
//!   ┌──────────────┐   ┌────────────┐   ┌──────────────┐
//!   │ ChoiceGen.   │◀──│  CgArena   │──▶│ DetachedChain│
//!   │ (trait)      │   │ handles    │   │ deep copy    │
//!   └──────┬───────┘   └────────────┘   └──────────────┘
//!          │
//!   ┌──────┴─────────────────────────────────────┐
//!   │ ThreadChoiceFromSet  BreakGenerator         │
//!   │ BooleanChoiceGenerator  IntIntervalGenerator│
//!   │ NumberChoiceFromList  RandomIntInterval...  │
//!   └────────────────────────────────────────────┘
//! ```

mod arena;
mod attrs;
mod data;
mod generator;
mod thread;
mod types;

pub use arena::{CgArena, DetachedChain};
pub use attrs::AttrBag;
pub use data::{
    BooleanChoiceGenerator, IntIntervalGenerator, NumberChoiceFromList,
    RandomIntIntervalGenerator,
};
pub use generator::ChoiceGenerator;
pub use thread::{BreakGenerator, ThreadChoiceFromSet, BLOCKED_NO_CHOICE};
pub use types::{
    CgBase, CgHandle, ChoiceRandomizer, ChoiceValue, Cursor, RandomizationPolicy,
};

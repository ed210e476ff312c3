//! Transition Engine
//!
//! A transition is the atomic unit of exploration: the instructions one
//! thread executes between two choice points.
//!
//! ```text
//!   ┌─────────────┐  register   ┌──────────────┐  initialize_next_transition
//!   │ engine/     │ ──────────▶ │ SystemState  │ ─────────────────────────▶ next choice
//!   │ policies    │             │  cur ◀─ next │
//!   └─────────────┘             └──────┬───────┘
//!                                      │ notifies
//!                                      ▼
//!                                 VmListener
//! ```

mod flags;
mod listener;
mod memento;
mod replay;
mod system_state;

pub use flags::TransitionFlags;
pub use listener::{Listeners, VmListener};
pub use memento::{Restorer, Restorers, SystemMemento};
pub use replay::{ChoicePoint, ReplayCursor};
pub use system_state::{SystemState, TransitionConfig};

//! Infrastructure Layer - Files and Text Formats
//!
//! Everything that touches the file system or a textual format lives here;
//! the domain layer stays I/O free.
//!
//! # Responsibilities
//! - Property files and the typed [`CoreConfig`] view
//! - Choice trace files (store / read for replay)
//! - Diagnostic state dumps for diffing

pub mod config;
pub mod dump;
pub mod trace_file;

// Re-exports
pub use config::{Config, CoreConfig, SearchConfig, TraceConfig};
pub use dump::dump_state;
pub use trace_file::TraceFile;

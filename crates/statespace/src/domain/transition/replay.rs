//! Choice Trace Replay
//!
//! A recorded path is the list of `(generator type, choice index)` pairs of
//! every generator on it, oldest first. Replaying installs the list as an
//! override: each generator the engine advances for the first time is
//! checked against the next entry and `select`ed to the recorded index.

use crate::domain::choice::ChoiceGenerator;
use crate::domain::error::TraceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One recorded choice
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChoicePoint {
    /// Generator type name (e.g. `ThreadChoiceFromSet`)
    pub cg_type: Arc<str>,
    /// Index of the choice taken
    pub choice: usize,
}

impl ChoicePoint {
    /// Record the current choice of `cg`
    pub fn of(cg: &dyn ChoiceGenerator) -> Option<Self> {
        Some(Self {
            cg_type: Arc::from(cg.type_name()),
            choice: cg.choice_index()?,
        })
    }
}

impl fmt::Display for ChoicePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cg_type, self.choice)
    }
}

/// Position inside a trace being replayed
#[derive(Debug, Clone)]
pub struct ReplayCursor {
    points: Arc<[ChoicePoint]>,
    pos: usize,
}

impl ReplayCursor {
    /// Cursor at the start of `points`
    pub fn new(points: impl Into<Arc<[ChoicePoint]>>) -> Self {
        Self {
            points: points.into(),
            pos: 0,
        }
    }

    /// Entries consumed so far
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Every entry was consumed
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.points.len()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// No entries at all
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Force `cg` to the next recorded choice.
    ///
    /// Returns `Ok(false)` once the trace is exhausted; the caller then
    /// falls back to a regular advance.
    pub fn apply(&mut self, cg: &mut dyn ChoiceGenerator) -> Result<bool, TraceError> {
        let Some(point) = self.points.get(self.pos) else {
            return Ok(false);
        };
        let index = self.pos;
        if &*point.cg_type != cg.type_name() {
            return Err(TraceError::ReplayMismatch {
                index,
                expected: point.cg_type.to_string(),
                found: cg.type_name().to_string(),
            });
        }
        if !cg.select(point.choice) {
            return Err(TraceError::ChoiceOutOfRange {
                index,
                choice: point.choice,
                cg: cg.type_name().to_string(),
                total: cg.total_choices(),
            });
        }
        self.pos += 1;
        Ok(true)
    }
}

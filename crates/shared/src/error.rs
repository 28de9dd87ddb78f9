use std::fmt::Display;

use thiserror::Error;

/// Connection loss never appears here; the dispatcher absorbs it and
/// reports through link-state changes instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessagingError {
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("store {op} failed: {reason}")]
    Persistence { op: &'static str, reason: String },
    #[error("failed to load {what}: {reason}")]
    Fetch { what: &'static str, reason: String },
}

impl MessagingError {
    pub fn persistence(op: &'static str, reason: impl Display) -> Self {
        Self::Persistence {
            op,
            reason: reason.to_string(),
        }
    }

    pub fn fetch(what: &'static str, reason: impl Display) -> Self {
        Self::Fetch {
            what,
            reason: reason.to_string(),
        }
    }
}

//! Trellis Access - the gatekeeper.
//!
//! `AccessController` composes the module graph, the consent gate, and the
//! progress state machine to answer "can this participant touch this module
//! now?" and "what comes next?". `PathAccessEvaluator` extends the same
//! checks to branching paths whose unlock rules look at outcomes rather
//! than sequence position. Every decision, granted or denied, lands in the
//! audit trail.

#![deny(unsafe_code)]

mod controller;
mod paths;

pub use controller::{AccessController, CompletionOutcome};
pub use paths::PathAccessEvaluator;

use thiserror::Error;
use trellis_consent::ConsentError;
use trellis_progress::ProgressError;
use trellis_types::{DenialReason, ModuleName, PathName};

/// Access-layer errors. Denials carry the machine-readable reason the HTTP
/// boundary maps to its 403 body.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("module not found: {0}")]
    ModuleNotFound(ModuleName),

    #[error("path not found: {0}")]
    PathNotFound(PathName),

    #[error("path {0} has no backing module and cannot be written")]
    PathNotWritable(PathName),

    #[error("access denied: {reason}")]
    Denied {
        reason: DenialReason,
        next_module: Option<ModuleName>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error("access layer unavailable: {0}")]
    Unavailable(String),

    #[error("access backend error: {0}")]
    Backend(String),
}

impl From<ConsentError> for AccessError {
    fn from(value: ConsentError) -> Self {
        match value {
            ConsentError::NoActiveVersion => {
                Self::Configuration("no active consent version is configured".to_string())
            }
            ConsentError::Unavailable(msg) => Self::Unavailable(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}

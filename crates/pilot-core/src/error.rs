use thiserror::Error;

use crate::checkpoint::{StepId, StreamTag};
use crate::retry::Escalation;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("step already exists in {stream} stream after {previous:?}: {existing}")]
    DuplicateStep {
        stream: StreamTag,
        previous: Option<StepId>,
        existing: StepId,
    },

    #[error("fingerprint {fingerprint} in {stream} stream maps to different identifying fields")]
    FingerprintCollision {
        stream: StreamTag,
        fingerprint: String,
    },

    #[error("step not found: {0}")]
    StepNotFound(StepId),

    #[error("step {step} belongs to {actual} stream, expected {expected}")]
    StreamMismatch {
        step: StepId,
        expected: StreamTag,
        actual: StreamTag,
    },

    #[error("{actual} payload cannot be recorded in the {expected} stream")]
    PayloadMismatch {
        expected: StreamTag,
        actual: StreamTag,
    },

    #[error("broken checkpoint chain at step {0}")]
    BrokenChain(StepId),

    #[error("automatic retries exhausted after {} tries: human intervention required", .0.tries)]
    RetryExhausted(Escalation),

    #[error("nested retry depth {depth} exceeds limit {limit}")]
    RecursionBudgetExceeded { depth: u32, limit: u32 },

    #[error("conversation branch not found: {0}")]
    BranchNotFound(uuid::Uuid),

    #[error("checkpoint db error: {0}")]
    CheckpointDb(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PilotError {
    /// `true` for the uniqueness violation callers are expected to absorb by
    /// falling back to a lookup.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateStep { .. })
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;

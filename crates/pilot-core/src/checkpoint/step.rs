//! Step data model: one immutable recorded unit of work.
//!
//! A `Step` sits in exactly one stream and points at the step recorded just
//! before it in that stream (or nothing, for a root). Payloads are a closed
//! set of variants so replay code can match exhaustively.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::Message;

// ---------------------------------------------------------------------------
// StepId
// ---------------------------------------------------------------------------

/// Store-assigned step identifier. Ids increase monotonically, so a step's
/// `previous` always has a smaller id than the step itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u64);

impl StepId {
    /// Encoding of an optional previous step inside composite keys. Real ids
    /// start at 1, so 0 marks a root.
    pub(crate) fn encode_previous(previous: Option<StepId>) -> u64 {
        previous.map(|p| p.0).unwrap_or(0)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// StreamTag
// ---------------------------------------------------------------------------

/// The independent categories of recorded work. Each keeps its own chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTag {
    Command,
    UserInput,
    ModelExchange,
}

impl StreamTag {
    pub fn all() -> &'static [StreamTag] {
        &[Self::Command, Self::UserInput, Self::ModelExchange]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::UserInput => "user_input",
            Self::ModelExchange => "model_exchange",
        }
    }

    /// Single-byte discriminant used as the leading byte of chain keys.
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            Self::Command => 1,
            Self::UserInput => 2,
            Self::ModelExchange => 3,
        }
    }
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CommandExit
// ---------------------------------------------------------------------------

/// How a command run ended. A timeout is an ordinary outcome, distinct from
/// every real exit code including 0; the process tree is already terminated
/// when this value exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandExit {
    Exited { code: i32 },
    TimedOut,
}

impl CommandExit {
    /// The real exit code, or `None` when the process was killed for
    /// exceeding its timeout.
    pub fn code(self) -> Option<i32> {
        match self {
            Self::Exited { code } => Some(code),
            Self::TimedOut => None,
        }
    }

    pub fn success(self) -> bool {
        self.code() == Some(0)
    }

    pub fn timed_out(self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

// ---------------------------------------------------------------------------
// StepPayload
// ---------------------------------------------------------------------------

/// What a step recorded. The variant determines the stream it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepPayload {
    CommandResult {
        command: String,
        cwd: String,
        exit: CommandExit,
        stdout: String,
        stderr: String,
    },
    UserAnswer {
        query: String,
        answer: String,
    },
    ModelExchange {
        prompt_path: String,
        prompt: String,
        response: String,
        messages: Vec<Message>,
    },
}

impl StepPayload {
    pub fn stream(&self) -> StreamTag {
        match self {
            Self::CommandResult { .. } => StreamTag::Command,
            Self::UserAnswer { .. } => StreamTag::UserInput,
            Self::ModelExchange { .. } => StreamTag::ModelExchange,
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A recorded unit of work. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    /// Owning project/app id.
    pub project: String,
    pub stream: StreamTag,
    pub previous: Option<StepId>,
    /// Hex SHA-256 over `identity`.
    pub fingerprint: String,
    /// Canonical serialized identifying fields, kept so lookups can verify
    /// the digest instead of trusting it.
    pub identity: String,
    pub payload: StepPayload,
    pub created_at: DateTime<Utc>,
}

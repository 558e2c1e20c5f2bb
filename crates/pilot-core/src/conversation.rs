//! In-memory message log with named branch points.
//!
//! A branch point is a copy of the message list taken before speculative work
//! (an automated fix, a debugging attempt). Loading it throws away everything
//! appended since. Committed checkpoint steps are never touched.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PilotError, Result};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// BranchId
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId(Uuid);

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// ConversationBranch
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct ConversationBranch {
    messages: Vec<Message>,
    branches: HashMap<BranchId, Vec<Message>>,
}

impl ConversationBranch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a conversation from an existing log, e.g. one restored from a
    /// model-exchange step.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            branches: HashMap::new(),
        }
    }

    pub fn append_message(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(Message::new(role, content));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Snapshot the current log under a fresh id.
    pub fn save_branch(&mut self) -> BranchId {
        let id = BranchId(Uuid::new_v4());
        self.branches.insert(id, self.messages.clone());
        debug!(branch = %id, messages = self.messages.len(), "saved conversation branch");
        id
    }

    /// Replace the current log with the snapshot taken by `save_branch`.
    ///
    /// The snapshot stays available, so the same branch point can be restored
    /// again after another failed attempt.
    pub fn load_branch(&mut self, id: BranchId) -> Result<()> {
        let snapshot = self
            .branches
            .get(&id)
            .ok_or(PilotError::BranchNotFound(id.0))?;
        let discarded = self.messages.len().saturating_sub(snapshot.len());
        self.messages.clone_from(snapshot);
        debug!(branch = %id, discarded, "restored conversation branch");
        Ok(())
    }

    /// Forget a branch point that is no longer needed.
    pub fn drop_branch(&mut self, id: BranchId) {
        self.branches.remove(&id);
    }

    /// Number of non-system messages.
    pub fn length(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role != Role::System)
            .count()
    }
}

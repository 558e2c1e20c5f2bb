//! Content fingerprints for checkpoint deduplication and replay.
//!
//! A fingerprint is a SHA-256 digest over a canonical JSON rendering of the
//! fields that make a unit of work reproducible. The canonical text travels
//! with the digest so stored steps can be verified on lookup.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::step::StreamTag;
use crate::conversation::Message;

/// Digest plus the canonical identifying fields it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    digest: [u8; 32],
    canonical: String,
}

impl Fingerprint {
    /// Hash `fields` under `stream`.
    ///
    /// `serde_json` maps are ordered by key, so two structurally equal values
    /// always produce the same canonical text.
    pub fn compute(stream: StreamTag, fields: &Value) -> Self {
        let canonical = json!({ "stream": stream.as_str(), "fields": fields }).to_string();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(canonical.as_bytes()));
        Self { digest, canonical }
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

/// Identifying inputs for each stream, before the ordinal is mixed in.
///
/// The ordinal is the number of steps already on the active chain of the
/// stream. It separates two runs of the same command text that are meant to
/// have different effects (e.g. `npm install` before and after editing
/// `package.json`).
#[derive(Debug, Clone, Copy)]
pub enum FingerprintInputs<'a> {
    Command {
        command: &'a str,
    },
    UserInput {
        query: &'a str,
    },
    ModelExchange {
        prompt_path: &'a str,
        prompt: &'a str,
        history: &'a [Message],
    },
}

impl FingerprintInputs<'_> {
    pub fn stream(&self) -> StreamTag {
        match self {
            Self::Command { .. } => StreamTag::Command,
            Self::UserInput { .. } => StreamTag::UserInput,
            Self::ModelExchange { .. } => StreamTag::ModelExchange,
        }
    }

    pub fn fingerprint(&self, ordinal: u64) -> Fingerprint {
        let fields = match self {
            Self::Command { command } => json!({ "command": command, "ordinal": ordinal }),
            Self::UserInput { query } => json!({ "query": query, "ordinal": ordinal }),
            Self::ModelExchange {
                prompt_path,
                prompt,
                history,
            } => json!({
                "prompt_path": prompt_path,
                "prompt": prompt,
                "history": history_digest(history),
                "ordinal": ordinal,
            }),
        };
        Fingerprint::compute(self.stream(), &fields)
    }
}

/// Digest of a message log, so long histories do not bloat the canonical
/// identity stored on every model-exchange step.
fn history_digest(history: &[Message]) -> String {
    let mut hasher = Sha256::new();
    for message in history {
        hasher.update(message.role.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(message.content.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

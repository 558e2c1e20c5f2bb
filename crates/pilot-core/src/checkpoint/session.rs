//! Per-stream checkpoint pointers for one orchestrating session.
//!
//! The session remembers, for each stream, the most recently accepted step
//! (the tip) and how many steps sit on the chain up to it (the ordinal).
//! A fresh session starts at the root of every stream; as the workflow
//! re-executes, each unit of work is first offered to
//! [`CheckpointSession::replay_if_cached`], which walks the stored chain
//! forward step by step. The first miss is where live execution resumes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::db::CheckpointStore;
use super::fingerprint::FingerprintInputs;
use super::step::{CommandExit, Step, StepId, StepPayload, StreamTag};
use crate::conversation::Message;
use crate::error::{PilotError, Result};

#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    tip: Option<StepId>,
    ordinal: u64,
}

pub struct CheckpointSession {
    store: Arc<CheckpointStore>,
    project: String,
    replay: bool,
    cursors: HashMap<StreamTag, Cursor>,
}

impl CheckpointSession {
    /// Start a session for `project` positioned at the root of every stream.
    pub fn new(store: Arc<CheckpointStore>, project: impl Into<String>, replay: bool) -> Self {
        Self {
            store,
            project: project.into(),
            replay,
            cursors: HashMap::new(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn replay_enabled(&self) -> bool {
        self.replay
    }

    pub fn set_replay(&mut self, replay: bool) {
        self.replay = replay;
    }

    /// The most recently accepted step of `stream`, if any.
    pub fn tip(&self, stream: StreamTag) -> Option<StepId> {
        self.cursor(stream).tip
    }

    /// Number of steps on the active chain of `stream`.
    pub fn ordinal(&self, stream: StreamTag) -> u64 {
        self.cursor(stream).ordinal
    }

    fn cursor(&self, stream: StreamTag) -> Cursor {
        self.cursors.get(&stream).copied().unwrap_or_default()
    }

    fn advance(&mut self, stream: StreamTag, step: StepId) {
        let cursor = self.cursors.entry(stream).or_default();
        cursor.tip = Some(step);
        cursor.ordinal += 1;
    }

    /// Return the stored step for `inputs` at the current tip and advance
    /// past it, or `None` if replay is off or nothing matches.
    pub fn replay_if_cached(&mut self, inputs: FingerprintInputs<'_>) -> Result<Option<Step>> {
        if !self.replay {
            return Ok(None);
        }
        let stream = inputs.stream();
        let cursor = self.cursor(stream);
        let fingerprint = inputs.fingerprint(cursor.ordinal);
        let hit = self
            .store
            .lookup(&self.project, stream, cursor.tip, &fingerprint)?;
        if let Some(step) = &hit {
            debug!(%stream, step = %step.id, ordinal = cursor.ordinal, "replaying cached step");
            self.advance(stream, step.id);
        }
        Ok(hit)
    }

    /// Record `payload` as the new tip of its stream.
    ///
    /// If the chain position is already taken by the same work, the existing
    /// step is adopted instead: somebody recorded it first.
    pub fn record_step(
        &mut self,
        inputs: FingerprintInputs<'_>,
        payload: StepPayload,
    ) -> Result<Step> {
        let stream = inputs.stream();
        if payload.stream() != stream {
            return Err(PilotError::PayloadMismatch {
                expected: stream,
                actual: payload.stream(),
            });
        }
        let cursor = self.cursor(stream);
        let fingerprint = inputs.fingerprint(cursor.ordinal);

        let step = match self
            .store
            .append(&self.project, cursor.tip, &fingerprint, payload)
        {
            Ok(step) => step,
            Err(PilotError::DuplicateStep { existing, .. }) => {
                debug!(%stream, %existing, "step already recorded, adopting it");
                self.store
                    .lookup(&self.project, stream, cursor.tip, &fingerprint)?
                    .ok_or(PilotError::StepNotFound(existing))?
            }
            Err(e) => return Err(e),
        };
        self.advance(stream, step.id);
        Ok(step)
    }

    /// Move the tip of `stream` back to `step` (or to the root with `None`).
    ///
    /// Steps after the new tip stay stored until [`prune`](Self::prune) or
    /// [`discard_after`](Self::discard_after) removes them; recording new
    /// work from here starts a sibling branch.
    pub fn rollback_to(&mut self, stream: StreamTag, step: Option<StepId>) -> Result<()> {
        let ordinal = match step {
            Some(id) => {
                let path = self.store.path_to_root(id)?;
                let tip = &path[0];
                if tip.project != self.project {
                    return Err(PilotError::StepNotFound(id));
                }
                if tip.stream != stream {
                    return Err(PilotError::StreamMismatch {
                        step: id,
                        expected: stream,
                        actual: tip.stream,
                    });
                }
                path.len() as u64
            }
            None => 0,
        };
        self.cursors.insert(stream, Cursor { tip: step, ordinal });
        info!(%stream, tip = ?step, ordinal, "rolled back checkpoint pointer");
        Ok(())
    }

    /// Delete every step of `stream` that is not on the active chain.
    pub fn prune(&self, stream: StreamTag) -> Result<usize> {
        self.store
            .prune_unreachable(&self.project, stream, self.tip(stream))
    }

    /// Delete everything recorded after `step` and make `step` the tip, so
    /// the work after it can be redone from a known-good point.
    pub fn discard_after(&mut self, stream: StreamTag, step: StepId) -> Result<usize> {
        self.rollback_to(stream, Some(step))?;
        self.store.delete_descendants_after(step)
    }

    // -----------------------------------------------------------------------
    // Typed helpers
    // -----------------------------------------------------------------------

    /// Replay the stored `(exit, stdout, stderr)` of `command`.
    pub fn replay_command(
        &mut self,
        command: &str,
    ) -> Result<Option<(CommandExit, String, String)>> {
        let step = self.replay_if_cached(FingerprintInputs::Command { command })?;
        Ok(step.and_then(|s| match s.payload {
            StepPayload::CommandResult {
                exit,
                stdout,
                stderr,
                ..
            } => Some((exit, stdout, stderr)),
            _ => None,
        }))
    }

    pub fn record_command(
        &mut self,
        command: &str,
        cwd: &str,
        exit: CommandExit,
        stdout: String,
        stderr: String,
    ) -> Result<StepId> {
        let payload = StepPayload::CommandResult {
            command: command.to_string(),
            cwd: cwd.to_string(),
            exit,
            stdout,
            stderr,
        };
        Ok(self
            .record_step(FingerprintInputs::Command { command }, payload)?
            .id)
    }

    /// Replay a user's earlier answer to `query`.
    pub fn replay_user_answer(&mut self, query: &str) -> Result<Option<String>> {
        let step = self.replay_if_cached(FingerprintInputs::UserInput { query })?;
        Ok(step.and_then(|s| match s.payload {
            StepPayload::UserAnswer { answer, .. } => Some(answer),
            _ => None,
        }))
    }

    pub fn record_user_answer(&mut self, query: &str, answer: &str) -> Result<StepId> {
        let payload = StepPayload::UserAnswer {
            query: query.to_string(),
            answer: answer.to_string(),
        };
        Ok(self
            .record_step(FingerprintInputs::UserInput { query }, payload)?
            .id)
    }

    /// Replay a stored model response and the message log that followed it.
    pub fn replay_model_exchange(
        &mut self,
        prompt_path: &str,
        prompt: &str,
        history: &[Message],
    ) -> Result<Option<(String, Vec<Message>)>> {
        let step = self.replay_if_cached(FingerprintInputs::ModelExchange {
            prompt_path,
            prompt,
            history,
        })?;
        Ok(step.and_then(|s| match s.payload {
            StepPayload::ModelExchange {
                response, messages, ..
            } => Some((response, messages)),
            _ => None,
        }))
    }

    pub fn record_model_exchange(
        &mut self,
        prompt_path: &str,
        prompt: &str,
        history: &[Message],
        response: &str,
        messages: Vec<Message>,
    ) -> Result<StepId> {
        let payload = StepPayload::ModelExchange {
            prompt_path: prompt_path.to_string(),
            prompt: prompt.to_string(),
            response: response.to_string(),
            messages,
        };
        let inputs = FingerprintInputs::ModelExchange {
            prompt_path,
            prompt,
            history,
        };
        Ok(self.record_step(inputs, payload)?.id)
    }
}

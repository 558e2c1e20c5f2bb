//! Resumable, content-addressed work history.
//!
//! Provides `Step`, `Fingerprint`, `CheckpointStore` and `CheckpointSession`:
//! every command run, user answer and model exchange is recorded as a step
//! in a parent-linked chain per stream, deduplicated by fingerprint, and
//! replayed when a session re-executes the same work.

pub mod db;
pub mod fingerprint;
pub mod session;
pub mod step;

pub use db::CheckpointStore;
pub use fingerprint::{Fingerprint, FingerprintInputs};
pub use session::CheckpointSession;
pub use step::{CommandExit, Step, StepId, StepPayload, StreamTag};

//! `pilot-exec`: runs shell commands for the orchestrator without blocking
//! it, and records them in the checkpoint history.
//!
//! # Architecture
//!
//! ```text
//! CommandRunner       ← clamps timeouts, replays or records via CheckpointSession
//!     │
//!     ▼
//! ProcessSupervisor   ← registry of background processes + watcher loop,
//!     │                  run-to-completion for foreground commands
//!     ▼
//! ProcessHandle       ← one `sh -c` child, output pumped by background tasks
//!     │
//!     ▼
//! ProcessGroup        ← kills the whole process tree (killpg / taskkill /T)
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use pilot_exec::{CommandRequest, CommandRunner, ProcessSupervisor};
//!
//! let supervisor = Arc::new(ProcessSupervisor::new(root, config.supervisor.clone()));
//! let mut runner = CommandRunner::new(supervisor, session, config.execution.clone());
//! let outcome = runner
//!     .run(CommandRequest::new("cargo test", ".").timeout(Duration::from_secs(60)))
//!     .await?;
//! if outcome.exit.timed_out() { /* tree already killed */ }
//! ```

pub mod error;
pub mod group;
pub mod process;
pub mod runner;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use error::ExecError;
pub use group::ProcessGroup;
pub use process::{ProcessHandle, ProcessId};
pub use runner::{truncate_output, CommandRequest, CommandRunner};
pub use supervisor::{
    CommandOutcome, ObserverError, ProcessObserver, ProcessSnapshot, ProcessSupervisor,
};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, ExecError>;

use std::path::PathBuf;

use pilot_core::PilotError;
use thiserror::Error;

use crate::process::ProcessId;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{command}` in {}: {source}", .cwd.display())]
    Spawn {
        command: String,
        cwd: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process not found: {0}")]
    ProcessNotFound(ProcessId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Checkpoint(#[from] PilotError),
}

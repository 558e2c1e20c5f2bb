pub mod checkpoint;
pub mod config;
pub mod conversation;
pub mod error;
pub mod io;
pub mod logging;
pub mod paths;
pub mod retry;

pub use error::{PilotError, Result};

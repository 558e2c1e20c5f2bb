use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const PILOT_DIR: &str = ".pilot";
pub const CONFIG_FILE: &str = ".pilot/config.yaml";
pub const CHECKPOINT_DB_FILE: &str = "checkpoints.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn pilot_dir(root: &Path) -> PathBuf {
    root.join(PILOT_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

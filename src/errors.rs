// Typed domain errors. `main` matches on these directly and maps them to the
// process exit codes below (0 success, 1 config error, 2 registrar-
// persistence error).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("prospector at index {index} declares no paths")]
    NoPaths { index: usize },
}

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("failed to write registrar snapshot to {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "registrar snapshot persistence failed {count} consecutive times, last error: {last}"
    )]
    PersistenceEscalated { count: u32, last: String },
}

/// Process exit codes per spec section 6.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const REGISTRAR_ERROR: i32 = 2;
}

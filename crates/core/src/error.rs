// Central Error Type for the Harness

use thiserror::Error;

/// Harness-level error type
///
/// Probe failures never surface here: they become `Outcome`s. This type covers
/// the plumbing around the probes (configuration, reporter sink).
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Probe error: {0}")]
    Probe(#[from] crate::domain::ProbeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Syscall error: {0}")]
    Syscall(#[from] crate::port::SyscallError),
}

/// Result type alias using HarnessError
pub type Result<T> = std::result::Result<T, HarnessError>;

impl From<std::ffi::NulError> for HarnessError {
    fn from(err: std::ffi::NulError) -> Self {
        HarnessError::Config(format!("interior NUL byte in argument: {}", err))
    }
}

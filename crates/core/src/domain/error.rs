// Probe Error Taxonomy

use thiserror::Error;

use super::outcome::{Diagnosis, FailureKind, Outcome, RawReturn};
use crate::port::SyscallError;

#[derive(Error, Debug)]
pub enum ProbeError {
    /// A resource the probe needs could not be obtained (reported as Skipped)
    #[error("Setup failure: {message}")]
    SetupFailure {
        message: String,
        observed: Option<RawReturn>,
    },

    /// The syscall returned a result inconsistent with the declared contract
    #[error("Assertion failure: {message}")]
    AssertionFailure {
        message: String,
        observed: Option<RawReturn>,
    },

    /// The syscall failed with an errno outside the anticipated set
    #[error("Unexpected syscall error: {0}")]
    UnexpectedSyscallError(#[from] SyscallError),

    #[error("Probe panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

impl ProbeError {
    pub fn setup(message: impl Into<String>) -> Self {
        ProbeError::SetupFailure {
            message: message.into(),
            observed: None,
        }
    }

    /// Setup failed because a prerequisite syscall failed
    pub fn setup_syscall(message: impl Into<String>, err: &SyscallError) -> Self {
        ProbeError::SetupFailure {
            message: format!("{}: {}", message.into(), err),
            observed: Some(err.raw()),
        }
    }

    pub fn assertion(message: impl Into<String>, observed: Option<RawReturn>) -> Self {
        ProbeError::AssertionFailure {
            message: message.into(),
            observed,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeError::SetupFailure { .. } => FailureKind::SetupFailure,
            ProbeError::AssertionFailure { .. } => FailureKind::AssertionFailure,
            ProbeError::UnexpectedSyscallError(_) => FailureKind::UnexpectedSyscallError,
            ProbeError::Panicked(_) => FailureKind::Panicked,
        }
    }

    pub fn diagnosis(&self) -> Diagnosis {
        match self {
            ProbeError::SetupFailure { message, observed }
            | ProbeError::AssertionFailure { message, observed } => {
                Diagnosis::new(self.kind(), message.clone(), *observed)
            }
            ProbeError::UnexpectedSyscallError(err) => {
                Diagnosis::new(self.kind(), err.to_string(), Some(err.raw()))
            }
            ProbeError::Panicked(msg) => Diagnosis::new(self.kind(), msg.clone(), None),
        }
    }

    /// Setup failures skip the probe, everything else fails it
    pub fn into_outcome(self) -> Outcome {
        let diagnosis = self.diagnosis();
        match self {
            ProbeError::SetupFailure { .. } => Outcome::Skipped(diagnosis),
            _ => Outcome::Fail(diagnosis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Syscall;
    use nix::errno::Errno;

    #[test]
    fn test_setup_failure_skips() {
        let outcome = ProbeError::setup("no region mapped").into_outcome();
        assert!(outcome.is_skipped());
        assert_eq!(outcome.diagnosis().unwrap().kind, FailureKind::SetupFailure);
    }

    #[test]
    fn test_unexpected_syscall_error_keeps_errno() {
        let err: ProbeError = SyscallError::new(Syscall::Execve, -1, Errno::EACCES).into();
        let outcome = err.into_outcome();
        let diagnosis = outcome.diagnosis().unwrap();

        assert!(outcome.is_fail());
        assert_eq!(diagnosis.raw_return, Some(-1));
        assert_eq!(diagnosis.errno, Some(Errno::EACCES as i32));
        assert_eq!(diagnosis.errno_name.as_deref(), Some("EACCES"));
    }
}

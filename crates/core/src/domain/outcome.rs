// Probe Outcome Model

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::Syscall;

/// Raw result of a syscall as the kernel handed it back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawReturn {
    pub ret: i64,
    pub errno: Option<Errno>,
}

impl RawReturn {
    pub fn ok(ret: i64) -> Self {
        Self { ret, errno: None }
    }

    pub fn err(ret: i64, errno: Errno) -> Self {
        Self {
            ret,
            errno: Some(errno),
        }
    }
}

/// Error taxonomy for probe failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    SetupFailure,
    AssertionFailure,
    UnexpectedSyscallError,
    Panicked,
    Disabled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::SetupFailure => write!(f, "SETUP_FAILURE"),
            FailureKind::AssertionFailure => write!(f, "ASSERTION_FAILURE"),
            FailureKind::UnexpectedSyscallError => write!(f, "UNEXPECTED_SYSCALL_ERROR"),
            FailureKind::Panicked => write!(f, "PANICKED"),
            FailureKind::Disabled => write!(f, "DISABLED"),
        }
    }
}

/// Why a probe did not pass
///
/// Carries the raw return value and errno when a syscall was observed, so the
/// log is enough to reproduce the failure by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub kind: FailureKind,
    pub message: String,
    pub raw_return: Option<i64>,
    pub errno: Option<i32>,
    pub errno_name: Option<String>,
}

impl Diagnosis {
    pub fn new(kind: FailureKind, message: impl Into<String>, observed: Option<RawReturn>) -> Self {
        let errno = observed.and_then(|o| o.errno);
        Self {
            kind,
            message: message.into(),
            raw_return: observed.map(|o| o.ret),
            errno: errno.map(|e| e as i32),
            errno_name: errno.map(|e| format!("{:?}", e)),
        }
    }
}

impl std::fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(ret) = self.raw_return {
            write!(f, " (ret={}", ret)?;
            match (&self.errno_name, self.errno) {
                (Some(name), Some(code)) => write!(f, ", errno={} {})", name, code)?,
                _ => write!(f, ")")?,
            }
        }
        Ok(())
    }
}

/// Verdict of a single probe. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pass,
    Fail(Diagnosis),
    Skipped(Diagnosis),
}

impl Outcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Outcome::Fail(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    pub fn diagnosis(&self) -> Option<&Diagnosis> {
        match self {
            Outcome::Pass => None,
            Outcome::Fail(d) | Outcome::Skipped(d) => Some(d),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Pass => write!(f, "PASS"),
            Outcome::Fail(_) => write!(f, "FAIL"),
            Outcome::Skipped(_) => write!(f, "SKIPPED"),
        }
    }
}

/// Kernel-returned data a human auditor wants to see next to the verdict
/// (descriptor slots, utsname fields, residency bytes, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence(Vec<(String, String)>);

impl Evidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.push((key.into(), value.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One recorded probe execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub group: String,
    pub probe: String,
    pub syscalls: Vec<Syscall>,
    pub outcome: Outcome,
    pub evidence: Evidence,
    pub elapsed_us: u64,
}

impl ProbeRecord {
    pub fn new(
        group: impl Into<String>,
        probe: impl Into<String>,
        syscalls: &[Syscall],
        outcome: Outcome,
        evidence: Evidence,
        elapsed: Duration,
    ) -> Self {
        Self {
            group: group.into(),
            probe: probe.into(),
            syscalls: syscalls.to_vec(),
            outcome,
            evidence,
            elapsed_us: elapsed.as_micros().min(u64::MAX as u128) as u64,
        }
    }
}

/// Aggregate of a harness run (or of the part of it run so far)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: i64, // epoch ms
    pub records: Vec<ProbeRecord>,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// false for a checkpoint emitted before a probe that may end the process
    pub complete: bool,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, started_at: i64) -> Self {
        Self {
            run_id: run_id.into(),
            started_at,
            records: Vec::new(),
            passed: 0,
            failed: 0,
            skipped: 0,
            complete: false,
        }
    }

    pub fn push(&mut self, record: ProbeRecord) {
        match record.outcome {
            Outcome::Pass => self.passed += 1,
            Outcome::Fail(_) => self.failed += 1,
            Outcome::Skipped(_) => self.skipped += 1,
        }
        self.records.push(record);
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn record(&self, probe: &str) -> Option<&ProbeRecord> {
        self.records.iter().find(|r| r.probe == probe)
    }
}

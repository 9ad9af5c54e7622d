// Harness configuration

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::time::Duration;

use super::constants::*;
use crate::domain::{ExecModel, ExecRequest, ThreadIdModel, TLS_SLOT_RANGE};
use crate::error::{HarnessError, Result};

/// Enable/disable probes by probe or group name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeFilter {
    /// When non-empty, only these probes/groups run
    pub only: Vec<String>,
    /// Never run these probes/groups
    pub skip: Vec<String>,
}

impl ProbeFilter {
    pub fn allows(&self, group: &str, probe: &str) -> bool {
        let named = |names: &[String]| names.iter().any(|n| n == group || n == probe);
        (self.only.is_empty() || named(&self.only)) && !named(&self.skip)
    }
}

/// Everything the probe groups need to know about the kernel under test
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// execve semantics the kernel documents
    pub exec_model: ExecModel,
    pub exec_target: String,
    pub exec_argv: Vec<String>,
    pub exec_envp: Vec<String>,
    pub missing_exec_path: String,
    pub thread_id_model: ThreadIdModel,
    pub map_lengths: Vec<usize>,
    pub page_size: usize,
    /// Bound on the mismatch futex wait
    pub wait_timeout: Duration,
    /// Bound on waiting for the clone child to go away
    pub join_timeout: Duration,
    pub tls_slots: RangeInclusive<u32>,
    pub output_fd: i32,
    pub filter: ProbeFilter,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            exec_model: ExecModel::Spawn,
            exec_target: DEFAULT_EXEC_TARGET.to_string(),
            exec_argv: DEFAULT_EXEC_ARGV.iter().map(|s| s.to_string()).collect(),
            exec_envp: Vec::new(),
            missing_exec_path: MISSING_EXEC_PATH.to_string(),
            thread_id_model: ThreadIdModel::MatchesPid,
            map_lengths: DEFAULT_MAP_LENGTHS.to_vec(),
            page_size: DEFAULT_PAGE_SIZE,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            tls_slots: TLS_SLOT_RANGE,
            output_fd: STDOUT_FD,
            filter: ProbeFilter::default(),
        }
    }
}

impl HarnessConfig {
    /// Reject configurations that would make probes meaningless or hang
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(HarnessError::Config(format!(
                "page size {:#x} is not a power of two",
                self.page_size
            )));
        }
        if self.map_lengths.is_empty() || self.map_lengths.contains(&0) {
            return Err(HarnessError::Config(
                "mapping lengths must be non-empty and non-zero".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.map_lengths.iter().find(|len| !seen.insert(**len)) {
            // Probe names are keyed by length, so a repeat would collide
            return Err(HarnessError::Config(format!(
                "mapping length {:#x} is listed more than once",
                dup
            )));
        }
        if self.wait_timeout.is_zero() || self.join_timeout.is_zero() {
            return Err(HarnessError::Config(
                "wait timeouts must be non-zero".to_string(),
            ));
        }
        if self.exec_target == self.missing_exec_path {
            return Err(HarnessError::Config(format!(
                "exec target and missing path are both {}",
                self.exec_target
            )));
        }
        if self.tls_slots.contains(&crate::domain::ThreadAreaDescriptor::AUTO_ASSIGN) {
            return Err(HarnessError::Config(
                "TLS slot range must not contain the auto-assign sentinel".to_string(),
            ));
        }
        self.exec_request()?;
        self.missing_exec_request()?;
        Ok(())
    }

    pub fn exec_request(&self) -> Result<ExecRequest> {
        Ok(ExecRequest::new(
            &self.exec_target,
            &self.exec_argv,
            &self.exec_envp,
        )?)
    }

    pub fn missing_exec_request(&self) -> Result<ExecRequest> {
        Ok(ExecRequest::new(
            &self.missing_exec_path,
            &self.exec_argv,
            &self.exec_envp,
        )?)
    }
}

// Probe Model

use super::error::Result;
use super::{Evidence, Syscall};
use crate::port::Kernel;

/// Identity of a probe: its name and the syscalls it exercises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub name: String,
    pub syscalls: Vec<Syscall>,
    /// Success means control never comes back (replace-model execve)
    pub may_not_return: bool,
}

impl ProbeSpec {
    pub fn new(name: impl Into<String>, syscalls: &[Syscall]) -> Self {
        Self {
            name: name.into(),
            syscalls: syscalls.to_vec(),
            may_not_return: false,
        }
    }

    pub fn not_returning(mut self) -> Self {
        self.may_not_return = true;
        self
    }
}

/// A self-contained syscall test: setup, invocation, assertion, cleanup.
///
/// Probes of one group share a `Context` (the mapped region, the futex word,
/// open descriptors...). The runner guarantees `cleanup` runs on every exit
/// path, including a failed assertion or a panic.
pub trait Probe {
    /// State shared with the other probes of the same group
    type Context;
    /// What the invocation hands to the assertion
    type Observed;

    fn spec(&self) -> &ProbeSpec;

    /// Acquire what the invocation needs. An error skips the probe.
    fn setup(&self, _ctx: &mut Self::Context, _kernel: &dyn Kernel) -> Result<()> {
        Ok(())
    }

    /// Issue the syscall under test
    fn invoke(&self, ctx: &mut Self::Context, kernel: &dyn Kernel) -> Result<Self::Observed>;

    /// Judge the observation against the contract, attaching evidence for the log
    fn check(
        &self,
        ctx: &mut Self::Context,
        observed: Self::Observed,
        evidence: &mut Evidence,
    ) -> Result<()>;

    fn cleanup(&self, _ctx: &mut Self::Context, _kernel: &dyn Kernel) {}
}

// Identity/scheduling probes: set_thread_area, getpid, gettid, sched_yield

use nix::errno::Errno;
use std::ops::RangeInclusive;

use crate::application::config::HarnessConfig;
use crate::application::runner::{GroupContext, ProbeGroup};
use crate::domain::error::Result;
use crate::domain::{
    Evidence, Probe, ProbeError, ProbeSpec, RawReturn, Syscall, ThreadAreaDescriptor,
    ThreadIdModel,
};
use crate::port::Kernel;

pub const GROUP: &str = "identity";

/// Identifiers learned by earlier probes of the group
#[derive(Debug, Default)]
pub struct IdentityContext {
    pub pid: Option<i32>,
}

impl GroupContext for IdentityContext {}

/// Auto-assign a TLS descriptor slot; the kernel must pick a concrete one
pub struct SetThreadAreaProbe {
    spec: ProbeSpec,
    slots: RangeInclusive<u32>,
}

impl SetThreadAreaProbe {
    pub fn new(slots: RangeInclusive<u32>) -> Self {
        Self {
            spec: ProbeSpec::new("set_thread_area", &[Syscall::SetThreadArea]),
            slots,
        }
    }
}

impl Probe for SetThreadAreaProbe {
    type Context = IdentityContext;
    type Observed = ThreadAreaDescriptor;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, _ctx: &mut IdentityContext, kernel: &dyn Kernel) -> Result<()> {
        if !kernel.supports(Syscall::SetThreadArea) {
            return Err(ProbeError::setup(
                "set_thread_area is not part of this architecture's syscall ABI",
            ));
        }
        Ok(())
    }

    fn invoke(&self, _ctx: &mut IdentityContext, kernel: &dyn Kernel) -> Result<ThreadAreaDescriptor> {
        let mut desc = ThreadAreaDescriptor::auto_assign();
        match kernel.set_thread_area(&mut desc) {
            Ok(()) => Ok(desc),
            Err(e) if e.errno == Errno::ENOSYS => Err(ProbeError::setup_syscall(
                "set_thread_area is not implemented by this kernel",
                &e,
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn check(
        &self,
        _ctx: &mut IdentityContext,
        desc: ThreadAreaDescriptor,
        evidence: &mut Evidence,
    ) -> Result<()> {
        evidence.push("entry_number", desc.entry_number);

        if !desc.is_assigned() {
            return Err(ProbeError::assertion(
                "kernel left the auto-assign sentinel in entry_number",
                Some(RawReturn::ok(0)),
            ));
        }
        if !self.slots.contains(&desc.entry_number) {
            return Err(ProbeError::assertion(
                format!(
                    "slot {} outside the valid range {}..={}",
                    desc.entry_number,
                    self.slots.start(),
                    self.slots.end()
                ),
                Some(RawReturn::ok(0)),
            ));
        }
        Ok(())
    }
}

pub struct GetpidProbe {
    spec: ProbeSpec,
}

impl GetpidProbe {
    pub fn new() -> Self {
        Self {
            spec: ProbeSpec::new("getpid", &[Syscall::Getpid]),
        }
    }
}

impl Default for GetpidProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for GetpidProbe {
    type Context = IdentityContext;
    type Observed = i32;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn invoke(&self, _ctx: &mut IdentityContext, kernel: &dyn Kernel) -> Result<i32> {
        Ok(kernel.getpid()?)
    }

    fn check(&self, ctx: &mut IdentityContext, pid: i32, evidence: &mut Evidence) -> Result<()> {
        evidence.push("pid", pid);
        if pid <= 0 {
            return Err(ProbeError::assertion(
                format!("pid {} is not positive", pid),
                Some(RawReturn::ok(pid as i64)),
            ));
        }
        ctx.pid = Some(pid);
        Ok(())
    }
}

/// gettid of the initial thread, judged against pid by the configured model
pub struct GettidProbe {
    spec: ProbeSpec,
    model: ThreadIdModel,
}

impl GettidProbe {
    pub fn new(model: ThreadIdModel) -> Self {
        Self {
            spec: ProbeSpec::new("gettid", &[Syscall::Gettid]),
            model,
        }
    }
}

impl Probe for GettidProbe {
    type Context = IdentityContext;
    type Observed = i32;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, ctx: &mut IdentityContext, kernel: &dyn Kernel) -> Result<()> {
        // getpid may have been filtered out
        if ctx.pid.is_none() && self.model != ThreadIdModel::Unchecked {
            let pid = kernel
                .getpid()
                .map_err(|e| ProbeError::setup_syscall("getpid for tid comparison", &e))?;
            ctx.pid = Some(pid);
        }
        Ok(())
    }

    fn invoke(&self, _ctx: &mut IdentityContext, kernel: &dyn Kernel) -> Result<i32> {
        Ok(kernel.gettid()?)
    }

    fn check(&self, ctx: &mut IdentityContext, tid: i32, evidence: &mut Evidence) -> Result<()> {
        evidence.push("tid", tid);
        evidence.push("model", self.model);

        if tid <= 0 {
            return Err(ProbeError::assertion(
                format!("tid {} is not positive", tid),
                Some(RawReturn::ok(tid as i64)),
            ));
        }
        if let Some(pid) = ctx.pid {
            self.model
                .check(tid, pid)
                .map_err(|msg| ProbeError::assertion(msg, Some(RawReturn::ok(tid as i64))))?;
        }
        Ok(())
    }
}

/// Yield is advisory: only success is asserted
pub struct SchedYieldProbe {
    spec: ProbeSpec,
}

impl SchedYieldProbe {
    pub fn new() -> Self {
        Self {
            spec: ProbeSpec::new("sched_yield", &[Syscall::SchedYield]),
        }
    }
}

impl Default for SchedYieldProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for SchedYieldProbe {
    type Context = IdentityContext;
    type Observed = ();

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn invoke(&self, _ctx: &mut IdentityContext, kernel: &dyn Kernel) -> Result<()> {
        Ok(kernel.sched_yield()?)
    }

    fn check(&self, _ctx: &mut IdentityContext, _: (), _evidence: &mut Evidence) -> Result<()> {
        Ok(())
    }
}

pub fn group(config: &HarnessConfig) -> ProbeGroup<IdentityContext> {
    ProbeGroup::new(GROUP)
        .with(SetThreadAreaProbe::new(config.tls_slots.clone()))
        .with(GetpidProbe::new())
        .with(GettidProbe::new(config.thread_id_model))
        .with(SchedYieldProbe::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::runner::run_probe;
    use crate::domain::FailureKind;
    use crate::port::kernel::mocks::MockKernel;

    #[test]
    fn test_set_thread_area_reports_slot() {
        let kernel = MockKernel::new().with_tls_slot(13);
        let probe = SetThreadAreaProbe::new(12..=14);
        let (outcome, evidence) = run_probe(&probe, &mut IdentityContext::default(), &kernel);

        assert!(outcome.is_pass());
        assert_eq!(evidence.get("entry_number"), Some("13"));
    }

    #[test]
    fn test_set_thread_area_sentinel_fails() {
        let kernel = MockKernel::new().with_tls_slot(ThreadAreaDescriptor::AUTO_ASSIGN);
        let probe = SetThreadAreaProbe::new(12..=14);
        let (outcome, _) = run_probe(&probe, &mut IdentityContext::default(), &kernel);

        let diagnosis = outcome.diagnosis().unwrap();
        assert_eq!(diagnosis.kind, FailureKind::AssertionFailure);
        assert!(diagnosis.message.contains("sentinel"));
    }

    #[test]
    fn test_set_thread_area_out_of_range_fails() {
        let kernel = MockKernel::new().with_tls_slot(3);
        let probe = SetThreadAreaProbe::new(12..=14);
        let (outcome, _) = run_probe(&probe, &mut IdentityContext::default(), &kernel);

        assert!(outcome.is_fail());
        assert!(outcome.diagnosis().unwrap().message.contains("12..=14"));
    }

    #[test]
    fn test_set_thread_area_unsupported_is_skipped() {
        let kernel = MockKernel::new().unsupported(Syscall::SetThreadArea);
        let probe = SetThreadAreaProbe::new(12..=14);
        let (outcome, _) = run_probe(&probe, &mut IdentityContext::default(), &kernel);

        assert!(outcome.is_skipped());
        assert_eq!(kernel.call_count(Syscall::SetThreadArea), 0);
    }

    #[test]
    fn test_set_thread_area_enosys_is_skipped() {
        let kernel = MockKernel::new().failing(Syscall::SetThreadArea, Errno::ENOSYS);
        let probe = SetThreadAreaProbe::new(12..=14);
        let (outcome, _) = run_probe(&probe, &mut IdentityContext::default(), &kernel);

        assert!(outcome.is_skipped());
        let diagnosis = outcome.diagnosis().unwrap();
        assert_eq!(diagnosis.kind, FailureKind::SetupFailure);
        assert_eq!(diagnosis.errno_name.as_deref(), Some("ENOSYS"));
    }

    #[test]
    fn test_set_thread_area_other_errno_fails() {
        let kernel = MockKernel::new().failing(Syscall::SetThreadArea, Errno::EINVAL);
        let probe = SetThreadAreaProbe::new(12..=14);
        let (outcome, _) = run_probe(&probe, &mut IdentityContext::default(), &kernel);

        assert!(outcome.is_fail());
    }

    #[test]
    fn test_gettid_matches_pid() {
        let kernel = MockKernel::new().with_ids(77, 77);
        let mut ctx = IdentityContext::default();

        let (pid_outcome, _) = run_probe(&GetpidProbe::new(), &mut ctx, &kernel);
        let (tid_outcome, _) =
            run_probe(&GettidProbe::new(ThreadIdModel::MatchesPid), &mut ctx, &kernel);

        assert!(pid_outcome.is_pass());
        assert!(tid_outcome.is_pass());
        assert_eq!(ctx.pid, Some(77));
        // pid came from the context, not a second getpid
        assert_eq!(kernel.call_count(Syscall::Getpid), 1);
    }

    #[test]
    fn test_gettid_model_mismatch_fails() {
        let kernel = MockKernel::new().with_ids(77, 78);
        let mut ctx = IdentityContext::default();
        let (outcome, _) =
            run_probe(&GettidProbe::new(ThreadIdModel::MatchesPid), &mut ctx, &kernel);

        assert!(outcome.is_fail());
        assert!(outcome.diagnosis().unwrap().message.contains("differs"));

        let (outcome, _) = run_probe(&GettidProbe::new(ThreadIdModel::Distinct), &mut ctx, &kernel);
        assert!(outcome.is_pass());
    }

    #[test]
    fn test_non_positive_pid_fails() {
        let kernel = MockKernel::new().with_ids(0, 1);
        let mut ctx = IdentityContext::default();
        let (outcome, _) = run_probe(&GetpidProbe::new(), &mut ctx, &kernel);

        assert!(outcome.is_fail());
        assert_eq!(ctx.pid, None);
    }

    #[test]
    fn test_sched_yield() {
        let kernel = MockKernel::new();
        let (outcome, _) =
            run_probe(&SchedYieldProbe::new(), &mut IdentityContext::default(), &kernel);
        assert!(outcome.is_pass());
        assert_eq!(kernel.calls(), vec![Syscall::SchedYield]);
    }
}

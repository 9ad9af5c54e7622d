// Concurrency probes: futex wait/wake on a private word, clone + bounded join

use nix::errno::Errno;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::application::config::HarnessConfig;
use crate::application::constants::{
    CHILD_EXIT_STATUS, CLONE_STACK_SIZE, FUTEX_EXPECTED_MISMATCH, FUTEX_WAKE_COUNT,
    FUTEX_WORD_INITIAL,
};
use crate::application::runner::{GroupContext, ProbeGroup};
use crate::domain::error::Result;
use crate::domain::{
    Evidence, FutexWord, Probe, ProbeError, ProbeSpec, RawReturn, Syscall, ThreadHandle,
    ThreadResources,
};
use crate::port::{Kernel, SysResult};

pub const GROUP: &str = "concurrency";

/// The rendezvous word and the clone child, owned by this group only
#[derive(Debug, Default)]
pub struct ConcurrencyContext {
    pub word: FutexWord,
    pub child: Option<ThreadHandle>,
}

impl GroupContext for ConcurrencyContext {
    fn teardown(&mut self, _kernel: &dyn Kernel) {
        match self.child.take() {
            Some(child) if !child.has_exited() => {
                warn!(tid = child.tid(), "Clone child never confirmed exit, leaking its stack");
                child.abandon();
            }
            _ => {}
        }
    }
}

#[derive(Debug)]
pub struct WaitObservation {
    pub result: SysResult<i64>,
    pub elapsed: Duration,
}

/// FUTEX_WAIT with an expected value that differs from the word.
/// The kernel must refuse with EAGAIN instead of blocking.
pub struct FutexWaitMismatchProbe {
    spec: ProbeSpec,
    timeout: Duration,
}

impl FutexWaitMismatchProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            spec: ProbeSpec::new("futex_wait_mismatch", &[Syscall::Futex]),
            timeout,
        }
    }
}

impl Probe for FutexWaitMismatchProbe {
    type Context = ConcurrencyContext;
    type Observed = WaitObservation;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, ctx: &mut ConcurrencyContext, _kernel: &dyn Kernel) -> Result<()> {
        ctx.word.store(FUTEX_WORD_INITIAL);
        Ok(())
    }

    fn invoke(&self, ctx: &mut ConcurrencyContext, kernel: &dyn Kernel) -> Result<WaitObservation> {
        let started = Instant::now();
        let result = kernel.futex_wait(&ctx.word, FUTEX_EXPECTED_MISMATCH, Some(self.timeout));
        Ok(WaitObservation {
            result,
            elapsed: started.elapsed(),
        })
    }

    fn check(
        &self,
        _ctx: &mut ConcurrencyContext,
        observed: WaitObservation,
        evidence: &mut Evidence,
    ) -> Result<()> {
        evidence.push("word", FUTEX_WORD_INITIAL);
        evidence.push("expected", FUTEX_EXPECTED_MISMATCH);
        evidence.push("elapsed_us", observed.elapsed.as_micros());

        match observed.result {
            Err(e) if e.errno == Errno::EAGAIN => {
                evidence.push("errno", "EAGAIN");
                Ok(())
            }
            Err(e) if e.errno == Errno::ETIMEDOUT => Err(ProbeError::assertion(
                format!(
                    "wait blocked until the {:?} timeout despite the value mismatch",
                    self.timeout
                ),
                Some(e.raw()),
            )),
            Err(e) => Err(e.into()),
            Ok(ret) => Err(ProbeError::assertion(
                "wait on a mismatched value returned success instead of EAGAIN",
                Some(RawReturn::ok(ret)),
            )),
        }
    }
}

/// FUTEX_WAKE with nobody waiting: must report zero woken
pub struct FutexWakeProbe {
    spec: ProbeSpec,
    count: i32,
}

impl FutexWakeProbe {
    pub fn new(count: i32) -> Self {
        Self {
            spec: ProbeSpec::new("futex_wake", &[Syscall::Futex]),
            count,
        }
    }
}

impl Probe for FutexWakeProbe {
    type Context = ConcurrencyContext;
    type Observed = i64;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn invoke(&self, ctx: &mut ConcurrencyContext, kernel: &dyn Kernel) -> Result<i64> {
        Ok(kernel.futex_wake(&ctx.word, self.count)?)
    }

    fn check(&self, _ctx: &mut ConcurrencyContext, woken: i64, evidence: &mut Evidence) -> Result<()> {
        evidence.push("requested", self.count);
        evidence.push("woken", woken);
        if woken != 0 {
            return Err(ProbeError::assertion(
                format!("woke {} waiters but none were blocked", woken),
                Some(RawReturn::ok(woken)),
            ));
        }
        Ok(())
    }
}

/// Spawn a thread-group child on its own stack; the child exits at once
pub struct CloneProbe {
    spec: ProbeSpec,
    stack_size: usize,
    exit_status: i32,
}

impl CloneProbe {
    pub fn new(stack_size: usize, exit_status: i32) -> Self {
        Self {
            spec: ProbeSpec::new("clone", &[Syscall::Clone, Syscall::Exit]),
            stack_size,
            exit_status,
        }
    }
}

impl Probe for CloneProbe {
    type Context = ConcurrencyContext;
    type Observed = i32;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, ctx: &mut ConcurrencyContext, kernel: &dyn Kernel) -> Result<()> {
        if !kernel.supports(Syscall::Clone) {
            return Err(ProbeError::setup(
                "no clone trampoline for this architecture",
            ));
        }
        if ctx.child.is_some() {
            return Err(ProbeError::setup("a clone child from this group is still tracked"));
        }
        Ok(())
    }

    fn invoke(&self, ctx: &mut ConcurrencyContext, kernel: &dyn Kernel) -> Result<i32> {
        let mut resources = ThreadResources::new(self.stack_size);
        // SAFETY: the stack and tid word are heap allocations that move into
        // the context handle; teardown frees them only once the tid word
        // reads 0 and leaks them otherwise.
        let tid = unsafe { kernel.clone_exiting_thread(&mut resources, self.exit_status) }?;
        ctx.child = Some(ThreadHandle::new(tid, resources));
        Ok(tid)
    }

    fn check(&self, _ctx: &mut ConcurrencyContext, tid: i32, evidence: &mut Evidence) -> Result<()> {
        evidence.push("child_tid", tid);
        evidence.push("stack_size", format!("{:#x}", self.stack_size));
        evidence.push("exit_status", self.exit_status);
        if tid <= 0 {
            return Err(ProbeError::assertion(
                format!("clone returned {} instead of a child tid", tid),
                Some(RawReturn::ok(tid as i64)),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JoinObservation {
    pub tid: i32,
    pub joined: bool,
    pub waits: u32,
    pub elapsed: Duration,
}

/// Wait (bounded) for the kernel to clear the child's tid word
pub struct ThreadJoinProbe {
    spec: ProbeSpec,
    timeout: Duration,
}

impl ThreadJoinProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            spec: ProbeSpec::new("clone_join", &[Syscall::Futex]),
            timeout,
        }
    }
}

impl Probe for ThreadJoinProbe {
    type Context = ConcurrencyContext;
    type Observed = JoinObservation;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, ctx: &mut ConcurrencyContext, _kernel: &dyn Kernel) -> Result<()> {
        if ctx.child.is_none() {
            return Err(ProbeError::setup("no clone child to join"));
        }
        Ok(())
    }

    fn invoke(&self, ctx: &mut ConcurrencyContext, kernel: &dyn Kernel) -> Result<JoinObservation> {
        let child = ctx
            .child
            .as_ref()
            .ok_or_else(|| ProbeError::setup("no clone child to join"))?;

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut waits = 0;

        loop {
            let current = child.tid_word().load();
            let now = Instant::now();
            if current == 0 || now >= deadline {
                return Ok(JoinObservation {
                    tid: child.tid(),
                    joined: current == 0,
                    waits,
                    elapsed: started.elapsed(),
                });
            }

            waits += 1;
            match kernel.futex_wait(child.tid_word(), current, Some(deadline - now)) {
                Ok(_) => {}
                Err(e) if matches!(e.errno, Errno::EAGAIN | Errno::EINTR | Errno::ETIMEDOUT) => {}
                Err(e) => {
                    // Futex unusable for joining; fall back to polling
                    debug!(error = %e, "futex wait on tid word failed, yielding");
                    kernel.sched_yield()?;
                }
            }
        }
    }

    fn check(
        &self,
        ctx: &mut ConcurrencyContext,
        observed: JoinObservation,
        evidence: &mut Evidence,
    ) -> Result<()> {
        evidence.push("child_tid", observed.tid);
        evidence.push("waits", observed.waits);
        evidence.push("elapsed_us", observed.elapsed.as_micros());

        if !observed.joined {
            return Err(ProbeError::assertion(
                format!(
                    "child {} did not clear its tid word within {:?}",
                    observed.tid, self.timeout
                ),
                None,
            ));
        }

        // Child is gone, its stack can be freed
        ctx.child = None;
        Ok(())
    }
}

pub fn group(config: &HarnessConfig) -> ProbeGroup<ConcurrencyContext> {
    ProbeGroup::new(GROUP)
        .with(FutexWaitMismatchProbe::new(config.wait_timeout))
        .with(FutexWakeProbe::new(FUTEX_WAKE_COUNT))
        .with(CloneProbe::new(CLONE_STACK_SIZE, CHILD_EXIT_STATUS))
        .with(ThreadJoinProbe::new(config.join_timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::runner::run_probe;
    use crate::domain::FailureKind;
    use crate::port::kernel::mocks::MockKernel;

    #[test]
    fn test_wait_mismatch_returns_eagain() {
        let kernel = MockKernel::new();
        let mut ctx = ConcurrencyContext::default();
        let (outcome, evidence) = run_probe(
            &FutexWaitMismatchProbe::new(Duration::from_millis(10)),
            &mut ctx,
            &kernel,
        );

        assert!(outcome.is_pass(), "{:?}", outcome);
        assert_eq!(evidence.get("errno"), Some("EAGAIN"));
    }

    #[test]
    fn test_wait_that_blocks_until_timeout_fails() {
        let kernel = MockKernel::new();
        let mut ctx = ConcurrencyContext::default();
        let probe = FutexWaitMismatchProbe::new(Duration::from_millis(10));

        // A broken kernel would compare against the wrong value and block;
        // emulate it by making the word match the expected value.
        let observed = WaitObservation {
            result: kernel.futex_wait(
                &FutexWord::new(FUTEX_EXPECTED_MISMATCH),
                FUTEX_EXPECTED_MISMATCH,
                Some(Duration::from_millis(10)),
            ),
            elapsed: Duration::from_millis(10),
        };
        let err = probe.check(&mut ctx, observed, &mut Evidence::new()).unwrap_err();

        assert_eq!(err.kind(), FailureKind::AssertionFailure);
        assert!(err.to_string().contains("blocked"));
    }

    #[test]
    fn test_wait_unexpected_errno() {
        let kernel = MockKernel::new().failing(Syscall::Futex, Errno::ENOSYS);
        let (outcome, _) = run_probe(
            &FutexWaitMismatchProbe::new(Duration::from_millis(10)),
            &mut ConcurrencyContext::default(),
            &kernel,
        );

        let diagnosis = outcome.diagnosis().unwrap();
        assert_eq!(diagnosis.kind, FailureKind::UnexpectedSyscallError);
        assert_eq!(diagnosis.errno_name.as_deref(), Some("ENOSYS"));
    }

    #[test]
    fn test_wake_with_no_waiters() {
        let kernel = MockKernel::new();
        let (outcome, evidence) = run_probe(
            &FutexWakeProbe::new(FUTEX_WAKE_COUNT),
            &mut ConcurrencyContext::default(),
            &kernel,
        );

        assert!(outcome.is_pass());
        assert_eq!(evidence.get("woken"), Some("0"));
    }

    #[test]
    fn test_clone_then_join() {
        let kernel = MockKernel::new();
        let mut ctx = ConcurrencyContext::default();

        let (clone, evidence) =
            run_probe(&CloneProbe::new(CLONE_STACK_SIZE, CHILD_EXIT_STATUS), &mut ctx, &kernel);
        assert!(clone.is_pass());
        assert_eq!(evidence.get("child_tid"), Some("101"));
        assert_eq!(evidence.get("exit_status"), Some("42"));
        assert!(ctx.child.is_some());

        let (join, evidence) =
            run_probe(&ThreadJoinProbe::new(Duration::from_millis(50)), &mut ctx, &kernel);
        assert!(join.is_pass());
        assert_eq!(evidence.get("waits"), Some("0"));
        assert!(ctx.child.is_none());
        assert_eq!(kernel.calls(), vec![Syscall::Clone, Syscall::Exit]);
    }

    #[test]
    fn test_join_times_out_and_child_is_abandoned() {
        let kernel = MockKernel::new().with_child_exit(false);
        let mut ctx = ConcurrencyContext::default();

        run_probe(&CloneProbe::new(CLONE_STACK_SIZE, CHILD_EXIT_STATUS), &mut ctx, &kernel);
        let (join, _) =
            run_probe(&ThreadJoinProbe::new(Duration::from_millis(20)), &mut ctx, &kernel);

        assert!(join.is_fail());
        assert!(join.diagnosis().unwrap().message.contains("did not clear"));
        assert!(kernel.call_count(Syscall::Futex) >= 1);

        // Still tracked until teardown leaks it
        assert!(ctx.child.is_some());
        ctx.teardown(&kernel);
        assert!(ctx.child.is_none());
    }

    #[test]
    fn test_join_without_child_is_skipped() {
        let kernel = MockKernel::new().failing(Syscall::Clone, Errno::EINVAL);
        let mut ctx = ConcurrencyContext::default();

        let (clone, _) =
            run_probe(&CloneProbe::new(CLONE_STACK_SIZE, CHILD_EXIT_STATUS), &mut ctx, &kernel);
        let (join, _) =
            run_probe(&ThreadJoinProbe::new(Duration::from_millis(20)), &mut ctx, &kernel);

        assert!(clone.is_fail());
        assert!(join.is_skipped());
    }
}

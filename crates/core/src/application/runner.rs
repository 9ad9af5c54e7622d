// Probe lifecycle: setup -> invoke -> check, cleanup on every path

use tracing::{debug, warn};

use super::panic_guard::{guarded, Guarded};
use super::sequencer::Session;
use crate::domain::{Evidence, Outcome, Probe, ProbeError, ProbeSpec};
use crate::error::Result;
use crate::port::Kernel;

/// Object-safe view of a probe over a group context `C`
pub trait DynProbe<C> {
    fn spec(&self) -> &ProbeSpec;
    fn run(&self, ctx: &mut C, kernel: &dyn Kernel) -> (Outcome, Evidence);
}

impl<P: Probe> DynProbe<P::Context> for P {
    fn spec(&self) -> &ProbeSpec {
        Probe::spec(self)
    }

    fn run(&self, ctx: &mut P::Context, kernel: &dyn Kernel) -> (Outcome, Evidence) {
        run_probe(self, ctx, kernel)
    }
}

/// Run one probe to an Outcome. Never panics, never propagates.
pub fn run_probe<P: Probe>(
    probe: &P,
    ctx: &mut P::Context,
    kernel: &dyn Kernel,
) -> (Outcome, Evidence) {
    let name = &Probe::spec(probe).name;
    let mut evidence = Evidence::new();

    let lifecycle = guarded(name, || {
        probe.setup(ctx, kernel)?;
        let observed = probe.invoke(ctx, kernel)?;
        probe.check(ctx, observed, &mut evidence)
    });

    let cleanup = guarded(name, || probe.cleanup(ctx, kernel));

    let outcome = match lifecycle {
        Guarded::Completed(Ok(())) => Outcome::Pass,
        Guarded::Completed(Err(err)) => {
            debug!(probe = %name, error = %err, "Probe did not pass");
            err.into_outcome()
        }
        Guarded::Panicked(msg) => ProbeError::Panicked(msg).into_outcome(),
    };

    match cleanup {
        Guarded::Panicked(msg) if outcome.is_pass() => {
            warn!(probe = %name, "Cleanup panicked after a passing probe");
            (
                ProbeError::Panicked(format!("cleanup: {}", msg)).into_outcome(),
                evidence,
            )
        }
        _ => (outcome, evidence),
    }
}

/// Shared resources of a probe group, released when the group ends
pub trait GroupContext: Default {
    /// Release whatever the group's probes left behind
    fn teardown(&mut self, _kernel: &dyn Kernel) {}
}

/// Group as the sequencer sees it
pub trait RunnableGroup {
    fn name(&self) -> &str;

    fn specs(&self) -> Vec<&ProbeSpec>;

    fn run(&self, kernel: &dyn Kernel, session: &mut Session<'_>) -> Result<()>;
}

/// Ordered probes sharing one context
pub struct ProbeGroup<C> {
    name: &'static str,
    probes: Vec<Box<dyn DynProbe<C>>>,
}

impl<C: GroupContext> ProbeGroup<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            probes: Vec::new(),
        }
    }

    /// Append a probe; declaration order is execution order
    pub fn with<P>(mut self, probe: P) -> Self
    where
        P: Probe<Context = C> + 'static,
    {
        self.probes.push(Box::new(probe));
        self
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

impl<C: GroupContext> RunnableGroup for ProbeGroup<C> {
    fn name(&self) -> &str {
        self.name
    }

    fn specs(&self) -> Vec<&ProbeSpec> {
        self.probes.iter().map(|p| p.spec()).collect()
    }

    fn run(&self, kernel: &dyn Kernel, session: &mut Session<'_>) -> Result<()> {
        session.begin_group(self.name)?;

        let mut ctx = C::default();
        let result = self
            .probes
            .iter()
            .try_for_each(|probe| session.execute(self.name, probe.as_ref(), &mut ctx, kernel));

        if let Guarded::Panicked(msg) = guarded(self.name, || ctx.teardown(kernel)) {
            warn!(group = %self.name, panic_msg = %msg, "Group teardown panicked");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, Syscall};
    use crate::port::kernel::mocks::MockKernel;
    use std::cell::Cell;

    #[derive(Default)]
    struct Ctx {
        cleanups: Cell<usize>,
    }

    impl GroupContext for Ctx {}

    enum Behavior {
        Pass,
        SetupFails,
        AssertFails,
        Panics,
    }

    struct TestProbe {
        spec: ProbeSpec,
        behavior: Behavior,
    }

    impl TestProbe {
        fn new(behavior: Behavior) -> Self {
            Self {
                spec: ProbeSpec::new("test", &[Syscall::Getpid]),
                behavior,
            }
        }
    }

    impl Probe for TestProbe {
        type Context = Ctx;
        type Observed = i32;

        fn spec(&self) -> &ProbeSpec {
            &self.spec
        }

        fn setup(&self, _ctx: &mut Ctx, _kernel: &dyn Kernel) -> crate::domain::error::Result<()> {
            match self.behavior {
                Behavior::SetupFails => Err(ProbeError::setup("no resource")),
                _ => Ok(()),
            }
        }

        fn invoke(&self, _ctx: &mut Ctx, kernel: &dyn Kernel) -> crate::domain::error::Result<i32> {
            if let Behavior::Panics = self.behavior {
                panic!("probe body exploded");
            }
            Ok(kernel.getpid()?)
        }

        fn check(
            &self,
            _ctx: &mut Ctx,
            pid: i32,
            evidence: &mut Evidence,
        ) -> crate::domain::error::Result<()> {
            evidence.push("pid", pid);
            match self.behavior {
                Behavior::AssertFails => Err(ProbeError::assertion("pid rejected", None)),
                _ => Ok(()),
            }
        }

        fn cleanup(&self, ctx: &mut Ctx, _kernel: &dyn Kernel) {
            ctx.cleanups.set(ctx.cleanups.get() + 1);
        }
    }

    #[test]
    fn test_pass_runs_cleanup() {
        let kernel = MockKernel::new();
        let mut ctx = Ctx::default();
        let (outcome, evidence) = run_probe(&TestProbe::new(Behavior::Pass), &mut ctx, &kernel);

        assert!(outcome.is_pass());
        assert_eq!(evidence.get("pid"), Some("100"));
        assert_eq!(ctx.cleanups.get(), 1);
    }

    #[test]
    fn test_setup_failure_skips_but_cleans_up() {
        let kernel = MockKernel::new();
        let mut ctx = Ctx::default();
        let (outcome, _) = run_probe(&TestProbe::new(Behavior::SetupFails), &mut ctx, &kernel);

        assert!(outcome.is_skipped());
        assert_eq!(kernel.call_count(Syscall::Getpid), 0);
        assert_eq!(ctx.cleanups.get(), 1);
    }

    #[test]
    fn test_assertion_failure_cleans_up() {
        let kernel = MockKernel::new();
        let mut ctx = Ctx::default();
        let (outcome, _) = run_probe(&TestProbe::new(Behavior::AssertFails), &mut ctx, &kernel);

        assert_eq!(outcome.diagnosis().unwrap().kind, FailureKind::AssertionFailure);
        assert_eq!(ctx.cleanups.get(), 1);
    }

    #[test]
    fn test_panic_becomes_fail_and_cleans_up() {
        let kernel = MockKernel::new();
        let mut ctx = Ctx::default();
        let (outcome, _) = run_probe(&TestProbe::new(Behavior::Panics), &mut ctx, &kernel);

        let diagnosis = outcome.diagnosis().unwrap();
        assert!(outcome.is_fail());
        assert_eq!(diagnosis.kind, FailureKind::Panicked);
        assert!(diagnosis.message.contains("exploded"));
        assert_eq!(ctx.cleanups.get(), 1);
    }

    #[test]
    fn test_syscall_error_is_unexpected() {
        let kernel = MockKernel::new().failing(Syscall::Getpid, nix::errno::Errno::EPERM);
        let mut ctx = Ctx::default();
        let (outcome, _) = run_probe(&TestProbe::new(Behavior::Pass), &mut ctx, &kernel);

        let diagnosis = outcome.diagnosis().unwrap();
        assert_eq!(diagnosis.kind, FailureKind::UnexpectedSyscallError);
        assert_eq!(diagnosis.errno_name.as_deref(), Some("EPERM"));
    }
}

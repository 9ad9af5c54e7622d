// Process-lifecycle probes: execve on a missing path, then on an existing one
//
// The missing path goes first: under the replace model the existing-path
// probe ends the process.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::application::config::HarnessConfig;
use crate::application::constants::{EXEC_SENTINEL, NULL_DEVICE};
use crate::application::runner::{GroupContext, ProbeGroup};
use crate::domain::error::Result;
use crate::domain::{
    Evidence, ExecModel, ExecRequest, Probe, ProbeError, ProbeSpec, ProcessSpawnResult, Syscall,
};
use crate::error::Result as HarnessResult;
use crate::port::{Kernel, SysResult, SyscallError};

pub const GROUP: &str = "process_lifecycle";

#[derive(Debug, Default)]
pub struct LifecycleContext {
    /// Caller pid right before the execve under test
    pub pid_before: Option<i32>,
    /// Descriptor held open across the failed execve
    pub witness_fd: Option<i32>,
    /// Heap cell holding `EXEC_SENTINEL` across the failed execve
    pub sentinel: Box<AtomicU64>,
}

impl GroupContext for LifecycleContext {
    fn teardown(&mut self, kernel: &dyn Kernel) {
        if let Some(fd) = self.witness_fd.take() {
            if let Err(e) = kernel.close(fd) {
                warn!(fd, error = %e, "Failed to close witness descriptor");
            }
        }
    }
}

fn spawn_result(result: SysResult<i64>) -> ProcessSpawnResult {
    match result {
        Ok(ret) => ProcessSpawnResult { ret, errno: None },
        Err(e) => ProcessSpawnResult {
            ret: e.ret,
            errno: Some(e.errno),
        },
    }
}

fn push_result(evidence: &mut Evidence, request: &ExecRequest, result: &ProcessSpawnResult) {
    evidence.push("path", request.path_lossy());
    evidence.push("ret", format!("{:#x}", result.ret));
    if let Some(errno) = result.errno {
        evidence.push("errno", format!("{:?} ({})", errno, errno as i32));
    }
}

fn unexpected(result: &ProcessSpawnResult) -> ProbeError {
    let errno = result.errno.unwrap_or(Errno::UnknownErrno);
    SyscallError::new(Syscall::Execve, result.ret, errno).into()
}

#[derive(Debug, Clone, Copy)]
pub struct MissingExecObservation {
    pub result: ProcessSpawnResult,
    pub pid_after: i32,
    /// Read on the witness descriptor after the call
    pub witness_read: SysResult<usize>,
    pub sentinel_after: u64,
}

/// execve on a path that does not exist: ENOENT under either process model,
/// and the caller must come out unchanged (same pid, descriptors still open,
/// memory untouched)
pub struct ExecMissingProbe {
    spec: ProbeSpec,
    request: ExecRequest,
}

impl ExecMissingProbe {
    pub fn new(request: ExecRequest) -> Self {
        Self {
            spec: ProbeSpec::new("execve_missing", &[Syscall::Execve]),
            request,
        }
    }
}

impl Probe for ExecMissingProbe {
    type Context = LifecycleContext;
    type Observed = MissingExecObservation;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, ctx: &mut LifecycleContext, kernel: &dyn Kernel) -> Result<()> {
        let pid = kernel
            .getpid()
            .map_err(|e| ProbeError::setup_syscall("getpid before execve", &e))?;
        ctx.pid_before = Some(pid);

        let fd = kernel
            .openat(nix::libc::AT_FDCWD, NULL_DEVICE, OFlag::O_RDONLY.bits(), 0)
            .map_err(|e| ProbeError::setup_syscall("open witness descriptor", &e))?;
        ctx.witness_fd = Some(fd);
        ctx.sentinel.store(EXEC_SENTINEL, Ordering::SeqCst);
        Ok(())
    }

    fn invoke(&self, ctx: &mut LifecycleContext, kernel: &dyn Kernel) -> Result<MissingExecObservation> {
        let fd = ctx
            .witness_fd
            .ok_or_else(|| ProbeError::setup("no witness descriptor"))?;
        let result = spawn_result(kernel.execve(&self.request));
        let pid_after = kernel.getpid()?;
        let witness_read = kernel.read(fd, &mut [0u8; 1]);
        Ok(MissingExecObservation {
            result,
            pid_after,
            witness_read,
            sentinel_after: ctx.sentinel.load(Ordering::SeqCst),
        })
    }

    fn check(
        &self,
        ctx: &mut LifecycleContext,
        observed: MissingExecObservation,
        evidence: &mut Evidence,
    ) -> Result<()> {
        let result = observed.result;
        push_result(evidence, &self.request, &result);

        if result.succeeded() {
            return Err(ProbeError::assertion(
                "execve of a missing path reported success",
                Some(result.raw()),
            ));
        }
        if result.errno != Some(Errno::ENOENT) {
            return Err(unexpected(&result));
        }
        if let Some(pid_before) = ctx.pid_before {
            if pid_before != observed.pid_after {
                return Err(ProbeError::assertion(
                    format!(
                        "caller pid changed from {} to {} across a failed execve",
                        pid_before, observed.pid_after
                    ),
                    Some(result.raw()),
                ));
            }
        }
        if let Err(e) = observed.witness_read {
            return Err(ProbeError::assertion(
                format!("descriptor open before execve is unusable after it: {}", e),
                Some(e.raw()),
            ));
        }
        if observed.sentinel_after != EXEC_SENTINEL {
            return Err(ProbeError::assertion(
                format!(
                    "memory changed across a failed execve: {:#x} became {:#x}",
                    EXEC_SENTINEL, observed.sentinel_after
                ),
                Some(result.raw()),
            ));
        }
        Ok(())
    }

    fn cleanup(&self, ctx: &mut LifecycleContext, kernel: &dyn Kernel) {
        ctx.pid_before = None;
        if let Some(fd) = ctx.witness_fd.take() {
            if let Err(e) = kernel.close(fd) {
                warn!(fd, error = %e, "Failed to close witness descriptor");
            }
        }
    }
}

/// execve on an existing executable, judged by the configured process model.
///
/// Replace: success never comes back, so reaching `check` with a success
/// value is itself the failure. Spawn: success comes back and the run goes on.
pub struct ExecExistingProbe {
    spec: ProbeSpec,
    request: ExecRequest,
    model: ExecModel,
}

impl ExecExistingProbe {
    pub fn new(request: ExecRequest, model: ExecModel) -> Self {
        let spec = ProbeSpec::new("execve_existing", &[Syscall::Execve]);
        let spec = match model {
            ExecModel::Replace => spec.not_returning(),
            ExecModel::Spawn => spec,
        };
        Self {
            spec,
            request,
            model,
        }
    }
}

impl Probe for ExecExistingProbe {
    type Context = LifecycleContext;
    type Observed = ProcessSpawnResult;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn invoke(&self, _ctx: &mut LifecycleContext, kernel: &dyn Kernel) -> Result<ProcessSpawnResult> {
        Ok(spawn_result(kernel.execve(&self.request)))
    }

    fn check(
        &self,
        _ctx: &mut LifecycleContext,
        result: ProcessSpawnResult,
        evidence: &mut Evidence,
    ) -> Result<()> {
        push_result(evidence, &self.request, &result);
        evidence.push("model", self.model);

        if !result.succeeded() {
            return Err(unexpected(&result));
        }
        match self.model {
            ExecModel::Spawn => Ok(()),
            ExecModel::Replace => Err(ProbeError::assertion(
                "execve returned to the caller, expected the process image to be replaced",
                Some(result.raw()),
            )),
        }
    }
}

pub fn group(config: &HarnessConfig) -> HarnessResult<ProbeGroup<LifecycleContext>> {
    Ok(ProbeGroup::new(GROUP)
        .with(ExecMissingProbe::new(config.missing_exec_request()?))
        .with(ExecExistingProbe::new(
            config.exec_request()?,
            config.exec_model,
        )))
}

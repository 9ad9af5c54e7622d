// File probes: open, openat, read, close

use nix::errno::Errno;
use nix::fcntl::OFlag;
use std::ffi::CStr;
use tracing::warn;

use crate::application::config::HarnessConfig;
use crate::application::constants::{BOGUS_DIRFD, CREATE_MODE, NULL_DEVICE};
use crate::application::runner::{GroupContext, ProbeGroup};
use crate::domain::error::Result;
use crate::domain::{Evidence, Probe, ProbeError, ProbeSpec, RawReturn, Syscall};
use crate::port::Kernel;

pub const GROUP: &str = "files";

/// Descriptors opened by the group, closed by the close probe or at teardown
#[derive(Debug, Default)]
pub struct FilesContext {
    pub fds: Vec<i32>,
    /// Descriptor the read probe reads from
    pub read_fd: Option<i32>,
}

impl GroupContext for FilesContext {
    fn teardown(&mut self, kernel: &dyn Kernel) {
        for fd in self.fds.drain(..) {
            if let Err(e) = kernel.close(fd) {
                warn!(fd, error = %e, "Failed to close leftover descriptor");
            }
        }
    }
}

fn check_fd(fd: i32, evidence: &mut Evidence) -> Result<()> {
    evidence.push("fd", fd);
    if fd < 0 {
        return Err(ProbeError::assertion(
            format!("descriptor {} is negative", fd),
            Some(RawReturn::ok(fd as i64)),
        ));
    }
    Ok(())
}

pub struct OpenProbe {
    spec: ProbeSpec,
    path: &'static CStr,
}

impl OpenProbe {
    pub fn new(path: &'static CStr) -> Self {
        Self {
            spec: ProbeSpec::new("open", &[Syscall::Open]),
            path,
        }
    }
}

impl Probe for OpenProbe {
    type Context = FilesContext;
    type Observed = i32;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, _ctx: &mut FilesContext, kernel: &dyn Kernel) -> Result<()> {
        if !kernel.supports(Syscall::Open) {
            return Err(ProbeError::setup(
                "open is not part of this architecture's syscall ABI",
            ));
        }
        Ok(())
    }

    fn invoke(&self, _ctx: &mut FilesContext, kernel: &dyn Kernel) -> Result<i32> {
        Ok(kernel.open(self.path, OFlag::O_CREAT.bits(), CREATE_MODE)?)
    }

    fn check(&self, ctx: &mut FilesContext, fd: i32, evidence: &mut Evidence) -> Result<()> {
        ctx.fds.push(fd);
        check_fd(fd, evidence)?;
        ctx.read_fd = Some(fd);
        Ok(())
    }
}

/// openat with a bogus dirfd and an absolute path: dirfd must be ignored
pub struct OpenatProbe {
    spec: ProbeSpec,
    dirfd: i32,
    path: &'static CStr,
}

impl OpenatProbe {
    pub fn new(dirfd: i32, path: &'static CStr) -> Self {
        Self {
            spec: ProbeSpec::new("openat", &[Syscall::Openat]),
            dirfd,
            path,
        }
    }
}

impl Probe for OpenatProbe {
    type Context = FilesContext;
    type Observed = i32;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn invoke(&self, _ctx: &mut FilesContext, kernel: &dyn Kernel) -> Result<i32> {
        match kernel.openat(self.dirfd, self.path, OFlag::O_CREAT.bits(), CREATE_MODE) {
            Ok(fd) => Ok(fd),
            Err(e) if e.errno == Errno::EBADF => Err(ProbeError::assertion(
                format!("dirfd {} was consulted for an absolute path", self.dirfd),
                Some(e.raw()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn check(&self, ctx: &mut FilesContext, fd: i32, evidence: &mut Evidence) -> Result<()> {
        ctx.fds.push(fd);
        evidence.push("dirfd", self.dirfd);
        check_fd(fd, evidence)
    }
}

/// Read from the null device: must return end-of-file immediately
pub struct ReadProbe {
    spec: ProbeSpec,
    path: &'static CStr,
}

impl ReadProbe {
    pub fn new(path: &'static CStr) -> Self {
        Self {
            spec: ProbeSpec::new("read", &[Syscall::Read]),
            path,
        }
    }
}

impl Probe for ReadProbe {
    type Context = FilesContext;
    type Observed = usize;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, ctx: &mut FilesContext, kernel: &dyn Kernel) -> Result<()> {
        if ctx.read_fd.is_some() {
            return Ok(());
        }
        let fd = kernel
            .openat(nix::libc::AT_FDCWD, self.path, OFlag::O_RDONLY.bits(), 0)
            .map_err(|e| ProbeError::setup_syscall("open read target", &e))?;
        ctx.fds.push(fd);
        ctx.read_fd = Some(fd);
        Ok(())
    }

    fn invoke(&self, ctx: &mut FilesContext, kernel: &dyn Kernel) -> Result<usize> {
        let fd = ctx
            .read_fd
            .ok_or_else(|| ProbeError::setup("no descriptor to read from"))?;
        let mut buf = [0u8; 2];
        Ok(kernel.read(fd, &mut buf)?)
    }

    fn check(&self, _ctx: &mut FilesContext, n: usize, evidence: &mut Evidence) -> Result<()> {
        evidence.push("bytes_read", n);
        if n != 0 {
            return Err(ProbeError::assertion(
                format!("expected end-of-file, got {} bytes", n),
                Some(RawReturn::ok(n as i64)),
            ));
        }
        Ok(())
    }
}

/// Close every descriptor the group opened
pub struct CloseProbe {
    spec: ProbeSpec,
}

impl CloseProbe {
    pub fn new() -> Self {
        Self {
            spec: ProbeSpec::new("close", &[Syscall::Close]),
        }
    }
}

impl Default for CloseProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for CloseProbe {
    type Context = FilesContext;
    type Observed = Vec<i32>;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, ctx: &mut FilesContext, _kernel: &dyn Kernel) -> Result<()> {
        if ctx.fds.is_empty() {
            return Err(ProbeError::setup("no descriptors were opened"));
        }
        Ok(())
    }

    fn invoke(&self, ctx: &mut FilesContext, kernel: &dyn Kernel) -> Result<Vec<i32>> {
        let mut closed = Vec::with_capacity(ctx.fds.len());
        // The descriptor is gone even when close fails; never retried
        while let Some(fd) = ctx.fds.pop() {
            kernel.close(fd)?;
            closed.push(fd);
        }
        ctx.read_fd = None;
        Ok(closed)
    }

    fn check(&self, _ctx: &mut FilesContext, closed: Vec<i32>, evidence: &mut Evidence) -> Result<()> {
        let list: Vec<String> = closed.iter().map(|fd| fd.to_string()).collect();
        evidence.push("closed", list.join(","));
        Ok(())
    }
}

pub fn group(_config: &HarnessConfig) -> ProbeGroup<FilesContext> {
    ProbeGroup::new(GROUP)
        .with(OpenProbe::new(NULL_DEVICE))
        .with(OpenatProbe::new(BOGUS_DIRFD, NULL_DEVICE))
        .with(ReadProbe::new(NULL_DEVICE))
        .with(CloseProbe::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::runner::run_probe;
    use crate::domain::FailureKind;
    use crate::port::kernel::mocks::MockKernel;

    #[test]
    fn test_open_read_close_sequence() {
        let kernel = MockKernel::new();
        let mut ctx = FilesContext::default();

        let (open, evidence) = run_probe(&OpenProbe::new(NULL_DEVICE), &mut ctx, &kernel);
        assert!(open.is_pass());
        assert_eq!(evidence.get("fd"), Some("3"));

        let (openat, _) = run_probe(&OpenatProbe::new(BOGUS_DIRFD, NULL_DEVICE), &mut ctx, &kernel);
        assert!(openat.is_pass());

        let (read, evidence) = run_probe(&ReadProbe::new(NULL_DEVICE), &mut ctx, &kernel);
        assert!(read.is_pass());
        assert_eq!(evidence.get("bytes_read"), Some("0"));

        let (close, evidence) = run_probe(&CloseProbe::new(), &mut ctx, &kernel);
        assert!(close.is_pass());
        assert_eq!(evidence.get("closed"), Some("4,3"));
        assert!(ctx.fds.is_empty());
        assert_eq!(kernel.closed_fds(), vec![4, 3]);
    }

    #[test]
    fn test_openat_ebadf_is_assertion_failure() {
        let kernel = MockKernel::new().failing(Syscall::Openat, Errno::EBADF);
        let (outcome, _) = run_probe(
            &OpenatProbe::new(BOGUS_DIRFD, NULL_DEVICE),
            &mut FilesContext::default(),
            &kernel,
        );

        let diagnosis = outcome.diagnosis().unwrap();
        assert_eq!(diagnosis.kind, FailureKind::AssertionFailure);
        assert_eq!(diagnosis.errno_name.as_deref(), Some("EBADF"));
    }

    #[test]
    fn test_read_opens_its_own_descriptor() {
        let kernel = MockKernel::new();
        let mut ctx = FilesContext::default();
        let (outcome, _) = run_probe(&ReadProbe::new(NULL_DEVICE), &mut ctx, &kernel);

        assert!(outcome.is_pass());
        assert_eq!(ctx.fds, vec![3]);

        ctx.teardown(&kernel);
        assert_eq!(kernel.closed_fds(), vec![3]);
    }

    #[test]
    fn test_close_without_descriptors_is_skipped() {
        let kernel = MockKernel::new();
        let (outcome, _) = run_probe(&CloseProbe::new(), &mut FilesContext::default(), &kernel);
        assert!(outcome.is_skipped());
    }
}

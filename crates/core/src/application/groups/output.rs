// Output probes: write, writev

use crate::application::config::HarnessConfig;
use crate::application::runner::{GroupContext, ProbeGroup};
use crate::domain::error::Result;
use crate::domain::{Evidence, Probe, ProbeError, ProbeSpec, RawReturn, Syscall};
use crate::port::Kernel;

pub const GROUP: &str = "output";

const WRITE_MESSAGE: &[u8] = b"sysprobe: write\n";
const WRITEV_PARTS: [&[u8]; 4] = [b"hello ", b"world!", b"hello ", b"\n"];

#[derive(Debug, Default)]
pub struct OutputContext;

impl GroupContext for OutputContext {}

fn check_length(written: usize, expected: usize, evidence: &mut Evidence) -> Result<()> {
    evidence.push("bytes_written", written);
    if written != expected {
        return Err(ProbeError::assertion(
            format!("short write: {} of {} bytes", written, expected),
            Some(RawReturn::ok(written as i64)),
        ));
    }
    Ok(())
}

pub struct WriteProbe {
    spec: ProbeSpec,
    fd: i32,
}

impl WriteProbe {
    pub fn new(fd: i32) -> Self {
        Self {
            spec: ProbeSpec::new("write", &[Syscall::Write]),
            fd,
        }
    }
}

impl Probe for WriteProbe {
    type Context = OutputContext;
    type Observed = usize;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn invoke(&self, _ctx: &mut OutputContext, kernel: &dyn Kernel) -> Result<usize> {
        Ok(kernel.write(self.fd, WRITE_MESSAGE)?)
    }

    fn check(&self, _ctx: &mut OutputContext, written: usize, evidence: &mut Evidence) -> Result<()> {
        check_length(written, WRITE_MESSAGE.len(), evidence)
    }
}

/// Gathered write of several iovecs; the kernel must consume all of them in order
pub struct WritevProbe {
    spec: ProbeSpec,
    fd: i32,
}

impl WritevProbe {
    pub fn new(fd: i32) -> Self {
        Self {
            spec: ProbeSpec::new("writev", &[Syscall::Writev]),
            fd,
        }
    }
}

impl Probe for WritevProbe {
    type Context = OutputContext;
    type Observed = usize;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn invoke(&self, _ctx: &mut OutputContext, kernel: &dyn Kernel) -> Result<usize> {
        Ok(kernel.writev(self.fd, &WRITEV_PARTS)?)
    }

    fn check(&self, _ctx: &mut OutputContext, written: usize, evidence: &mut Evidence) -> Result<()> {
        evidence.push("iovecs", WRITEV_PARTS.len());
        let expected = WRITEV_PARTS.iter().map(|p| p.len()).sum();
        check_length(written, expected, evidence)
    }
}

pub fn group(config: &HarnessConfig) -> ProbeGroup<OutputContext> {
    ProbeGroup::new(GROUP)
        .with(WriteProbe::new(config.output_fd))
        .with(WritevProbe::new(config.output_fd))
}

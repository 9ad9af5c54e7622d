// Memory probes: brk, then an mmap -> mincore -> munmap triad per mapping length

use std::collections::BTreeMap;
use tracing::warn;

use crate::application::config::HarnessConfig;
use crate::application::constants::{MINCORE_GUARD_BYTE, MINCORE_GUARD_LEN};
use crate::application::runner::{GroupContext, ProbeGroup};
use crate::domain::error::Result;
use crate::domain::{
    residency_len, Evidence, MapRequest, MemoryRegion, Probe, ProbeError, ProbeSpec, RawReturn,
    Syscall,
};
use crate::port::Kernel;

pub const GROUP: &str = "memory";

/// Live mappings, keyed by requested length
#[derive(Debug, Default)]
pub struct MemoryContext {
    pub regions: BTreeMap<usize, MemoryRegion>,
}

impl GroupContext for MemoryContext {
    fn teardown(&mut self, kernel: &dyn Kernel) {
        for (length, region) in std::mem::take(&mut self.regions) {
            let base = region.base();
            if let Err(e) = kernel.munmap(region) {
                warn!(base, length, error = %e, "Failed to release mapping");
            }
        }
    }
}

/// Current program break via brk(0)
pub struct BrkProbe {
    spec: ProbeSpec,
}

impl BrkProbe {
    pub fn new() -> Self {
        Self {
            spec: ProbeSpec::new("brk", &[Syscall::Brk]),
        }
    }
}

impl Default for BrkProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for BrkProbe {
    type Context = MemoryContext;
    type Observed = usize;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn invoke(&self, _ctx: &mut MemoryContext, kernel: &dyn Kernel) -> Result<usize> {
        Ok(kernel.brk(0)?)
    }

    fn check(&self, _ctx: &mut MemoryContext, brk: usize, evidence: &mut Evidence) -> Result<()> {
        evidence.push("break", format!("{:#x}", brk));
        if brk == 0 {
            return Err(ProbeError::assertion(
                "program break is null",
                Some(RawReturn::ok(0)),
            ));
        }
        Ok(())
    }
}

pub struct MmapProbe {
    spec: ProbeSpec,
    request: MapRequest,
    page_size: usize,
}

impl MmapProbe {
    pub fn new(length: usize, page_size: usize) -> Self {
        Self {
            spec: ProbeSpec::new(format!("mmap[{:#x}]", length), &[Syscall::Mmap]),
            request: MapRequest::anonymous_read_only(length),
            page_size,
        }
    }
}

impl Probe for MmapProbe {
    type Context = MemoryContext;
    type Observed = MemoryRegion;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn invoke(&self, _ctx: &mut MemoryContext, kernel: &dyn Kernel) -> Result<MemoryRegion> {
        Ok(kernel.mmap(&self.request)?)
    }

    fn check(
        &self,
        ctx: &mut MemoryContext,
        region: MemoryRegion,
        evidence: &mut Evidence,
    ) -> Result<()> {
        let base = region.base();
        evidence.push("addr", format!("{:#x}", base));
        evidence.push("length", format!("{:#x}", region.len()));

        let aligned = region.is_page_aligned(self.page_size);
        // Even a bad mapping gets released at teardown
        if base != 0 {
            ctx.regions.insert(self.request.length, region);
        }

        if base == 0 {
            return Err(ProbeError::assertion(
                "mmap returned a null address",
                Some(RawReturn::ok(0)),
            ));
        }
        if !aligned {
            return Err(ProbeError::assertion(
                format!("address {:#x} is not {:#x}-aligned", base, self.page_size),
                Some(RawReturn::ok(base as i64)),
            ));
        }
        Ok(())
    }
}

/// Residency query over a mapping made by the matching mmap probe.
///
/// The vector handed to the kernel carries `MINCORE_GUARD_LEN` guard bytes
/// past the expected entries, so both truncation and overrun are visible.
pub struct MincoreProbe {
    spec: ProbeSpec,
    length: usize,
    page_size: usize,
}

impl MincoreProbe {
    pub fn new(length: usize, page_size: usize) -> Self {
        Self {
            spec: ProbeSpec::new(format!("mincore[{:#x}]", length), &[Syscall::Mincore]),
            length,
            page_size,
        }
    }

    fn expected_entries(&self) -> usize {
        residency_len(self.length, self.page_size)
    }
}

impl Probe for MincoreProbe {
    type Context = MemoryContext;
    type Observed = Vec<u8>;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, ctx: &mut MemoryContext, _kernel: &dyn Kernel) -> Result<()> {
        if !ctx.regions.contains_key(&self.length) {
            return Err(ProbeError::setup(format!(
                "no live mapping of length {:#x}",
                self.length
            )));
        }
        Ok(())
    }

    fn invoke(&self, ctx: &mut MemoryContext, kernel: &dyn Kernel) -> Result<Vec<u8>> {
        let region = ctx
            .regions
            .get(&self.length)
            .ok_or_else(|| ProbeError::setup("mapping vanished before mincore"))?;
        let mut vec = vec![MINCORE_GUARD_BYTE; self.expected_entries() + MINCORE_GUARD_LEN];
        kernel.mincore(region, &mut vec)?;
        Ok(vec)
    }

    fn check(&self, _ctx: &mut MemoryContext, vec: Vec<u8>, evidence: &mut Evidence) -> Result<()> {
        let expected = self.expected_entries();
        let (entries, guard) = vec.split_at(expected);

        let written = entries
            .iter()
            .take_while(|&&b| b != MINCORE_GUARD_BYTE)
            .count();
        let overrun = guard.iter().filter(|&&b| b != MINCORE_GUARD_BYTE).count();

        let residency: Vec<String> = entries[..written].iter().map(|b| (b & 1).to_string()).collect();
        evidence.push("expected_entries", expected);
        evidence.push("residency", residency.join(" "));

        if written != expected {
            return Err(ProbeError::assertion(
                format!("kernel filled {} of {} residency entries", written, expected),
                Some(RawReturn::ok(0)),
            ));
        }
        if overrun > 0 {
            return Err(ProbeError::assertion(
                format!(
                    "kernel wrote {} bytes past the {} residency entries",
                    overrun, expected
                ),
                Some(RawReturn::ok(0)),
            ));
        }
        Ok(())
    }
}

pub struct MunmapProbe {
    spec: ProbeSpec,
    length: usize,
}

impl MunmapProbe {
    pub fn new(length: usize) -> Self {
        Self {
            spec: ProbeSpec::new(format!("munmap[{:#x}]", length), &[Syscall::Munmap]),
            length,
        }
    }
}

impl Probe for MunmapProbe {
    type Context = MemoryContext;
    type Observed = usize;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn setup(&self, ctx: &mut MemoryContext, _kernel: &dyn Kernel) -> Result<()> {
        if !ctx.regions.contains_key(&self.length) {
            return Err(ProbeError::setup(format!(
                "no live mapping of length {:#x}",
                self.length
            )));
        }
        Ok(())
    }

    fn invoke(&self, ctx: &mut MemoryContext, kernel: &dyn Kernel) -> Result<usize> {
        let region = ctx
            .regions
            .remove(&self.length)
            .ok_or_else(|| ProbeError::setup("mapping vanished before munmap"))?;
        let base = region.base();
        kernel.munmap(region)?;
        Ok(base)
    }

    fn check(&self, _ctx: &mut MemoryContext, base: usize, evidence: &mut Evidence) -> Result<()> {
        evidence.push("released", format!("{:#x}", base));
        Ok(())
    }
}

pub fn group(config: &HarnessConfig) -> ProbeGroup<MemoryContext> {
    let page = config.page_size;
    config
        .map_lengths
        .iter()
        .fold(ProbeGroup::new(GROUP).with(BrkProbe::new()), |group, &length| {
            group
                .with(MmapProbe::new(length, page))
                .with(MincoreProbe::new(length, page))
                .with(MunmapProbe::new(length))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::runner::run_probe;
    use crate::domain::FailureKind;
    use crate::port::kernel::mocks::MockKernel;

    fn triad(kernel: &MockKernel, length: usize, ctx: &mut MemoryContext) -> Vec<crate::domain::Outcome> {
        let page = 0x1000;
        vec![
            run_probe(&MmapProbe::new(length, page), ctx, kernel).0,
            run_probe(&MincoreProbe::new(length, page), ctx, kernel).0,
            run_probe(&MunmapProbe::new(length), ctx, kernel).0,
        ]
    }

    #[test]
    fn test_triad_page_aligned_length() {
        let kernel = MockKernel::new();
        let mut ctx = MemoryContext::default();
        let outcomes = triad(&kernel, 0x8000, &mut ctx);

        assert!(outcomes.iter().all(|o| o.is_pass()), "{:?}", outcomes);
        assert!(ctx.regions.is_empty());
        assert_eq!(kernel.unmapped(), vec![0x7f00_0000_0000]);
    }

    #[test]
    fn test_mincore_rounds_up_partial_page() {
        let kernel = MockKernel::new();
        let mut ctx = MemoryContext::default();
        run_probe(&MmapProbe::new(0x2001, 0x1000), &mut ctx, &kernel);
        let (outcome, evidence) = run_probe(&MincoreProbe::new(0x2001, 0x1000), &mut ctx, &kernel);

        assert!(outcome.is_pass());
        assert_eq!(evidence.get("expected_entries"), Some("3"));
        assert_eq!(evidence.get("residency"), Some("0 0 0"));
    }

    #[test]
    fn test_mincore_truncation_fails() {
        // A kernel that truncates 0x2001 to two pages
        let kernel = MockKernel::new().with_mincore_entries(2);
        let mut ctx = MemoryContext::default();
        let outcomes = triad(&kernel, 0x2001, &mut ctx);

        assert!(outcomes[0].is_pass());
        let diagnosis = outcomes[1].diagnosis().unwrap();
        assert_eq!(diagnosis.kind, FailureKind::AssertionFailure);
        assert!(diagnosis.message.contains("2 of 3"));
        // munmap still runs after the failed query
        assert!(outcomes[2].is_pass());
    }

    #[test]
    fn test_mincore_overrun_fails() {
        let kernel = MockKernel::new().with_mincore_entries(10);
        let mut ctx = MemoryContext::default();
        let outcomes = triad(&kernel, 0x8000, &mut ctx);

        assert!(outcomes[1].diagnosis().unwrap().message.contains("2 bytes past"));
    }

    #[test]
    fn test_misaligned_mapping_fails_and_is_released() {
        let kernel = MockKernel::new().with_map_base(0x7f00_0000_0010);
        let mut group_ctx = MemoryContext::default();
        let (outcome, _) = run_probe(&MmapProbe::new(0x8000, 0x1000), &mut group_ctx, &kernel);

        assert!(outcome.is_fail());
        assert!(outcome.diagnosis().unwrap().message.contains("aligned"));

        group_ctx.teardown(&kernel);
        assert_eq!(kernel.unmapped(), vec![0x7f00_0000_0010]);
    }

    #[test]
    fn test_refused_mapping_skips_dependents() {
        let kernel = MockKernel::new().failing(Syscall::Mmap, nix::errno::Errno::ENOMEM);
        let mut ctx = MemoryContext::default();
        let outcomes = triad(&kernel, 0x8000, &mut ctx);

        assert!(outcomes[0].is_fail());
        assert!(outcomes[1].is_skipped());
        assert!(outcomes[2].is_skipped());
        assert_eq!(kernel.call_count(Syscall::Mincore), 0);
    }

    #[test]
    fn test_group_layout() {
        let group = group(&HarnessConfig::default());
        // brk + one triad per default length
        assert_eq!(group.len(), 1 + 3 * 2);
    }
}

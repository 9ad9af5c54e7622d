// System identification probe: uname

use crate::application::config::HarnessConfig;
use crate::application::runner::{GroupContext, ProbeGroup};
use crate::domain::error::Result;
use crate::domain::{Evidence, Probe, ProbeError, ProbeSpec, RawReturn, Syscall, UtsName};
use crate::port::Kernel;

pub const GROUP: &str = "system";

#[derive(Debug, Default)]
pub struct SystemContext;

impl GroupContext for SystemContext {}

/// All utsname fields go into the evidence for the auditor
pub struct UnameProbe {
    spec: ProbeSpec,
}

impl UnameProbe {
    pub fn new() -> Self {
        Self {
            spec: ProbeSpec::new("uname", &[Syscall::Uname]),
        }
    }
}

impl Default for UnameProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for UnameProbe {
    type Context = SystemContext;
    type Observed = UtsName;

    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn invoke(&self, _ctx: &mut SystemContext, kernel: &dyn Kernel) -> Result<UtsName> {
        Ok(kernel.uname()?)
    }

    fn check(&self, _ctx: &mut SystemContext, uts: UtsName, evidence: &mut Evidence) -> Result<()> {
        for (field, value) in uts.fields() {
            evidence.push(field, value);
        }
        if uts.sysname.is_empty() {
            return Err(ProbeError::assertion("sysname is empty", Some(RawReturn::ok(0))));
        }
        Ok(())
    }
}

pub fn group(_config: &HarnessConfig) -> ProbeGroup<SystemContext> {
    ProbeGroup::new(GROUP).with(UnameProbe::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::runner::run_probe;
    use crate::port::kernel::mocks::MockKernel;

    #[test]
    fn test_uname_fields_are_evidence() {
        let kernel = MockKernel::new();
        let (outcome, evidence) = run_probe(&UnameProbe::new(), &mut SystemContext, &kernel);

        assert!(outcome.is_pass());
        assert_eq!(evidence.get("sysname"), Some("Linux"));
        assert_eq!(evidence.get("machine"), Some("x86_64"));
        assert_eq!(evidence.iter().count(), 6);
    }

    #[test]
    fn test_empty_sysname_fails() {
        let mut evidence = Evidence::new();
        let err = UnameProbe::new()
            .check(&mut SystemContext, UtsName::default(), &mut evidence)
            .unwrap_err();
        assert!(err.to_string().contains("sysname"));
    }
}

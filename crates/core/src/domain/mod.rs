// Domain Layer - Probe model, outcomes and syscall-level entities

pub mod error;
pub mod memory;
pub mod outcome;
pub mod probe;
pub mod process;
pub mod syscall;
pub mod system;
pub mod thread;

// Re-exports
pub use error::ProbeError;
pub use memory::{residency_len, MapRequest, MemoryRegion};
pub use outcome::{Diagnosis, Evidence, FailureKind, Outcome, ProbeRecord, RawReturn, RunSummary};
pub use probe::{Probe, ProbeSpec};
pub use process::{ExecModel, ExecRequest, ProcessSpawnResult};
pub use syscall::Syscall;
pub use system::UtsName;
pub use thread::{
    FutexWord, ThreadAreaDescriptor, ThreadHandle, ThreadIdModel, ThreadResources, ThreadStack,
    TLS_SLOT_RANGE,
};

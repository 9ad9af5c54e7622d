// Port Layer - Interfaces for external dependencies

pub mod kernel;
pub mod reporter;
pub mod run_stamp;

// Re-exports
pub use kernel::{Kernel, SysResult, SyscallError};
pub use reporter::{Reporter, RunInfo};
pub use run_stamp::RunStamp;

// sysprobe Infrastructure - Kernel adapter
// Implements: Kernel (raw Linux-compatible syscalls)

#[cfg(target_os = "linux")]
pub mod raw_kernel;

#[cfg(target_os = "linux")]
pub use raw_kernel::RawKernel;

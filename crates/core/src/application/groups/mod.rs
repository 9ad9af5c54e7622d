// Probe groups, one module per related cluster of syscalls
//
// Each module exposes `group(&HarnessConfig)` building its probes in
// execution order.

pub mod concurrency;
pub mod files;
pub mod identity;
pub mod lifecycle;
pub mod memory;
pub mod output;
pub mod system;

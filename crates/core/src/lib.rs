// sysprobe Core - Probe Model, Ports & Sequencer
// NO raw syscalls here: the kernel is reached only through port::Kernel

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{HarnessError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Application Layer - probe groups, runner and sequencer

pub mod config;
pub mod constants;
pub mod groups;
pub mod panic_guard;
pub mod runner;
pub mod sequencer;

// Re-exports
pub use config::{HarnessConfig, ProbeFilter};
pub use runner::{run_probe, DynProbe, GroupContext, ProbeGroup, RunnableGroup};
pub use sequencer::{Sequencer, Session};

// Reporter Port - consumes probe results, never feeds back into the run

use crate::domain::{ProbeRecord, ProbeSpec, RunSummary};
use crate::error::Result;

/// Run metadata announced before the first group
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: String,
    pub started_at: i64, // epoch ms
    pub exec_model: crate::domain::ExecModel,
}

/// Outcome sink
///
/// Implementations must get every line out before returning: a probe may
/// write to the same stream through raw syscalls, and a replace-model execve
/// ends the process without unwinding.
pub trait Reporter {
    fn begin_run(&mut self, info: &RunInfo) -> Result<()>;

    fn begin_group(&mut self, group: &str) -> Result<()>;

    /// Called right before the probe's setup step
    fn begin_probe(&mut self, group: &str, spec: &ProbeSpec) -> Result<()>;

    fn record(&mut self, record: &ProbeRecord) -> Result<()>;

    /// Partial summary, emitted before a probe that may not return
    fn checkpoint(&mut self, summary: &RunSummary) -> Result<()>;

    fn finish(&mut self, summary: &RunSummary) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;

    /// Everything a RecordingReporter saw, in order
    #[derive(Debug, Clone)]
    pub enum ReportEvent {
        BeginRun(String),
        BeginGroup(String),
        BeginProbe(String),
        Record(ProbeRecord),
        Checkpoint(usize),
        Finish(usize),
    }

    /// Reporter that keeps events in memory
    #[derive(Debug, Default)]
    pub struct RecordingReporter {
        pub events: Vec<ReportEvent>,
    }

    impl RecordingReporter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn records(&self) -> Vec<&ProbeRecord> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    ReportEvent::Record(r) => Some(r),
                    _ => None,
                })
                .collect()
        }

        pub fn groups(&self) -> Vec<&str> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    ReportEvent::BeginGroup(g) => Some(g.as_str()),
                    _ => None,
                })
                .collect()
        }
    }

    impl Reporter for RecordingReporter {
        fn begin_run(&mut self, info: &RunInfo) -> Result<()> {
            self.events.push(ReportEvent::BeginRun(info.run_id.clone()));
            Ok(())
        }

        fn begin_group(&mut self, group: &str) -> Result<()> {
            self.events.push(ReportEvent::BeginGroup(group.to_string()));
            Ok(())
        }

        fn begin_probe(&mut self, _group: &str, spec: &ProbeSpec) -> Result<()> {
            self.events.push(ReportEvent::BeginProbe(spec.name.clone()));
            Ok(())
        }

        fn record(&mut self, record: &ProbeRecord) -> Result<()> {
            self.events.push(ReportEvent::Record(record.clone()));
            Ok(())
        }

        fn checkpoint(&mut self, summary: &RunSummary) -> Result<()> {
            self.events
                .push(ReportEvent::Checkpoint(summary.records.len()));
            Ok(())
        }

        fn finish(&mut self, summary: &RunSummary) -> Result<()> {
            self.events.push(ReportEvent::Finish(summary.records.len()));
            Ok(())
        }
    }
}

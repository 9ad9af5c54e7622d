// Sequencer - runs probe groups in declared order, one outcome per probe

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::config::{HarnessConfig, ProbeFilter};
use super::groups;
use super::runner::{DynProbe, RunnableGroup};
use crate::domain::{
    Diagnosis, Evidence, ExecModel, FailureKind, Outcome, ProbeRecord, ProbeSpec, RunSummary,
};
use crate::error::Result;
use crate::port::run_stamp::LiveStamp;
use crate::port::{Kernel, Reporter, RunInfo, RunStamp};

/// State of one run, handed to every group in turn
pub struct Session<'a> {
    reporter: &'a mut dyn Reporter,
    filter: &'a ProbeFilter,
    summary: RunSummary,
}

impl<'a> Session<'a> {
    fn new(reporter: &'a mut dyn Reporter, filter: &'a ProbeFilter, summary: RunSummary) -> Self {
        Self {
            reporter,
            filter,
            summary,
        }
    }

    pub fn begin_group(&mut self, group: &str) -> Result<()> {
        info!(group = %group, "Running probe group");
        self.reporter.begin_group(group)
    }

    /// Run (or skip) one probe and record its outcome.
    ///
    /// Only reporter errors come back as `Err`; the probe itself can't fail
    /// the run.
    pub fn execute<C>(
        &mut self,
        group: &str,
        probe: &dyn DynProbe<C>,
        ctx: &mut C,
        kernel: &dyn Kernel,
    ) -> Result<()> {
        let spec = probe.spec();

        if !self.filter.allows(group, &spec.name) {
            let outcome = Outcome::Skipped(Diagnosis::new(
                FailureKind::Disabled,
                "disabled by probe filter",
                None,
            ));
            return self.push(ProbeRecord::new(
                group,
                &spec.name,
                &spec.syscalls,
                outcome,
                Evidence::new(),
                Duration::ZERO,
            ));
        }

        if spec.may_not_return {
            info!(probe = %spec.name, "Probe may not return, emitting checkpoint");
            self.reporter.checkpoint(&self.summary)?;
        }

        self.reporter.begin_probe(group, spec)?;

        let started = Instant::now();
        let (outcome, evidence) = probe.run(ctx, kernel);
        let elapsed = started.elapsed();

        match &outcome {
            Outcome::Pass => info!(probe = %spec.name, "PASS"),
            Outcome::Fail(d) => warn!(probe = %spec.name, diagnosis = %d, "FAIL"),
            Outcome::Skipped(d) => warn!(probe = %spec.name, diagnosis = %d, "SKIPPED"),
        }

        self.push(ProbeRecord::new(
            group,
            &spec.name,
            &spec.syscalls,
            outcome,
            evidence,
            elapsed,
        ))
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    fn push(&mut self, record: ProbeRecord) -> Result<()> {
        self.reporter.record(&record)?;
        self.summary.push(record);
        Ok(())
    }

    fn into_summary(self) -> RunSummary {
        self.summary
    }
}

/// Fixed, ordered battery of probe groups
pub struct Sequencer {
    groups: Vec<Box<dyn RunnableGroup>>,
    filter: ProbeFilter,
    exec_model: ExecModel,
    stamp: Arc<dyn RunStamp>,
}

impl Sequencer {
    pub fn new(groups: Vec<Box<dyn RunnableGroup>>, filter: ProbeFilter) -> Self {
        Self {
            groups,
            filter,
            exec_model: ExecModel::Spawn,
            stamp: Arc::new(LiveStamp),
        }
    }

    /// The full battery, configured for the kernel under test.
    ///
    /// Group order: output, identity, files, memory, concurrency, system,
    /// process_lifecycle. Lifecycle goes last because a replace-model execve
    /// ends the process.
    pub fn standard(config: &HarnessConfig) -> Result<Self> {
        config.validate()?;

        let groups: Vec<Box<dyn RunnableGroup>> = vec![
            Box::new(groups::output::group(config)),
            Box::new(groups::identity::group(config)),
            Box::new(groups::files::group(config)),
            Box::new(groups::memory::group(config)),
            Box::new(groups::concurrency::group(config)),
            Box::new(groups::system::group(config)),
            Box::new(groups::lifecycle::group(config)?),
        ];

        let mut sequencer = Self::new(groups, config.filter.clone());
        sequencer.exec_model = config.exec_model;
        Ok(sequencer)
    }

    /// Deterministic run id and start time (tests)
    pub fn with_stamp(mut self, stamp: Arc<dyn RunStamp>) -> Self {
        self.stamp = stamp;
        self
    }

    /// Every probe in execution order, with its group and whether the filter lets it run
    pub fn plan(&self) -> Vec<(&str, &ProbeSpec, bool)> {
        self.groups
            .iter()
            .flat_map(|group| {
                let name = group.name();
                group
                    .specs()
                    .into_iter()
                    .map(move |spec| (name, spec, self.filter.allows(name, &spec.name)))
            })
            .collect()
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.name()).collect()
    }

    /// Run every group once, in order.
    ///
    /// Probe failures are recorded, never propagated. An `Err` means the
    /// reporter could not accept output.
    pub fn run(&self, kernel: &dyn Kernel, reporter: &mut dyn Reporter) -> Result<RunSummary> {
        let info = RunInfo {
            run_id: self.stamp.run_id(),
            started_at: self.stamp.started_at(),
            exec_model: self.exec_model,
        };

        info!(
            run_id = %info.run_id,
            groups = self.groups.len(),
            exec_model = %info.exec_model,
            "Starting probe run"
        );
        reporter.begin_run(&info)?;

        let mut session = Session::new(
            &mut *reporter,
            &self.filter,
            RunSummary::new(info.run_id.clone(), info.started_at),
        );
        for group in &self.groups {
            group.run(kernel, &mut session)?;
        }

        let mut summary = session.into_summary();
        summary.complete = true;

        info!(
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Probe run finished"
        );
        reporter.finish(&summary)?;

        Ok(summary)
    }
}

#[cfg(test)]
#[path = "sequencer_test.rs"]
mod sequencer_test;

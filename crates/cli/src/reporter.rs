//! Reporters: human-readable text and JSON lines.
//!
//! Both flush after every event. Probes write to stdout through raw
//! syscalls, and a replace-model execve ends the process without running
//! destructors, so nothing may sit in a buffer.

use std::io::Write;

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

use sysprobe_core::domain::{ExecModel, Outcome, ProbeRecord, ProbeSpec, RunSummary, Syscall};
use sysprobe_core::port::{Reporter, RunInfo};
use sysprobe_core::Result;

fn syscall_list(syscalls: &[Syscall]) -> String {
    syscalls
        .iter()
        .map(|s| s.name())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

#[derive(Tabled)]
struct SummaryRow {
    group: String,
    probe: String,
    verdict: String,
    detail: String,
}

impl From<&ProbeRecord> for SummaryRow {
    fn from(record: &ProbeRecord) -> Self {
        Self {
            group: record.group.clone(),
            probe: record.probe.clone(),
            verdict: record.outcome.to_string(),
            detail: record
                .outcome
                .diagnosis()
                .map(|d| d.to_string())
                .unwrap_or_default(),
        }
    }
}

/// Line-oriented audit log: group header, probe header naming the syscalls,
/// evidence lines, then an explicit verdict line
pub struct TextReporter<W: Write> {
    out: W,
    /// Probe whose header was printed last
    current: Option<String>,
}

impl<W: Write> TextReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out, current: None }
    }

    fn probe_header(&mut self, name: &str, syscalls: &[Syscall]) -> std::io::Result<()> {
        self.current = Some(name.to_string());
        writeln!(self.out, "--- {} [{}]", name.bold(), syscall_list(syscalls))
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn totals(summary: &RunSummary) -> String {
        format!(
            "{} passed, {} failed, {} skipped ({} probes)",
            summary.passed,
            summary.failed,
            summary.skipped,
            summary.records.len()
        )
    }
}

impl<W: Write> Reporter for TextReporter<W> {
    fn begin_run(&mut self, info: &RunInfo) -> Result<()> {
        writeln!(
            self.out,
            "{} run {} at {} (exec model: {})",
            "sysprobe".bold(),
            info.run_id,
            format_timestamp(info.started_at),
            info.exec_model
        )?;
        self.out.flush()?;
        Ok(())
    }

    fn begin_group(&mut self, group: &str) -> Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, "{}", format!("=== {} ===", group).cyan().bold())?;
        self.out.flush()?;
        Ok(())
    }

    fn begin_probe(&mut self, _group: &str, spec: &ProbeSpec) -> Result<()> {
        self.probe_header(&spec.name, &spec.syscalls)?;
        self.out.flush()?;
        Ok(())
    }

    fn record(&mut self, record: &ProbeRecord) -> Result<()> {
        // Filtered-out probes never get a begin_probe
        if self.current.as_deref() != Some(record.probe.as_str()) {
            self.probe_header(&record.probe, &record.syscalls)?;
        }
        for (key, value) in record.evidence.iter() {
            writeln!(self.out, "    {}: {}", key, value)?;
        }
        let verdict = match &record.outcome {
            Outcome::Pass => "PASS".green().bold(),
            Outcome::Fail(_) => "FAIL".red().bold(),
            Outcome::Skipped(_) => "SKIPPED".yellow().bold(),
        };
        match record.outcome.diagnosis() {
            Some(diagnosis) => writeln!(
                self.out,
                "    verdict: {} {} ({}us)",
                verdict, diagnosis, record.elapsed_us
            )?,
            None => writeln!(self.out, "    verdict: {} ({}us)", verdict, record.elapsed_us)?,
        }
        self.out.flush()?;
        Ok(())
    }

    fn checkpoint(&mut self, summary: &RunSummary) -> Result<()> {
        writeln!(
            self.out,
            "{} {}",
            "checkpoint:".yellow().bold(),
            Self::totals(summary)
        )?;
        self.out.flush()?;
        Ok(())
    }

    fn finish(&mut self, summary: &RunSummary) -> Result<()> {
        let rows: Vec<SummaryRow> = summary.records.iter().map(SummaryRow::from).collect();
        writeln!(self.out)?;
        writeln!(self.out, "{}", Table::new(rows))?;

        let totals = Self::totals(summary);
        if summary.has_failures() {
            writeln!(self.out, "{}", totals.red().bold())?;
        } else {
            writeln!(self.out, "{}", totals.green().bold())?;
        }
        self.out.flush()?;
        Ok(())
    }
}

/// One JSON object per line
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JsonLine<'a> {
    Run {
        run_id: &'a str,
        started_at: i64,
        exec_model: ExecModel,
    },
    Probe {
        group: &'a str,
        probe: &'a str,
        syscalls: &'a [Syscall],
        may_not_return: bool,
    },
    Record(&'a ProbeRecord),
    Checkpoint(Totals<'a>),
    Summary(Totals<'a>),
}

#[derive(Serialize)]
struct Totals<'a> {
    run_id: &'a str,
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    complete: bool,
}

impl<'a> From<&'a RunSummary> for Totals<'a> {
    fn from(summary: &'a RunSummary) -> Self {
        Self {
            run_id: &summary.run_id,
            total: summary.records.len(),
            passed: summary.passed,
            failed: summary.failed,
            skipped: summary.skipped,
            complete: summary.complete,
        }
    }
}

/// Machine-readable log: a line per probe start and per record, plus
/// checkpoint and summary lines. Group boundaries are implied by the records.
pub struct JsonLinesReporter<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, line: &JsonLine<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, line)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> Reporter for JsonLinesReporter<W> {
    fn begin_run(&mut self, info: &RunInfo) -> Result<()> {
        self.emit(&JsonLine::Run {
            run_id: &info.run_id,
            started_at: info.started_at,
            exec_model: info.exec_model,
        })
    }

    fn begin_group(&mut self, _group: &str) -> Result<()> {
        Ok(())
    }

    fn begin_probe(&mut self, group: &str, spec: &ProbeSpec) -> Result<()> {
        self.emit(&JsonLine::Probe {
            group,
            probe: &spec.name,
            syscalls: &spec.syscalls,
            may_not_return: spec.may_not_return,
        })
    }

    fn record(&mut self, record: &ProbeRecord) -> Result<()> {
        self.emit(&JsonLine::Record(record))
    }

    fn checkpoint(&mut self, summary: &RunSummary) -> Result<()> {
        self.emit(&JsonLine::Checkpoint(summary.into()))
    }

    fn finish(&mut self, summary: &RunSummary) -> Result<()> {
        self.emit(&JsonLine::Summary(summary.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use sysprobe_core::domain::{Diagnosis, Evidence, FailureKind, RawReturn};

    fn info() -> RunInfo {
        RunInfo {
            run_id: "run-1".to_string(),
            started_at: 1_700_000_000_000,
            exec_model: ExecModel::Spawn,
        }
    }

    fn summary() -> RunSummary {
        let mut evidence = Evidence::new();
        evidence.push("addr", "0x7f0000000000");
        let mut summary = RunSummary::new("run-1", 1_700_000_000_000);
        summary.push(ProbeRecord::new(
            "memory",
            "mmap[0x8000]",
            &[Syscall::Mmap],
            Outcome::Pass,
            evidence,
            Duration::from_micros(7),
        ));
        summary.push(ProbeRecord::new(
            "memory",
            "mincore[0x8000]",
            &[Syscall::Mincore],
            Outcome::Fail(Diagnosis::new(
                FailureKind::AssertionFailure,
                "kernel filled 7 of 8 residency entries",
                Some(RawReturn::ok(0)),
            )),
            Evidence::new(),
            Duration::from_micros(3),
        ));
        summary
    }

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_text_probe_header_names_syscalls() {
        let mut reporter = TextReporter::new(Vec::new());
        reporter.begin_group("concurrency").unwrap();
        reporter
            .begin_probe(
                "concurrency",
                &ProbeSpec::new("futex_wait_mismatch", &[Syscall::Futex, Syscall::Gettid]),
            )
            .unwrap();

        let out = text(reporter.into_inner());
        assert!(out.contains("=== concurrency ==="));
        assert!(out.contains("[futex, gettid]"));
    }

    #[test]
    fn test_text_record_has_evidence_and_verdict() {
        let summary = summary();
        let mut reporter = TextReporter::new(Vec::new());
        for record in &summary.records {
            reporter.record(record).unwrap();
        }

        let out = text(reporter.into_inner());
        assert!(out.contains("addr: 0x7f0000000000"));
        assert!(out.contains("PASS"));
        assert!(out.contains("FAIL"));
        assert!(out.contains("[ASSERTION_FAILURE] kernel filled 7 of 8 residency entries"));
        assert_eq!(out.matches("verdict:").count(), 2);
        // No begin_probe was seen, so each record printed its own header
        assert!(out.contains("[mincore]"));
    }

    #[test]
    fn test_text_finish_prints_table_and_totals() {
        let mut summary = summary();
        summary.complete = true;
        let mut reporter = TextReporter::new(Vec::new());
        reporter.finish(&summary).unwrap();

        let out = text(reporter.into_inner());
        assert!(out.contains("mincore[0x8000]"));
        assert!(out.contains("1 passed, 1 failed, 0 skipped (2 probes)"));
    }

    #[test]
    fn test_jsonl_emits_one_object_per_line() {
        let summary = summary();
        let mut reporter = JsonLinesReporter::new(Vec::new());
        reporter.begin_run(&info()).unwrap();
        reporter.begin_group("memory").unwrap();
        reporter
            .begin_probe("memory", &ProbeSpec::new("mmap[0x8000]", &[Syscall::Mmap]))
            .unwrap();
        reporter.record(&summary.records[0]).unwrap();
        reporter.checkpoint(&summary).unwrap();
        reporter.finish(&summary).unwrap();

        let out = text(reporter.into_inner());
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        let types: Vec<&str> = lines.iter().map(|l| l["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["run", "probe", "record", "checkpoint", "summary"]);
        assert_eq!(lines[0]["exec_model"], "spawn");
        assert_eq!(lines[1]["syscalls"][0], "mmap");
        assert_eq!(lines[2]["probe"], "mmap[0x8000]");
        assert_eq!(lines[2]["outcome"]["verdict"], "PASS");
        assert_eq!(lines[4]["failed"], 1);
        assert_eq!(lines[4]["total"], 2);
    }

    #[test]
    fn test_jsonl_failure_carries_raw_return() {
        let summary = summary();
        let mut reporter = JsonLinesReporter::new(Vec::new());
        reporter.record(&summary.records[1]).unwrap();

        let line: serde_json::Value =
            serde_json::from_str(text(reporter.into_inner()).trim()).unwrap();
        assert_eq!(line["outcome"]["verdict"], "FAIL");
        assert_eq!(line["outcome"]["kind"], "ASSERTION_FAILURE");
        assert_eq!(line["outcome"]["raw_return"], 0);
    }
}

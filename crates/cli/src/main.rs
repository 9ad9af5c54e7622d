//! sysprobe - syscall conformance harness
//!
//! Runs the probe battery against the kernel it is running on and writes the
//! audit log to stdout. The process always ends through `exit_group`.
//!
//! With `--format jsonl` the output group writes its payloads to stderr so
//! stdout stays one JSON object per line.

mod logging;
mod reporter;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use tabled::{Table, Tabled};
use tracing::info;

use sysprobe_core::application::constants::{
    DEFAULT_EXEC_TARGET, DEFAULT_PAGE_SIZE, EXIT_OK, EXIT_PROBE_FAILED, MISSING_EXEC_PATH,
    STDERR_FD, STDOUT_FD,
};
use sysprobe_core::application::{HarnessConfig, ProbeFilter, Sequencer};
use sysprobe_core::domain::{ExecModel, RunSummary, ThreadIdModel};

use crate::reporter::{JsonLinesReporter, TextReporter};

#[derive(Parser)]
#[command(name = "sysprobe")]
#[command(about = "Syscall conformance harness for Linux-compatible kernels", long_about = None)]
#[command(version)]
struct Cli {
    /// What a successful execve does on the kernel under test
    #[arg(long, env = "SYSPROBE_EXEC_MODEL", value_enum, default_value_t = ExecModelArg::Spawn)]
    exec_model: ExecModelArg,

    /// Existing executable used as the execve target
    #[arg(long, env = "SYSPROBE_EXEC_TARGET", default_value = DEFAULT_EXEC_TARGET)]
    exec_target: String,

    /// argv handed to the execve target
    #[arg(
        long,
        env = "SYSPROBE_EXEC_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_values = ["ls", "-l", "-a"]
    )]
    exec_args: Vec<String>,

    /// Path that must not exist
    #[arg(long, env = "SYSPROBE_MISSING_PATH", default_value = MISSING_EXEC_PATH)]
    missing_path: String,

    /// How the initial thread's tid relates to the pid
    #[arg(long, env = "SYSPROBE_TID_MODEL", value_enum, default_value_t = TidModelArg::MatchesPid)]
    tid_model: TidModelArg,

    /// Mapping lengths for the memory triads (decimal or 0x-prefixed hex)
    #[arg(
        long = "map-length",
        env = "SYSPROBE_MAP_LENGTHS",
        value_delimiter = ',',
        value_parser = parse_size
    )]
    map_lengths: Vec<usize>,

    /// Page size of the kernel under test
    #[arg(long, env = "SYSPROBE_PAGE_SIZE", value_parser = parse_size, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Bound on the mismatching futex wait
    #[arg(long, env = "SYSPROBE_WAIT_TIMEOUT_MS")]
    wait_timeout_ms: Option<u64>,

    /// Bound on waiting for the clone child to exit
    #[arg(long, env = "SYSPROBE_JOIN_TIMEOUT_MS")]
    join_timeout_ms: Option<u64>,

    /// Run only these probes or groups
    #[arg(long, env = "SYSPROBE_ONLY", value_delimiter = ',')]
    only: Vec<String>,

    /// Never run these probes or groups
    #[arg(long, env = "SYSPROBE_SKIP", value_delimiter = ',')]
    skip: Vec<String>,

    /// Audit log format on stdout
    #[arg(long, env = "SYSPROBE_FORMAT", value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Exit with status 1 when any probe failed
    #[arg(long, env = "SYSPROBE_FAIL_ON_ERROR")]
    fail_on_error: bool,

    /// Print the probe plan and exit without touching the kernel
    #[arg(long)]
    list: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExecModelArg {
    Replace,
    Spawn,
}

impl From<ExecModelArg> for ExecModel {
    fn from(arg: ExecModelArg) -> Self {
        match arg {
            ExecModelArg::Replace => ExecModel::Replace,
            ExecModelArg::Spawn => ExecModel::Spawn,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TidModelArg {
    MatchesPid,
    Distinct,
    Unchecked,
}

impl From<TidModelArg> for ThreadIdModel {
    fn from(arg: TidModelArg) -> Self {
        match arg {
            TidModelArg::MatchesPid => ThreadIdModel::MatchesPid,
            TidModelArg::Distinct => ThreadIdModel::Distinct,
            TidModelArg::Unchecked => ThreadIdModel::Unchecked,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Jsonl,
}

fn parse_size(s: &str) -> std::result::Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid size '{}': {}", s, e))
}

impl Cli {
    fn harness_config(&self) -> HarnessConfig {
        let defaults = HarnessConfig::default();
        HarnessConfig {
            exec_model: self.exec_model.into(),
            exec_target: self.exec_target.clone(),
            exec_argv: self.exec_args.clone(),
            missing_exec_path: self.missing_path.clone(),
            thread_id_model: self.tid_model.into(),
            map_lengths: if self.map_lengths.is_empty() {
                defaults.map_lengths.clone()
            } else {
                self.map_lengths.clone()
            },
            page_size: self.page_size,
            wait_timeout: self
                .wait_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.wait_timeout),
            join_timeout: self
                .join_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.join_timeout),
            output_fd: match self.format {
                Format::Text => STDOUT_FD,
                Format::Jsonl => STDERR_FD,
            },
            filter: ProbeFilter {
                only: self.only.clone(),
                skip: self.skip.clone(),
            },
            ..defaults
        }
    }
}

#[derive(Tabled)]
struct PlanRow {
    group: String,
    probe: String,
    syscalls: String,
    enabled: String,
}

fn print_plan(sequencer: &Sequencer) {
    let rows: Vec<PlanRow> = sequencer
        .plan()
        .into_iter()
        .map(|(group, spec, enabled)| PlanRow {
            group: group.to_string(),
            probe: spec.name.clone(),
            syscalls: spec
                .syscalls
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(", "),
            enabled: if enabled { "yes" } else { "no" }.to_string(),
        })
        .collect();

    println!("{}", "Probe plan".cyan().bold());
    println!("{}", Table::new(rows));
}

fn exit_status(summary: &RunSummary, fail_on_error: bool) -> i32 {
    if fail_on_error && summary.has_failures() {
        EXIT_PROBE_FAILED
    } else {
        EXIT_OK
    }
}

#[cfg(target_os = "linux")]
fn run(cli: &Cli, sequencer: &Sequencer) -> Result<()> {
    use sysprobe_core::port::Kernel;
    use sysprobe_infra_system::RawKernel;

    let kernel = RawKernel;
    let stdout = std::io::stdout();
    let summary = match cli.format {
        Format::Text => sequencer.run(&kernel, &mut TextReporter::new(stdout.lock())),
        Format::Jsonl => sequencer.run(&kernel, &mut JsonLinesReporter::new(stdout.lock())),
    }
    .context("Probe run aborted: reporter output failed")?;

    let status = exit_status(&summary, cli.fail_on_error);
    info!(
        run_id = %summary.run_id,
        passed = summary.passed,
        failed = summary.failed,
        skipped = summary.skipped,
        status,
        "Exiting via exit_group"
    );
    kernel.exit_group(status)
}

#[cfg(not(target_os = "linux"))]
fn run(_cli: &Cli, _sequencer: &Sequencer) -> Result<()> {
    anyhow::bail!("sysprobe issues Linux syscalls and only runs on Linux-compatible kernels")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init()?;

    info!("sysprobe v{} starting...", sysprobe_core::VERSION);

    let config = cli.harness_config();
    let sequencer = Sequencer::standard(&config).context("Invalid harness configuration")?;

    if cli.list {
        print_plan(&sequencer);
        return Ok(());
    }

    run(&cli, &sequencer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["sysprobe"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_match_harness_defaults() {
        let config = parse(&[]).harness_config();
        let defaults = HarnessConfig::default();

        assert_eq!(config.exec_model, ExecModel::Spawn);
        assert_eq!(config.exec_target, defaults.exec_target);
        assert_eq!(config.exec_argv, vec!["ls", "-l", "-a"]);
        assert_eq!(config.map_lengths, defaults.map_lengths);
        assert_eq!(config.wait_timeout, defaults.wait_timeout);
        assert_eq!(config.thread_id_model, ThreadIdModel::MatchesPid);
        assert_eq!(config.output_fd, STDOUT_FD);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_jsonl_moves_output_group_off_stdout() {
        let config = parse(&["--format", "jsonl"]).harness_config();
        assert_eq!(config.output_fd, STDERR_FD);
    }

    #[test]
    fn test_flags_build_config() {
        let config = parse(&[
            "--exec-model",
            "replace",
            "--tid-model",
            "distinct",
            "--map-length",
            "0x4000,8192",
            "--wait-timeout-ms",
            "250",
            "--only",
            "memory,uname",
            "--skip",
            "brk",
        ])
        .harness_config();

        assert_eq!(config.exec_model, ExecModel::Replace);
        assert_eq!(config.thread_id_model, ThreadIdModel::Distinct);
        assert_eq!(config.map_lengths, vec![0x4000, 0x2000]);
        assert_eq!(config.wait_timeout, Duration::from_millis(250));
        assert_eq!(config.filter.only, vec!["memory", "uname"]);
        assert_eq!(config.filter.skip, vec!["brk"]);
    }

    #[test]
    fn test_bad_size_is_rejected() {
        let argv = ["sysprobe", "--map-length", "0xzz"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_exit_status() {
        let mut summary = RunSummary::new("run-1", 0);
        assert_eq!(exit_status(&summary, true), 0);

        summary.failed = 1;
        assert_eq!(exit_status(&summary, false), 0);
        assert_eq!(exit_status(&summary, true), 1);
    }
}

//! Full battery against the host kernel, minus the probes that would write
//! into the test output or replace the test process.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use sysprobe_core::application::{HarnessConfig, ProbeFilter, Sequencer};
use sysprobe_core::domain::{FailureKind, ThreadIdModel};
use sysprobe_core::port::reporter::mocks::RecordingReporter;
use sysprobe_infra_system::RawKernel;

fn host_config() -> HarnessConfig {
    HarnessConfig {
        // Tests run on harness worker threads, never on the initial thread
        thread_id_model: ThreadIdModel::Unchecked,
        filter: ProbeFilter {
            only: vec![],
            skip: vec!["output".to_string(), "execve_existing".to_string()],
        },
        ..Default::default()
    }
}

#[test]
fn test_host_kernel_passes_the_battery() {
    let sequencer = Sequencer::standard(&host_config()).unwrap();
    let mut reporter = RecordingReporter::new();

    let summary = sequencer.run(&RawKernel, &mut reporter).unwrap();

    assert!(summary.complete);
    assert_eq!(summary.failed, 0, "{:#?}", summary.records);
    assert_eq!(summary.records.len(), sequencer.plan().len());

    for record in summary.records.iter().filter(|r| r.outcome.is_skipped()) {
        let kind = record.outcome.diagnosis().unwrap().kind;
        match record.probe.as_str() {
            "write" | "writev" | "execve_existing" => assert_eq!(kind, FailureKind::Disabled),
            // i386-only on x86_64
            "set_thread_area" => assert_eq!(kind, FailureKind::SetupFailure),
            other => panic!("unexpected skip of {}: {:?}", other, record.outcome),
        }
    }
    assert!(summary.record("set_thread_area").unwrap().outcome.is_skipped());
    assert!(summary.record("open").unwrap().outcome.is_pass());

    let uname = summary.record("uname").unwrap();
    assert_eq!(uname.evidence.get("sysname"), Some("Linux"));
}

#[test]
fn test_records_serialize_for_the_jsonl_log() {
    let mut config = host_config();
    config.filter.only = vec!["memory".to_string()];
    let sequencer = Sequencer::standard(&config).unwrap();

    let summary = sequencer.run(&RawKernel, &mut RecordingReporter::new()).unwrap();
    let mmap = summary.record("mmap[0x8000]").unwrap();
    let json = serde_json::to_value(mmap).unwrap();

    assert_eq!(json["group"], "memory");
    assert_eq!(json["syscalls"][0], "mmap");
    assert_eq!(json["outcome"]["verdict"], "PASS");
}

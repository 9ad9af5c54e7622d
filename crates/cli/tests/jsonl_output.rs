//! `--format jsonl` end to end: every stdout line must be a JSON object.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::process::Command;

#[test]
fn test_jsonl_stdout_is_only_json() {
    let output = Command::new(env!("CARGO_BIN_EXE_sysprobe"))
        .args(["--format", "jsonl", "--skip", "process_lifecycle"])
        .env_remove("SYSPROBE_FORMAT")
        .env_remove("SYSPROBE_ONLY")
        .env_remove("SYSPROBE_SKIP")
        .output()
        .expect("failed to start sysprobe");

    assert!(output.status.success(), "{:?}", output);

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert!(!lines.is_empty());
    for line in &lines {
        let value: serde_json::Value = serde_json::from_str(line)
            .unwrap_or_else(|e| panic!("non-JSON line on stdout {:?}: {}", line, e));
        assert!(value.is_object(), "{}", line);
    }

    let write = lines
        .iter()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .find(|v| v["type"] == "record" && v["probe"] == "write")
        .expect("no record for the write probe");
    assert_eq!(write["outcome"]["verdict"], "PASS");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.is_empty());
}

// Harness constants (no magic values in probes)
use std::ffi::CStr;
use std::time::Duration;

/// Page size the residency arithmetic assumes (4 KiB)
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Mapping lengths the memory group probes: one page-aligned, one not
pub const DEFAULT_MAP_LENGTHS: [usize; 2] = [0x8000, 0x2001];

/// Extra bytes after the residency vector that the kernel must leave alone
pub const MINCORE_GUARD_LEN: usize = 16;

/// Guard byte value; mincore only ever writes 0 or 1 into the low bit
pub const MINCORE_GUARD_BYTE: u8 = 0xA5;

/// Value the futex word holds during the mismatch wait
pub const FUTEX_WORD_INITIAL: u32 = 0;

/// Value the mismatch wait expects (never equal to FUTEX_WORD_INITIAL)
pub const FUTEX_EXPECTED_MISMATCH: u32 = 42;

/// Waiters the wake probe asks for; nobody is waiting, so 0 come back
pub const FUTEX_WAKE_COUNT: i32 = 42;

/// Upper bound on any futex wait the harness issues (1s)
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Stack handed to the clone child (16 KiB)
pub const CLONE_STACK_SIZE: usize = 0x4000;

/// Status the clone child passes to exit, for manual inspection only
pub const CHILD_EXIT_STATUS: i32 = 42;

/// How long to wait for the clone child to clear its tid word (2s)
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Companion executable used as execve target
pub const DEFAULT_EXEC_TARGET: &str = "/usr/statx";

/// argv handed to the execve target
pub const DEFAULT_EXEC_ARGV: [&str; 3] = ["ls", "-l", "-a"];

/// Path that must never exist on the kernel under test
pub const MISSING_EXEC_PATH: &str = "/this-program-does-not-exist";

/// Value held in memory across the failed execve; must read back unchanged
pub const EXEC_SENTINEL: u64 = 0x5359_5350_524f_4245;

/// File the file group opens and reads (always empty)
pub const NULL_DEVICE: &CStr = c"/dev/null";

/// dirfd passed to openat with an absolute path; the kernel must ignore it
pub const BOGUS_DIRFD: i32 = 42;

/// File mode requested with O_CREAT
pub const CREATE_MODE: u32 = 0o666;

/// Descriptor the output group writes to
pub const STDOUT_FD: i32 = 1;

/// Descriptor the output group writes to when stdout carries JSON lines
pub const STDERR_FD: i32 = 2;

/// Harness exit status when run completes
pub const EXIT_OK: i32 = 0;

/// Harness exit status with --fail-on-error and at least one failed probe
pub const EXIT_PROBE_FAILED: i32 = 1;

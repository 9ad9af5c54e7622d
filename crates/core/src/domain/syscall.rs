// Syscall surface under test

use serde::{Deserialize, Serialize};

/// Every syscall the harness exercises (Linux-compatible numbering and layouts)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Syscall {
    Write,
    Writev,
    SetThreadArea,
    Open,
    Openat,
    Read,
    Close,
    Brk,
    Mmap,
    Mincore,
    Munmap,
    Gettid,
    Getpid,
    Futex,
    Clone,
    Uname,
    SchedYield,
    Execve,
    Exit,
    ExitGroup,
}

impl Syscall {
    /// Lower-case syscall name as it appears in the kernel's syscall table
    pub fn name(self) -> &'static str {
        match self {
            Syscall::Write => "write",
            Syscall::Writev => "writev",
            Syscall::SetThreadArea => "set_thread_area",
            Syscall::Open => "open",
            Syscall::Openat => "openat",
            Syscall::Read => "read",
            Syscall::Close => "close",
            Syscall::Brk => "brk",
            Syscall::Mmap => "mmap",
            Syscall::Mincore => "mincore",
            Syscall::Munmap => "munmap",
            Syscall::Gettid => "gettid",
            Syscall::Getpid => "getpid",
            Syscall::Futex => "futex",
            Syscall::Clone => "clone",
            Syscall::Uname => "uname",
            Syscall::SchedYield => "sched_yield",
            Syscall::Execve => "execve",
            Syscall::Exit => "exit",
            Syscall::ExitGroup => "exit_group",
        }
    }
}

impl std::fmt::Display for Syscall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_serde_name() {
        for syscall in [Syscall::SetThreadArea, Syscall::SchedYield, Syscall::ExitGroup] {
            let json = serde_json::to_string(&syscall).unwrap();
            assert_eq!(json, format!("\"{}\"", syscall));
        }
    }
}

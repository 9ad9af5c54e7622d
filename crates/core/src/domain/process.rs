// Process Lifecycle Model (execve)

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::ffi::CString;

use super::RawReturn;

/// What the kernel under test does on a successful execve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecModel {
    /// Linux-compatible: the caller's image is replaced, execve never returns
    Replace,
    /// Divergent: a new process is created and the caller keeps running
    Spawn,
}

impl std::fmt::Display for ExecModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecModel::Replace => write!(f, "replace"),
            ExecModel::Spawn => write!(f, "spawn"),
        }
    }
}

/// execve arguments, already NUL-terminated for the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub path: CString,
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
}

impl ExecRequest {
    pub fn new(
        path: &str,
        argv: &[String],
        envp: &[String],
    ) -> std::result::Result<Self, std::ffi::NulError> {
        Ok(Self {
            path: CString::new(path)?,
            argv: argv
                .iter()
                .map(|a| CString::new(a.as_str()))
                .collect::<std::result::Result<_, _>>()?,
            envp: envp
                .iter()
                .map(|e| CString::new(e.as_str()))
                .collect::<std::result::Result<_, _>>()?,
        })
    }

    pub fn path_lossy(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Return value and errno of an execve that came back.
///
/// Says nothing about which process model was observed; that judgment
/// belongs to the probe that knows control flow continued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSpawnResult {
    pub ret: i64,
    pub errno: Option<Errno>,
}

impl ProcessSpawnResult {
    pub fn succeeded(&self) -> bool {
        self.errno.is_none() && self.ret >= 0
    }

    pub fn raw(&self) -> RawReturn {
        RawReturn {
            ret: self.ret,
            errno: self.errno,
        }
    }
}

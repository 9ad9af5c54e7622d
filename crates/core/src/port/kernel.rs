// Kernel Port - the syscall surface under test
// Implementations issue raw syscalls; the core never does.

use nix::errno::Errno;
use std::ffi::CStr;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{
    ExecRequest, FutexWord, MapRequest, MemoryRegion, RawReturn, Syscall, ThreadAreaDescriptor,
    ThreadResources, UtsName,
};

/// A syscall that returned an error
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{syscall} returned {ret} ({errno})")]
pub struct SyscallError {
    pub syscall: Syscall,
    pub ret: i64,
    pub errno: Errno,
}

impl SyscallError {
    pub fn new(syscall: Syscall, ret: i64, errno: Errno) -> Self {
        Self {
            syscall,
            ret,
            errno,
        }
    }

    pub fn raw(&self) -> RawReturn {
        RawReturn::err(self.ret, self.errno)
    }
}

pub type SysResult<T> = std::result::Result<T, SyscallError>;

/// Kernel syscall ABI as seen by the probes
///
/// Implementations:
/// - RawKernel: raw Linux-compatible syscalls (infra-system)
/// - MockKernel: scriptable in-memory kernel for tests
pub trait Kernel {
    /// Whether the syscall exists on this architecture/ABI at all
    fn supports(&self, _syscall: Syscall) -> bool {
        true
    }

    fn write(&self, fd: i32, buf: &[u8]) -> SysResult<usize>;

    fn writev(&self, fd: i32, bufs: &[&[u8]]) -> SysResult<usize>;

    /// On success the kernel has written the assigned slot into `desc.entry_number`
    fn set_thread_area(&self, desc: &mut ThreadAreaDescriptor) -> SysResult<()>;

    fn open(&self, path: &CStr, flags: i32, mode: u32) -> SysResult<i32>;

    fn openat(&self, dirfd: i32, path: &CStr, flags: i32, mode: u32) -> SysResult<i32>;

    fn read(&self, fd: i32, buf: &mut [u8]) -> SysResult<usize>;

    fn close(&self, fd: i32) -> SysResult<()>;

    /// Raw brk: returns the (possibly unchanged) program break
    fn brk(&self, addr: usize) -> SysResult<usize>;

    fn mmap(&self, request: &MapRequest) -> SysResult<MemoryRegion>;

    /// Fill `vec` with one residency byte per page of `region`.
    /// `vec` may be longer than needed; the kernel must not touch the excess.
    fn mincore(&self, region: &MemoryRegion, vec: &mut [u8]) -> SysResult<()>;

    fn munmap(&self, region: MemoryRegion) -> SysResult<()>;

    fn gettid(&self) -> SysResult<i32>;

    fn getpid(&self) -> SysResult<i32>;

    /// FUTEX_WAIT | FUTEX_PRIVATE_FLAG, bounded by `timeout`
    fn futex_wait(&self, word: &FutexWord, expected: u32, timeout: Option<Duration>)
        -> SysResult<i64>;

    /// FUTEX_WAKE | FUTEX_PRIVATE_FLAG, returns the number of waiters woken
    fn futex_wake(&self, word: &FutexWord, count: i32) -> SysResult<i64>;

    /// Clone a child into the caller's thread group. The child runs on
    /// `resources.stack` and immediately calls `exit(exit_status)`.
    /// The kernel stores the child tid in `resources.tid_word` and clears it
    /// when the child is gone.
    ///
    /// # Safety
    /// `resources` must stay alive and unmoved until the tid word reads 0
    /// (or be leaked).
    unsafe fn clone_exiting_thread(
        &self,
        resources: &mut ThreadResources,
        exit_status: i32,
    ) -> SysResult<i32>;

    fn uname(&self) -> SysResult<UtsName>;

    fn sched_yield(&self) -> SysResult<()>;

    /// Returns only if the kernel let control come back
    fn execve(&self, request: &ExecRequest) -> SysResult<i64>;

    fn exit_group(&self, status: i32) -> !;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Mutable state behind MockKernel
    #[derive(Debug)]
    struct MockState {
        calls: Vec<Syscall>,
        failures: HashMap<Syscall, Errno>,
        unsupported: HashSet<Syscall>,
        panic_on: Option<Syscall>,
        written: Vec<u8>,
        tls_slot: u32,
        pid: i32,
        tid: i32,
        brk: usize,
        next_map_base: usize,
        mincore_entries: Option<usize>,
        unmapped: Vec<usize>,
        next_fd: i32,
        open_fds: HashSet<i32>,
        closed_fds: Vec<i32>,
        drop_fds_on_exec: bool,
        child_tid: i32,
        child_exits: bool,
        executables: HashSet<String>,
        exec_return: i64,
        exec_paths: Vec<String>,
    }

    impl MockState {
        fn allocate_fd(&mut self) -> i32 {
            let fd = self.next_fd;
            self.next_fd += 1;
            self.open_fds.insert(fd);
            fd
        }
    }

    /// Scriptable kernel for probe tests
    ///
    /// Defaults behave like a healthy Linux kernel running the spawn model for
    /// `/usr/statx`.
    pub struct MockKernel {
        state: Mutex<MockState>,
    }

    impl Default for MockKernel {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockKernel {
        pub fn new() -> Self {
            let mut executables = HashSet::new();
            executables.insert("/usr/statx".to_string());
            Self {
                state: Mutex::new(MockState {
                    calls: Vec::new(),
                    failures: HashMap::new(),
                    unsupported: HashSet::new(),
                    panic_on: None,
                    written: Vec::new(),
                    tls_slot: 12,
                    pid: 100,
                    tid: 100,
                    brk: 0x0060_0000,
                    next_map_base: 0x7f00_0000_0000,
                    mincore_entries: None,
                    unmapped: Vec::new(),
                    next_fd: 3,
                    open_fds: HashSet::new(),
                    closed_fds: Vec::new(),
                    drop_fds_on_exec: false,
                    child_tid: 101,
                    child_exits: true,
                    executables,
                    exec_return: 0,
                    exec_paths: Vec::new(),
                }),
            }
        }

        /// Make `syscall` fail with `errno`
        pub fn failing(self, syscall: Syscall, errno: Errno) -> Self {
            self.state.lock().unwrap().failures.insert(syscall, errno);
            self
        }

        pub fn unsupported(self, syscall: Syscall) -> Self {
            self.state.lock().unwrap().unsupported.insert(syscall);
            self
        }

        /// Panic inside `syscall` (for isolation testing)
        pub fn panicking_on(self, syscall: Syscall) -> Self {
            self.state.lock().unwrap().panic_on = Some(syscall);
            self
        }

        pub fn with_tls_slot(self, slot: u32) -> Self {
            self.state.lock().unwrap().tls_slot = slot;
            self
        }

        pub fn with_ids(self, pid: i32, tid: i32) -> Self {
            {
                let mut state = self.state.lock().unwrap();
                state.pid = pid;
                state.tid = tid;
            }
            self
        }

        pub fn with_map_base(self, base: usize) -> Self {
            self.state.lock().unwrap().next_map_base = base;
            self
        }

        /// Write exactly `n` residency bytes regardless of the region length
        pub fn with_mincore_entries(self, n: usize) -> Self {
            self.state.lock().unwrap().mincore_entries = Some(n);
            self
        }

        /// Whether the clone child clears its tid word (i.e. exits visibly)
        pub fn with_child_exit(self, exits: bool) -> Self {
            self.state.lock().unwrap().child_exits = exits;
            self
        }

        pub fn with_exec_return(self, ret: i64) -> Self {
            self.state.lock().unwrap().exec_return = ret;
            self
        }

        /// Close every open descriptor on execve, even a failed one
        pub fn dropping_fds_on_exec(self) -> Self {
            self.state.lock().unwrap().drop_fds_on_exec = true;
            self
        }

        pub fn calls(&self) -> Vec<Syscall> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn call_count(&self, syscall: Syscall) -> usize {
            self.calls().iter().filter(|s| **s == syscall).count()
        }

        pub fn written(&self) -> Vec<u8> {
            self.state.lock().unwrap().written.clone()
        }

        pub fn unmapped(&self) -> Vec<usize> {
            self.state.lock().unwrap().unmapped.clone()
        }

        pub fn closed_fds(&self) -> Vec<i32> {
            self.state.lock().unwrap().closed_fds.clone()
        }

        pub fn exec_paths(&self) -> Vec<String> {
            self.state.lock().unwrap().exec_paths.clone()
        }

        /// Log the call, then apply scripted panic/failure
        fn enter(&self, syscall: Syscall) -> SysResult<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(syscall);
            if state.panic_on == Some(syscall) {
                drop(state);
                panic!("mock kernel panic in {}", syscall);
            }
            match state.failures.get(&syscall) {
                Some(errno) => Err(SyscallError::new(syscall, -1, *errno)),
                None => Ok(()),
            }
        }
    }

    impl Kernel for MockKernel {
        fn supports(&self, syscall: Syscall) -> bool {
            !self.state.lock().unwrap().unsupported.contains(&syscall)
        }

        fn write(&self, _fd: i32, buf: &[u8]) -> SysResult<usize> {
            self.enter(Syscall::Write)?;
            self.state.lock().unwrap().written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn writev(&self, _fd: i32, bufs: &[&[u8]]) -> SysResult<usize> {
            self.enter(Syscall::Writev)?;
            let mut state = self.state.lock().unwrap();
            let mut total = 0;
            for buf in bufs {
                state.written.extend_from_slice(buf);
                total += buf.len();
            }
            Ok(total)
        }

        fn set_thread_area(&self, desc: &mut ThreadAreaDescriptor) -> SysResult<()> {
            self.enter(Syscall::SetThreadArea)?;
            if desc.entry_number == ThreadAreaDescriptor::AUTO_ASSIGN {
                desc.entry_number = self.state.lock().unwrap().tls_slot;
            }
            Ok(())
        }

        fn open(&self, _path: &CStr, _flags: i32, _mode: u32) -> SysResult<i32> {
            self.enter(Syscall::Open)?;
            Ok(self.state.lock().unwrap().allocate_fd())
        }

        fn openat(&self, _dirfd: i32, _path: &CStr, _flags: i32, _mode: u32) -> SysResult<i32> {
            self.enter(Syscall::Openat)?;
            Ok(self.state.lock().unwrap().allocate_fd())
        }

        fn read(&self, fd: i32, _buf: &mut [u8]) -> SysResult<usize> {
            self.enter(Syscall::Read)?;
            if !self.state.lock().unwrap().open_fds.contains(&fd) {
                return Err(SyscallError::new(Syscall::Read, -1, Errno::EBADF));
            }
            Ok(0)
        }

        fn close(&self, fd: i32) -> SysResult<()> {
            self.enter(Syscall::Close)?;
            let mut state = self.state.lock().unwrap();
            if !state.open_fds.remove(&fd) {
                return Err(SyscallError::new(Syscall::Close, -1, Errno::EBADF));
            }
            state.closed_fds.push(fd);
            Ok(())
        }

        fn brk(&self, _addr: usize) -> SysResult<usize> {
            self.enter(Syscall::Brk)?;
            Ok(self.state.lock().unwrap().brk)
        }

        fn mmap(&self, request: &MapRequest) -> SysResult<MemoryRegion> {
            self.enter(Syscall::Mmap)?;
            let mut state = self.state.lock().unwrap();
            let base = state.next_map_base;
            state.next_map_base += request.length.div_ceil(0x1000) * 0x1000 + 0x1000;
            Ok(MemoryRegion::from_kernel(base, request))
        }

        fn mincore(&self, region: &MemoryRegion, vec: &mut [u8]) -> SysResult<()> {
            self.enter(Syscall::Mincore)?;
            let n = self
                .state
                .lock()
                .unwrap()
                .mincore_entries
                .unwrap_or_else(|| region.len().div_ceil(0x1000));
            for entry in vec.iter_mut().take(n) {
                *entry = 0;
            }
            Ok(())
        }

        fn munmap(&self, region: MemoryRegion) -> SysResult<()> {
            self.enter(Syscall::Munmap)?;
            self.state.lock().unwrap().unmapped.push(region.base());
            Ok(())
        }

        fn gettid(&self) -> SysResult<i32> {
            self.enter(Syscall::Gettid)?;
            Ok(self.state.lock().unwrap().tid)
        }

        fn getpid(&self) -> SysResult<i32> {
            self.enter(Syscall::Getpid)?;
            Ok(self.state.lock().unwrap().pid)
        }

        fn futex_wait(
            &self,
            word: &FutexWord,
            expected: u32,
            timeout: Option<Duration>,
        ) -> SysResult<i64> {
            self.enter(Syscall::Futex)?;
            if word.load() != expected {
                return Err(SyscallError::new(Syscall::Futex, -1, Errno::EAGAIN));
            }
            match timeout {
                // Nobody will ever wake us in a mock
                Some(_) => Err(SyscallError::new(Syscall::Futex, -1, Errno::ETIMEDOUT)),
                None => panic!("mock futex_wait would block forever"),
            }
        }

        fn futex_wake(&self, _word: &FutexWord, _count: i32) -> SysResult<i64> {
            self.enter(Syscall::Futex)?;
            Ok(0)
        }

        unsafe fn clone_exiting_thread(
            &self,
            resources: &mut ThreadResources,
            _exit_status: i32,
        ) -> SysResult<i32> {
            self.enter(Syscall::Clone)?;
            let (tid, exits) = {
                let state = self.state.lock().unwrap();
                (state.child_tid, state.child_exits)
            };
            resources.tid_word.store(tid as u32);
            if exits {
                self.state.lock().unwrap().calls.push(Syscall::Exit);
                resources.tid_word.store(0);
            }
            Ok(tid)
        }

        fn uname(&self) -> SysResult<UtsName> {
            self.enter(Syscall::Uname)?;
            Ok(UtsName {
                sysname: "Linux".to_string(),
                nodename: "mock".to_string(),
                release: "6.0.0".to_string(),
                version: "#1 SMP".to_string(),
                machine: "x86_64".to_string(),
                domainname: "(none)".to_string(),
            })
        }

        fn sched_yield(&self) -> SysResult<()> {
            self.enter(Syscall::SchedYield)
        }

        fn execve(&self, request: &ExecRequest) -> SysResult<i64> {
            self.enter(Syscall::Execve)?;
            let path = request.path_lossy();
            let mut state = self.state.lock().unwrap();
            state.exec_paths.push(path.clone());
            if state.drop_fds_on_exec {
                state.open_fds.clear();
            }
            if state.executables.contains(&path) {
                Ok(state.exec_return)
            } else {
                Err(SyscallError::new(Syscall::Execve, -1, Errno::ENOENT))
            }
        }

        fn exit_group(&self, status: i32) -> ! {
            panic!("mock exit_group({})", status);
        }
    }
}

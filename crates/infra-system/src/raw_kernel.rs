// Raw syscall adapter
// Every call goes through libc::syscall, never a libc wrapper: wrappers
// retry, emulate or cache (getpid, brk, open).
use nix::errno::Errno;
use std::ffi::{c_char, CStr};
use std::ptr;
use std::time::Duration;
use tracing::debug;

use sysprobe_core::domain::system::decode_field;
use sysprobe_core::domain::{
    ExecRequest, FutexWord, MapRequest, MemoryRegion, Syscall, ThreadAreaDescriptor,
    ThreadResources, UtsName,
};
use sysprobe_core::port::{Kernel, SysResult, SyscallError};

/// Kernel port backed by the syscall instruction of the running kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct RawKernel;

impl RawKernel {
    pub fn new() -> Self {
        Self
    }
}

/// Map a raw `syscall(2)` return to a result, logging it
fn checked(syscall: Syscall, ret: libc::c_long) -> SysResult<i64> {
    debug!(syscall = %syscall, ret, "syscall returned");
    Errno::result(ret)
        .map(|r| r as i64)
        .map_err(|errno| SyscallError::new(syscall, ret as i64, errno))
}

#[cfg(not(target_arch = "x86_64"))]
fn unsupported(syscall: Syscall) -> SyscallError {
    SyscallError::new(syscall, -1, Errno::ENOSYS)
}

/// NULL-terminated pointer array over `args`, valid while `args` lives
fn pointer_array(args: &[std::ffi::CString]) -> Vec<*const c_char> {
    args.iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

const CLONE_THREAD_FLAGS: libc::c_int = libc::CLONE_VM
    | libc::CLONE_FS
    | libc::CLONE_FILES
    | libc::CLONE_SIGHAND
    | libc::CLONE_THREAD
    | libc::CLONE_SYSVSEM
    | libc::CLONE_PARENT_SETTID
    | libc::CLONE_CHILD_CLEARTID;

impl Kernel for RawKernel {
    fn supports(&self, syscall: Syscall) -> bool {
        match syscall {
            // x86_64 keeps a slot for set_thread_area but answers ENOSYS
            Syscall::SetThreadArea => cfg!(target_arch = "x86"),
            Syscall::Open => cfg!(any(target_arch = "x86", target_arch = "x86_64")),
            Syscall::Clone => cfg!(target_arch = "x86_64"),
            _ => true,
        }
    }

    fn write(&self, fd: i32, buf: &[u8]) -> SysResult<usize> {
        // SAFETY: buf is a live slice; the kernel reads at most buf.len() bytes
        let ret = unsafe { libc::syscall(libc::SYS_write, fd, buf.as_ptr(), buf.len()) };
        checked(Syscall::Write, ret).map(|n| n as usize)
    }

    fn writev(&self, fd: i32, bufs: &[&[u8]]) -> SysResult<usize> {
        let iov: Vec<libc::iovec> = bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();
        // SAFETY: every iovec points into a slice of bufs, which outlives the call
        let ret = unsafe { libc::syscall(libc::SYS_writev, fd, iov.as_ptr(), iov.len()) };
        checked(Syscall::Writev, ret).map(|n| n as usize)
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn set_thread_area(&self, desc: &mut ThreadAreaDescriptor) -> SysResult<()> {
        // SAFETY: desc is an exclusively borrowed user_desc the kernel may write back
        let ret = unsafe {
            libc::syscall(
                libc::SYS_set_thread_area,
                desc as *mut ThreadAreaDescriptor,
            )
        };
        checked(Syscall::SetThreadArea, ret)?;
        debug!(entry_number = desc.entry_number, "set_thread_area assigned slot");
        Ok(())
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    fn set_thread_area(&self, _desc: &mut ThreadAreaDescriptor) -> SysResult<()> {
        Err(unsupported(Syscall::SetThreadArea))
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn open(&self, path: &CStr, flags: i32, mode: u32) -> SysResult<i32> {
        // SAFETY: path is NUL-terminated and borrowed for the call
        let ret = unsafe { libc::syscall(libc::SYS_open, path.as_ptr(), flags, mode) };
        checked(Syscall::Open, ret).map(|fd| fd as i32)
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    fn open(&self, _path: &CStr, _flags: i32, _mode: u32) -> SysResult<i32> {
        Err(unsupported(Syscall::Open))
    }

    fn openat(&self, dirfd: i32, path: &CStr, flags: i32, mode: u32) -> SysResult<i32> {
        // SAFETY: path is NUL-terminated and borrowed for the call
        let ret = unsafe { libc::syscall(libc::SYS_openat, dirfd, path.as_ptr(), flags, mode) };
        checked(Syscall::Openat, ret).map(|fd| fd as i32)
    }

    fn read(&self, fd: i32, buf: &mut [u8]) -> SysResult<usize> {
        // SAFETY: buf is exclusively borrowed; the kernel writes at most buf.len() bytes
        let ret = unsafe { libc::syscall(libc::SYS_read, fd, buf.as_mut_ptr(), buf.len()) };
        checked(Syscall::Read, ret).map(|n| n as usize)
    }

    fn close(&self, fd: i32) -> SysResult<()> {
        // SAFETY: no pointers
        let ret = unsafe { libc::syscall(libc::SYS_close, fd) };
        checked(Syscall::Close, ret).map(|_| ())
    }

    fn brk(&self, addr: usize) -> SysResult<usize> {
        // The raw call never sets errno: it returns the current break on failure
        // SAFETY: no pointers; moving the break only affects the heap end
        let ret = unsafe { libc::syscall(libc::SYS_brk, addr) };
        debug!(syscall = %Syscall::Brk, ret, "syscall returned");
        Ok(ret as usize)
    }

    fn mmap(&self, request: &MapRequest) -> SysResult<MemoryRegion> {
        #[cfg(target_arch = "x86")]
        let nr = libc::SYS_mmap2;
        #[cfg(not(target_arch = "x86"))]
        let nr = libc::SYS_mmap;

        // SAFETY: no address hint, anonymous mapping; the kernel picks fresh pages
        let ret = unsafe {
            libc::syscall(
                nr,
                ptr::null_mut::<libc::c_void>(),
                request.length,
                request.protection.bits(),
                request.flags.bits(),
                -1,
                0,
            )
        };
        let base = checked(Syscall::Mmap, ret)? as usize;
        Ok(MemoryRegion::from_kernel(base, request))
    }

    fn mincore(&self, region: &MemoryRegion, vec: &mut [u8]) -> SysResult<()> {
        // SAFETY: region is a live mapping and vec is exclusively borrowed;
        // callers size vec for the region and the kernel writes only that many bytes
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mincore,
                region.base(),
                region.len(),
                vec.as_mut_ptr(),
            )
        };
        checked(Syscall::Mincore, ret).map(|_| ())
    }

    fn munmap(&self, region: MemoryRegion) -> SysResult<()> {
        // SAFETY: region is consumed, so no safe reference into it survives the unmap
        let ret = unsafe { libc::syscall(libc::SYS_munmap, region.base(), region.len()) };
        checked(Syscall::Munmap, ret).map(|_| ())
    }

    fn gettid(&self) -> SysResult<i32> {
        // SAFETY: no arguments
        let ret = unsafe { libc::syscall(libc::SYS_gettid) };
        checked(Syscall::Gettid, ret).map(|tid| tid as i32)
    }

    fn getpid(&self) -> SysResult<i32> {
        // SAFETY: no arguments
        let ret = unsafe { libc::syscall(libc::SYS_getpid) };
        checked(Syscall::Getpid, ret).map(|pid| pid as i32)
    }

    fn futex_wait(
        &self,
        word: &FutexWord,
        expected: u32,
        timeout: Option<Duration>,
    ) -> SysResult<i64> {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(ptr::null(), |t| t as *const libc::timespec);
        // SAFETY: word is an aligned AtomicU32 borrowed for the call; ts outlives it
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                ts_ptr,
                ptr::null::<u32>(),
                0,
            )
        };
        checked(Syscall::Futex, ret)
    }

    fn futex_wake(&self, word: &FutexWord, count: i32) -> SysResult<i64> {
        // SAFETY: word is an aligned AtomicU32 borrowed for the call; wake never writes it
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
                ptr::null::<libc::timespec>(),
                ptr::null::<u32>(),
                0,
            )
        };
        checked(Syscall::Futex, ret)
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn clone_exiting_thread(
        &self,
        resources: &mut ThreadResources,
        exit_status: i32,
    ) -> SysResult<i32> {
        let stack_top = resources.stack.top();
        let tid_ptr = resources.tid_word.as_ptr();
        let ret: i64;

        // SAFETY: the caller keeps resources alive until the tid word clears.
        // The child resumes after the syscall with rax == 0 on the new stack
        // and exits straight away; it never touches memory.
        core::arch::asm!(
            "syscall",
            "test rax, rax",
            "jnz 2f",
            "mov rax, r12",
            "mov rdi, r9",
            "syscall",
            "ud2",
            "2:",
            inlateout("rax") libc::SYS_clone => ret,
            in("rdi") CLONE_THREAD_FLAGS as u64,
            in("rsi") stack_top,
            in("rdx") tid_ptr,
            in("r10") tid_ptr,
            in("r8") 0u64,
            in("r9") exit_status as i64,
            in("r12") libc::SYS_exit,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );

        debug!(syscall = %Syscall::Clone, ret, "syscall returned");
        if ret < 0 {
            return Err(SyscallError::new(
                Syscall::Clone,
                -1,
                Errno::from_raw(-ret as i32),
            ));
        }
        Ok(ret as i32)
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe fn clone_exiting_thread(
        &self,
        _resources: &mut ThreadResources,
        _exit_status: i32,
    ) -> SysResult<i32> {
        Err(unsupported(Syscall::Clone))
    }

    fn uname(&self) -> SysResult<UtsName> {
        let mut raw = std::mem::MaybeUninit::<libc::utsname>::zeroed();
        // SAFETY: raw is a utsname-sized buffer owned by this frame
        let ret = unsafe { libc::syscall(libc::SYS_uname, raw.as_mut_ptr()) };
        checked(Syscall::Uname, ret)?;
        // SAFETY: zero-initialised and filled in by the kernel
        let raw = unsafe { raw.assume_init() };

        let field = |f: &[c_char]| -> String {
            let bytes: Vec<u8> = f.iter().map(|&c| c as u8).collect();
            decode_field(&bytes)
        };
        Ok(UtsName {
            sysname: field(&raw.sysname),
            nodename: field(&raw.nodename),
            release: field(&raw.release),
            version: field(&raw.version),
            machine: field(&raw.machine),
            domainname: field(&raw.domainname),
        })
    }

    fn sched_yield(&self) -> SysResult<()> {
        // SAFETY: no arguments
        let ret = unsafe { libc::syscall(libc::SYS_sched_yield) };
        checked(Syscall::SchedYield, ret).map(|_| ())
    }

    fn execve(&self, request: &ExecRequest) -> SysResult<i64> {
        let argv = pointer_array(&request.argv);
        let envp = pointer_array(&request.envp);
        debug!(path = %request.path_lossy(), argc = request.argv.len(), "execve");
        // SAFETY: path is NUL-terminated; argv and envp are NULL-terminated arrays
        // of pointers into request, which outlives the call
        let ret = unsafe {
            libc::syscall(
                libc::SYS_execve,
                request.path.as_ptr(),
                argv.as_ptr(),
                envp.as_ptr(),
            )
        };
        checked(Syscall::Execve, ret)
    }

    fn exit_group(&self, status: i32) -> ! {
        debug!(status, "exit_group");
        // SAFETY: no pointers; the process ends here
        unsafe {
            libc::syscall(libc::SYS_exit_group, status);
        }
        // exit_group does not return on a working kernel
        std::process::abort()
    }
}

// Thread & Rendezvous Model (set_thread_area, futex, clone)

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, Ordering};

/// x86 `struct user_desc` as consumed by set_thread_area
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAreaDescriptor {
    pub entry_number: u32,
    pub base_addr: u32,
    pub limit: u32,
    pub flags: u32,
}

impl ThreadAreaDescriptor {
    /// entry_number value asking the kernel to pick a free TLS slot
    pub const AUTO_ASSIGN: u32 = u32::MAX;

    // user_desc bitfield layout
    pub const SEG_32BIT: u32 = 1 << 0;
    pub const READ_EXEC_ONLY: u32 = 1 << 3;
    pub const LIMIT_IN_PAGES: u32 = 1 << 4;
    pub const SEG_NOT_PRESENT: u32 = 1 << 5;
    pub const USEABLE: u32 = 1 << 6;

    /// Flat 32-bit data segment with an auto-assigned slot
    pub fn auto_assign() -> Self {
        Self {
            entry_number: Self::AUTO_ASSIGN,
            base_addr: 0,
            limit: 0xffff_ffff,
            flags: Self::SEG_32BIT | Self::USEABLE,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.entry_number != Self::AUTO_ASSIGN
    }
}

/// GDT TLS slots the kernel may hand out (GDT_ENTRY_TLS_MIN..=GDT_ENTRY_TLS_MAX)
#[cfg(target_arch = "x86")]
pub const TLS_SLOT_RANGE: RangeInclusive<u32> = 6..=8;
#[cfg(not(target_arch = "x86"))]
pub const TLS_SLOT_RANGE: RangeInclusive<u32> = 12..=14;

/// Shared 32-bit wait/wake rendezvous cell. Its value means nothing beyond
/// what the futex protocol compares against.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct FutexWord(AtomicU32);

impl FutexWord {
    pub fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    pub fn load(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn store(&self, value: u32) {
        self.0.store(value, Ordering::SeqCst)
    }

    /// Address handed to the kernel
    pub fn as_ptr(&self) -> *mut u32 {
        self.0.as_ptr()
    }
}

/// Dedicated stack for a clone child
#[derive(Debug)]
pub struct ThreadStack {
    buf: Box<[u8]>,
}

impl ThreadStack {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Initial stack pointer for the child: top of the buffer, 16-byte aligned
    pub fn top(&mut self) -> *mut u8 {
        let end = self.buf.as_mut_ptr_range().end;
        end.wrapping_sub(end as usize & 0xF)
    }
}

/// Everything a clone child borrows from its parent. Must stay alive until
/// the child is confirmed gone.
#[derive(Debug)]
pub struct ThreadResources {
    pub stack: ThreadStack,
    /// Set to the child tid by CLONE_PARENT_SETTID, cleared (and futex-woken)
    /// by the kernel on child exit through CLONE_CHILD_CLEARTID.
    pub tid_word: Box<FutexWord>,
}

impl ThreadResources {
    pub fn new(stack_size: usize) -> Self {
        Self {
            stack: ThreadStack::new(stack_size),
            tid_word: Box::new(FutexWord::new(0)),
        }
    }
}

/// A spawned clone child
#[derive(Debug)]
pub struct ThreadHandle {
    tid: i32,
    resources: ThreadResources,
}

impl ThreadHandle {
    pub fn new(tid: i32, resources: ThreadResources) -> Self {
        Self { tid, resources }
    }

    pub fn tid(&self) -> i32 {
        self.tid
    }

    pub fn tid_word(&self) -> &FutexWord {
        &self.resources.tid_word
    }

    /// Child gone: the kernel cleared the tid word
    pub fn has_exited(&self) -> bool {
        self.resources.tid_word.load() == 0
    }

    /// Give up on the child without freeing memory it may still run on
    pub fn abandon(self) {
        let ThreadResources { stack, tid_word } = self.resources;
        Box::leak(stack.buf);
        Box::leak(tid_word);
    }
}

/// How the initial thread's tid relates to the process id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadIdModel {
    /// Linux: the initial thread's tid equals the pid
    MatchesPid,
    /// tid and pid come from separate namespaces and differ
    Distinct,
    /// Only positivity is checked
    Unchecked,
}

impl ThreadIdModel {
    pub fn check(self, tid: i32, pid: i32) -> std::result::Result<(), String> {
        match self {
            ThreadIdModel::MatchesPid if tid != pid => {
                Err(format!("initial thread tid {} differs from pid {}", tid, pid))
            }
            ThreadIdModel::Distinct if tid == pid => {
                Err(format!("initial thread tid {} equals pid", tid))
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for ThreadIdModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadIdModel::MatchesPid => write!(f, "matches_pid"),
            ThreadIdModel::Distinct => write!(f, "distinct"),
            ThreadIdModel::Unchecked => write!(f, "unchecked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_desc_layout() {
        assert_eq!(std::mem::size_of::<ThreadAreaDescriptor>(), 16);
        let desc = ThreadAreaDescriptor::auto_assign();
        assert!(!desc.is_assigned());
        assert_eq!(desc.flags, 0x41);
    }

    #[test]
    fn test_stack_top_is_aligned_and_inside() {
        let mut stack = ThreadStack::new(0x4000);
        let base = stack.buf.as_ptr() as usize;
        let top = stack.top() as usize;
        assert_eq!(top % 16, 0);
        assert!(top <= base + 0x4000);
        assert!(top > base + 0x4000 - 16);
    }

    #[test]
    fn test_thread_id_model() {
        assert!(ThreadIdModel::MatchesPid.check(10, 10).is_ok());
        assert!(ThreadIdModel::MatchesPid.check(11, 10).is_err());
        assert!(ThreadIdModel::Distinct.check(11, 10).is_ok());
        assert!(ThreadIdModel::Distinct.check(10, 10).is_err());
        assert!(ThreadIdModel::Unchecked.check(10, 10).is_ok());
    }

    #[test]
    fn test_handle_exit_tracks_tid_word() {
        let resources = ThreadResources::new(0x1000);
        resources.tid_word.store(77);
        let handle = ThreadHandle::new(77, resources);
        assert!(!handle.has_exited());
        handle.tid_word().store(0);
        assert!(handle.has_exited());
    }
}

//! The numeric syscall surface. User code reaches the kernel through a
//! trap carrying a call number and arguments; decoding the trap frame is
//! the boot shim's business, so the dispatcher takes the decoded call and
//! folds every result into the i64 convention: non-negative on success,
//! a negative filesystem code otherwise.

use crate::constants::{SEEK_CUR, SEEK_END, SEEK_SET};
use crate::fs::{FsError, InodeKind, Whence};
use crate::runtime::Task;
use crate::sync::{BarrierId, ConditionId, LockId, SemaphoreId};

pub const SYSCALL_YIELD: usize = 0;
pub const SYSCALL_EXIT: usize = 1;
pub const SYSCALL_GETPID: usize = 2;

pub const SYSCALL_LOCK_INIT: usize = 3;
pub const SYSCALL_LOCK_ACQUIRE: usize = 4;
pub const SYSCALL_LOCK_RELEASE: usize = 5;
pub const SYSCALL_CONDITION_INIT: usize = 6;
pub const SYSCALL_CONDITION_WAIT: usize = 7;
pub const SYSCALL_CONDITION_SIGNAL: usize = 8;
pub const SYSCALL_CONDITION_BROADCAST: usize = 9;
pub const SYSCALL_SEMAPHORE_INIT: usize = 10;
pub const SYSCALL_SEMAPHORE_UP: usize = 11;
pub const SYSCALL_SEMAPHORE_DOWN: usize = 12;
pub const SYSCALL_BARRIER_INIT: usize = 13;
pub const SYSCALL_BARRIER_WAIT: usize = 14;

pub const SYSCALL_MBOX_OPEN: usize = 15;
pub const SYSCALL_MBOX_CLOSE: usize = 16;
pub const SYSCALL_MBOX_SEND: usize = 17;
pub const SYSCALL_MBOX_RECV: usize = 18;
pub const SYSCALL_MBOX_STAT: usize = 19;

pub const SYSCALL_OPEN: usize = 20;
pub const SYSCALL_CLOSE: usize = 21;
pub const SYSCALL_READ: usize = 22;
pub const SYSCALL_WRITE: usize = 23;
pub const SYSCALL_LSEEK: usize = 24;
pub const SYSCALL_MKDIR: usize = 25;
pub const SYSCALL_CHDIR: usize = 26;
pub const SYSCALL_RMDIR: usize = 27;
pub const SYSCALL_LINK: usize = 28;
pub const SYSCALL_UNLINK: usize = 29;
pub const SYSCALL_STAT: usize = 30;

/// A decoded syscall. Buffers are the caller's, already translated.
pub enum Syscall<'a> {
    Yield,
    Exit,
    GetPid,
    LockInit,
    LockAcquire(LockId),
    LockRelease(LockId),
    ConditionInit,
    ConditionWait(LockId, ConditionId),
    ConditionSignal(ConditionId),
    ConditionBroadcast(ConditionId),
    SemaphoreInit(i32),
    SemaphoreUp(SemaphoreId),
    SemaphoreDown(SemaphoreId),
    BarrierInit(u32),
    BarrierWait(BarrierId),
    MboxOpen(usize),
    MboxClose(usize),
    MboxSend(usize, &'a [u8]),
    MboxRecv(usize, &'a mut Vec<u8>),
    MboxStat(usize, &'a mut i32, &'a mut i32),
    Open(&'a str, u32),
    Close(usize),
    Read(usize, &'a mut [u8]),
    Write(usize, &'a [u8]),
    Lseek(usize, i32, u32),
    Mkdir(&'a str),
    Chdir(&'a str),
    Rmdir(&'a str),
    Link(&'a str, &'a str),
    Unlink(&'a str),
    Stat(usize, &'a mut [u8; 6]),
}

impl Syscall<'_> {
    pub fn number(&self) -> usize {
        match self {
            Syscall::Yield => SYSCALL_YIELD,
            Syscall::Exit => SYSCALL_EXIT,
            Syscall::GetPid => SYSCALL_GETPID,
            Syscall::LockInit => SYSCALL_LOCK_INIT,
            Syscall::LockAcquire(_) => SYSCALL_LOCK_ACQUIRE,
            Syscall::LockRelease(_) => SYSCALL_LOCK_RELEASE,
            Syscall::ConditionInit => SYSCALL_CONDITION_INIT,
            Syscall::ConditionWait(..) => SYSCALL_CONDITION_WAIT,
            Syscall::ConditionSignal(_) => SYSCALL_CONDITION_SIGNAL,
            Syscall::ConditionBroadcast(_) => SYSCALL_CONDITION_BROADCAST,
            Syscall::SemaphoreInit(_) => SYSCALL_SEMAPHORE_INIT,
            Syscall::SemaphoreUp(_) => SYSCALL_SEMAPHORE_UP,
            Syscall::SemaphoreDown(_) => SYSCALL_SEMAPHORE_DOWN,
            Syscall::BarrierInit(_) => SYSCALL_BARRIER_INIT,
            Syscall::BarrierWait(_) => SYSCALL_BARRIER_WAIT,
            Syscall::MboxOpen(_) => SYSCALL_MBOX_OPEN,
            Syscall::MboxClose(_) => SYSCALL_MBOX_CLOSE,
            Syscall::MboxSend(..) => SYSCALL_MBOX_SEND,
            Syscall::MboxRecv(..) => SYSCALL_MBOX_RECV,
            Syscall::MboxStat(..) => SYSCALL_MBOX_STAT,
            Syscall::Open(..) => SYSCALL_OPEN,
            Syscall::Close(_) => SYSCALL_CLOSE,
            Syscall::Read(..) => SYSCALL_READ,
            Syscall::Write(..) => SYSCALL_WRITE,
            Syscall::Lseek(..) => SYSCALL_LSEEK,
            Syscall::Mkdir(_) => SYSCALL_MKDIR,
            Syscall::Chdir(_) => SYSCALL_CHDIR,
            Syscall::Rmdir(_) => SYSCALL_RMDIR,
            Syscall::Link(..) => SYSCALL_LINK,
            Syscall::Unlink(_) => SYSCALL_UNLINK,
            Syscall::Stat(..) => SYSCALL_STAT,
        }
    }
}

fn fold(result: Result<usize, FsError>) -> i64 {
    match result {
        Ok(value) => value as i64,
        Err(err) => err.code() as i64,
    }
}

fn fold_unit(result: Result<(), FsError>) -> i64 {
    fold(result.map(|()| 0))
}

pub fn dispatch(task: &Task, call: Syscall<'_>) -> i64 {
    match call {
        Syscall::Yield => {
            task.yield_now();
            0
        }
        Syscall::Exit => task.exit(),
        Syscall::GetPid => task.pid() as i64,

        Syscall::LockInit => task.lock_init().0 as i64,
        Syscall::LockAcquire(lock) => {
            task.lock_acquire(lock);
            0
        }
        Syscall::LockRelease(lock) => {
            task.lock_release(lock);
            0
        }
        Syscall::ConditionInit => task.condition_init().0 as i64,
        Syscall::ConditionWait(lock, condition) => {
            task.condition_wait(lock, condition);
            0
        }
        Syscall::ConditionSignal(condition) => {
            task.condition_signal(condition);
            0
        }
        Syscall::ConditionBroadcast(condition) => {
            task.condition_broadcast(condition);
            0
        }
        Syscall::SemaphoreInit(value) => task.semaphore_init(value).0 as i64,
        Syscall::SemaphoreUp(semaphore) => {
            task.semaphore_up(semaphore);
            0
        }
        Syscall::SemaphoreDown(semaphore) => {
            task.semaphore_down(semaphore);
            0
        }
        Syscall::BarrierInit(reach) => task.barrier_init(reach).0 as i64,
        Syscall::BarrierWait(barrier) => {
            task.barrier_wait(barrier);
            0
        }

        Syscall::MboxOpen(key) => task.mbox_open(key) as i64,
        Syscall::MboxClose(key) => {
            task.mbox_close(key);
            key as i64
        }
        Syscall::MboxSend(key, message) => {
            task.mbox_send(key, message);
            1
        }
        Syscall::MboxRecv(key, out) => {
            *out = task.mbox_recv(key);
            1
        }
        Syscall::MboxStat(key, count, space) => {
            let (messages, free) = task.mbox_stat(key);
            *count = messages as i32;
            *space = free as i32;
            1
        }

        Syscall::Open(name, mode) => fold(task.fs_open(name, mode)),
        Syscall::Close(fd) => fold_unit(task.fs_close(fd)),
        Syscall::Read(fd, buf) => fold(task.fs_read(fd, buf)),
        Syscall::Write(fd, data) => fold(task.fs_write(fd, data)),
        Syscall::Lseek(fd, offset, whence) => {
            let whence = match whence {
                SEEK_SET => Whence::Set,
                SEEK_CUR => Whence::Cur,
                SEEK_END => Whence::End,
                _ => return FsError::InvalidMode.code() as i64,
            };
            fold_unit(task.fs_lseek(fd, offset, whence))
        }
        Syscall::Mkdir(name) => fold_unit(task.fs_mkdir(name)),
        Syscall::Chdir(path) => fold_unit(task.fs_chdir(path)),
        Syscall::Rmdir(path) => fold_unit(task.fs_rmdir(path)),
        Syscall::Link(linkname, existing) => fold_unit(task.fs_link(linkname, existing)),
        Syscall::Unlink(name) => fold_unit(task.fs_unlink(name)),
        Syscall::Stat(fd, buf) => fold_unit(task.fs_stat(fd).map(|stat| {
            buf[0] = match stat.kind {
                InodeKind::File => 1,
                InodeKind::Dir => 2,
            };
            buf[1] = stat.nlinks as u8;
            buf[2..6].copy_from_slice(&stat.size.to_le_bytes());
        })),
    }
}

// Runtime creation of primitives, for callers arriving via the trap
// surface rather than the boot-time builder.
impl Task {
    pub fn lock_init(&self) -> LockId {
        self.state().lock_create()
    }

    pub fn condition_init(&self) -> ConditionId {
        self.state().condition_create()
    }

    pub fn semaphore_init(&self, value: i32) -> SemaphoreId {
        self.state().semaphore_create(value)
    }

    pub fn barrier_init(&self, reach: u32) -> BarrierId {
        self.state().barrier_create(reach)
    }
}

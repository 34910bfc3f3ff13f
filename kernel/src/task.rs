use crate::constants::MAX_OPEN_FILES;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskKind {
    Process,
    Thread,
}

impl TaskKind {
    pub(crate) fn index(self) -> usize {
        match self {
            TaskKind::Process => 0,
            TaskKind::Thread => 1,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TaskState {
    FirstTimeProcess,
    FirstTimeThread,
    Ready,
    Blocked,
    Exited,
}

#[derive(Clone, Copy)]
pub(crate) struct FileDescriptor {
    pub mode: u32,
    pub inode: i32,
}

impl FileDescriptor {
    const fn unused() -> Self {
        Self {
            mode: crate::constants::MODE_UNUSED,
            inode: -1,
        }
    }
}

/// Task control block. All TCBs live in the scheduler's fixed arena; `next`
/// and `prev` thread the ready ring, and `next` alone chains a wait queue
/// while the task is blocked. A TCB is on exactly one of those lists at a
/// time, or neither once exited.
pub(crate) struct Tcb {
    pub pid: usize,
    pub kind: TaskKind,
    pub state: TaskState,
    pub next: Option<usize>,
    pub prev: Option<usize>,
    // Critical-section depth saved across a context switch.
    pub saved_critical: u32,
    pub page_directory: u32,
    pub swap_loc: u32,
    pub swap_size: u32,
    pub fault_addr: u32,
    pub error_code: u32,
    pub page_fault_count: u32,
    pub cwd: i32,
    pub filedes: [FileDescriptor; MAX_OPEN_FILES],
}

impl Tcb {
    pub fn new(pid: usize, kind: TaskKind, swap_loc: u32, swap_size: u32) -> Self {
        let state = match kind {
            TaskKind::Process => TaskState::FirstTimeProcess,
            TaskKind::Thread => TaskState::FirstTimeThread,
        };
        Self {
            pid,
            kind,
            state,
            next: None,
            prev: None,
            saved_critical: 0,
            page_directory: 0,
            swap_loc,
            swap_size,
            fault_addr: 0,
            error_code: 0,
            page_fault_count: 0,
            cwd: -1,
            filedes: [FileDescriptor::unused(); MAX_OPEN_FILES],
        }
    }
}

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

use spin::{Mutex, MutexGuard};
use thiserror::Error as ThisError;

use crate::block::BlockDevice;
use crate::critical::CriticalGate;
use crate::fs::{FileSys, FsError, FsUsage};
use crate::mbox::{self, Mailbox};
use crate::scheduler::{Scheduler, SwitchStats};
use crate::sync::{BarrierState, ConditionState, LockId, LockState, SemaphoreState};
use crate::task::TaskKind;
use crate::vm::{MemoryError, MemoryManager, VmConfig};

#[derive(ThisError, Debug)]
pub enum KernelError {
    #[error("no tasks have been spawned")]
    NoTasks,

    #[error("the scheduler is already running")]
    AlreadyRunning,

    #[error("task table is full")]
    TaskTableFull,

    #[error("all tasks are blocked; nothing left to run")]
    AllTasksBlocked,

    #[error("a task failed")]
    TaskFailed,

    #[error("memory setup failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("filesystem mount failed: {0}")]
    Fs(#[from] FsError),

    #[error("could not start a task thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct KernelConfig {
    pub vm: VmConfig,
    /// First sector of the filesystem region; sector 1 + kernel sectors on
    /// a real boot image.
    pub fs_start: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            vm: VmConfig::default(),
            fs_start: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Halt {
    AllExited,
    AllBlocked,
    Failed,
}

/// Unwind payload for a voluntary `exit()`; the trampoline swallows it.
struct TaskExit;

pub(crate) struct State {
    pub(crate) sched: Scheduler,
    pub(crate) critical: CriticalGate,
    pub(crate) locks: Vec<LockState>,
    pub(crate) conditions: Vec<ConditionState>,
    pub(crate) semaphores: Vec<SemaphoreState>,
    pub(crate) barriers: Vec<BarrierState>,
    pub(crate) mailboxes: Vec<Mailbox>,
    pub(crate) vm: MemoryManager,
    pub(crate) fs: FileSys,
    pub(crate) disk: Box<dyn BlockDevice>,
    pub(crate) memory_lock: LockId,
    threads: Vec<Thread>,
    handles: Vec<JoinHandle<()>>,
    boot_thread: Option<Thread>,
    halted: Option<Halt>,
    failure: Option<Box<dyn Any + Send>>,
    started: bool,
}

impl State {
    /// Stop the world. First caller wins; everyone parked is woken so their
    /// stacks can unwind.
    fn halt(&mut self, halt: Halt) {
        if self.halted.is_some() {
            return;
        }
        self.halted = Some(halt);
        if let Some(boot) = &self.boot_thread {
            boot.unpark();
        }
        for thread in &self.threads {
            thread.unpark();
        }
    }

    fn save_context(&mut self, slot: usize) {
        let depth = self.critical.depth();
        self.sched.task_mut(slot).saved_critical = depth;
    }

    fn resume_context(&mut self, slot: usize) {
        self.sched.dispatch(slot);
        let depth = self.sched.task(slot).saved_critical;
        self.critical.restore(depth);
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
}

/// The kernel: a fixed table of cooperative tasks over one simulated CPU,
/// plus the memory manager, mailboxes and filesystem they share. Tasks are
/// spawned before `run` and multiplexed until the last one exits.
pub struct Kernel {
    pub(crate) shared: Arc<Shared>,
}

impl Kernel {
    pub fn boot(disk: Box<dyn BlockDevice>, config: KernelConfig) -> Result<Kernel, KernelError> {
        let mut disk = disk;
        let vm = MemoryManager::new(&config.vm, &mut *disk)?;
        let fs = FileSys::mount(&mut *disk, config.fs_start)?;

        let mut state = State {
            sched: Scheduler::new(),
            critical: CriticalGate::new(),
            locks: Vec::new(),
            conditions: Vec::new(),
            semaphores: Vec::new(),
            barriers: Vec::new(),
            mailboxes: Vec::new(),
            vm,
            fs,
            disk,
            memory_lock: LockId(0),
            threads: Vec::new(),
            handles: Vec::new(),
            boot_thread: None,
            halted: None,
            failure: None,
            started: false,
        };
        state.memory_lock = state.lock_create();
        mbox::init_mailboxes(&mut state);

        Ok(Kernel {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
            }),
        })
    }

    pub fn spawn_thread(
        &self,
        body: impl FnOnce(&Task) + Send + 'static,
    ) -> Result<usize, KernelError> {
        self.spawn_task(TaskKind::Thread, 0, 0, Box::new(body))
    }

    /// Spawn a user process whose image lives in `swap_size` sectors at
    /// disk sector `swap_loc`; its pages are faulted in on demand.
    pub fn spawn_process(
        &self,
        swap_loc: u32,
        swap_size: u32,
        body: impl FnOnce(&Task) + Send + 'static,
    ) -> Result<usize, KernelError> {
        self.spawn_task(TaskKind::Process, swap_loc, swap_size, Box::new(body))
    }

    fn spawn_task(
        &self,
        kind: TaskKind,
        swap_loc: u32,
        swap_size: u32,
        body: Box<dyn FnOnce(&Task) + Send>,
    ) -> Result<usize, KernelError> {
        let shared = self.shared.clone();
        let mut st = self.shared.state.lock();
        if st.started {
            return Err(KernelError::AlreadyRunning);
        }
        let slot = st.sched.spawn(kind, swap_loc, swap_size)?;
        if let Err(err) = st.setup_page_table(slot) {
            st.sched.discard(slot);
            return Err(err.into());
        }
        let pid = st.sched.task(slot).pid;
        let handle = thread::Builder::new()
            .name(format!("task-{pid}"))
            .spawn(move || task_main(shared, slot, body))?;
        st.threads.push(handle.thread().clone());
        st.handles.push(handle);
        Ok(pid)
    }

    /// Dispatch the first task and multiplex until every task has exited.
    pub fn run(&mut self) -> Result<(), KernelError> {
        {
            let mut st = self.shared.state.lock();
            if st.started {
                return Err(KernelError::AlreadyRunning);
            }
            st.started = true;
            st.boot_thread = Some(thread::current());
            let first = st.sched.start()?;
            let thread = st.threads[first].clone();
            drop(st);
            thread.unpark();
        }

        loop {
            if self.shared.state.lock().halted.is_some() {
                break;
            }
            thread::park();
        }

        let (handles, halt) = {
            let mut st = self.shared.state.lock();
            for thread in &st.threads {
                thread.unpark();
            }
            let halt = st.halted.expect("halt reason must be set");
            (std::mem::take(&mut st.handles), halt)
        };
        for handle in handles {
            let _ = handle.join();
        }

        let failure = self.shared.state.lock().failure.take();
        if let Some(payload) = failure {
            panic::resume_unwind(payload);
        }

        match halt {
            Halt::AllExited => Ok(()),
            Halt::AllBlocked => Err(KernelError::AllTasksBlocked),
            Halt::Failed => Err(KernelError::TaskFailed),
        }
    }

    /// Stop the kernel (if it is not already stopped) and hand the disk
    /// back, e.g. to inspect what a run persisted.
    pub fn shutdown(self) -> Box<dyn BlockDevice> {
        let handles = {
            let mut st = self.shared.state.lock();
            st.halt(Halt::AllExited);
            std::mem::take(&mut st.handles)
        };
        for handle in handles {
            let _ = handle.join();
        }
        let shared = Arc::try_unwrap(self.shared)
            .ok()
            .expect("task threads must have released the kernel state");
        let mut state = shared.state.into_inner();
        let _ = state.fs.sync(&mut *state.disk);
        state.disk
    }

    pub fn switch_stats(&self) -> SwitchStats {
        self.shared.state.lock().sched.stats()
    }

    pub fn fs_usage(&self) -> FsUsage {
        self.shared.state.lock().fs.usage()
    }

    pub fn task_page_faults(&self, pid: usize) -> Option<u32> {
        self.shared
            .state
            .lock()
            .sched
            .find_pid(pid)
            .map(|t| t.page_fault_count)
    }

    /// Map a physical device-register range one-to-one into the kernel
    /// address space. Boot-time only, like the USB host-controller mapping
    /// it exists for.
    pub fn identity_map(&self, address: u32, size: u32) -> Result<(), MemoryError> {
        let mut st = self.shared.state.lock();
        let state = &mut *st;
        state.vm.identity_map(&mut *state.disk, address, size)
    }

    pub fn lock_create(&self) -> LockId {
        self.shared.state.lock().lock_create()
    }

    pub fn condition_create(&self) -> crate::sync::ConditionId {
        self.shared.state.lock().condition_create()
    }

    pub fn semaphore_create(&self, value: i32) -> crate::sync::SemaphoreId {
        self.shared.state.lock().semaphore_create(value)
    }

    pub fn barrier_create(&self, reach: u32) -> crate::sync::BarrierId {
        self.shared.state.lock().barrier_create(reach)
    }
}

/// Handle a task body uses to reach the kernel: scheduling here, plus the
/// synchronisation, mailbox, memory and filesystem calls implemented in
/// their own modules.
pub struct Task {
    pub(crate) shared: Arc<Shared>,
    pub(crate) slot: usize,
}

impl Task {
    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock()
    }

    pub fn pid(&self) -> usize {
        self.state().sched.task(self.slot).pid
    }

    /// Hand the CPU to the next ready task.
    pub fn yield_now(&self) {
        let thread = {
            let mut st = self.state();
            st.save_context(self.slot);
            let next = st.sched.yield_current();
            st.threads[next].clone()
        };
        thread.unpark();
        self.wait_until_current();
    }

    /// Terminate the calling task and never return.
    pub fn exit(&self) -> ! {
        self.exit_bookkeeping();
        panic::panic_any(TaskExit)
    }

    /// Diagnostic plus termination, for errors with no in-band return path.
    pub(crate) fn fatal(&self, message: &str) -> ! {
        crate::kprintln!("pid {}: {}", self.pid(), message);
        self.exit()
    }

    /// Park until this task is `current_running` again. The scheduler state
    /// was already updated by the caller; this is the stack-switch half.
    pub(crate) fn suspend(&self, mut st: MutexGuard<'_, State>) {
        st.save_context(self.slot);
        match st.sched.current() {
            Some(next) => {
                let thread = st.threads[next].clone();
                drop(st);
                thread.unpark();
            }
            None => {
                st.halt(Halt::AllBlocked);
                drop(st);
            }
        }
        self.wait_until_current();
    }

    pub(crate) fn wait_until_current(&self) {
        loop {
            {
                let mut st = self.state();
                if st.halted.is_some() {
                    drop(st);
                    panic::panic_any(TaskExit);
                }
                if st.sched.current() == Some(self.slot) {
                    st.resume_context(self.slot);
                    return;
                }
            }
            thread::park();
        }
    }

    fn exit_bookkeeping(&self) {
        let mut st = self.state();
        if st.halted.is_some() {
            return;
        }
        st.save_context(self.slot);
        match st.sched.exit_current() {
            Some(next) => {
                let thread = st.threads[next].clone();
                drop(st);
                thread.unpark();
            }
            None => {
                crate::kprintln!("kernel: all tasks have exited");
                st.halt(Halt::AllExited);
            }
        }
    }
}

fn task_main(shared: Arc<Shared>, slot: usize, body: Box<dyn FnOnce(&Task) + Send>) {
    let task = Task { shared, slot };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        task.wait_until_current();
        body(&task);
    }));
    match outcome {
        // Falling off the end of the body is an implicit exit().
        Ok(()) => task.exit_bookkeeping(),
        Err(payload) if payload.is::<TaskExit>() => {}
        Err(payload) => {
            let mut st = task.state();
            st.failure = Some(payload);
            st.halt(Halt::Failed);
        }
    }
}

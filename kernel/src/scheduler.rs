use crate::constants::MAX_TASKS;
use crate::runtime::KernelError;
use crate::task::{TaskKind, TaskState, Tcb};

/// FIFO of blocked tasks, chained through the arena `next` links. Only the
/// head is stored; the tail is found by walking, which keeps the queue
/// itself a single word.
#[derive(Default)]
pub(crate) struct WaitQueue {
    pub head: Option<usize>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// Context-switch accounting, indexed by the kinds of the outgoing and
/// incoming tasks.
#[derive(Clone, Copy, Default, Debug)]
pub struct SwitchStats {
    pub total: u64,
    by_kind: [[u64; 2]; 2],
}

impl SwitchStats {
    pub fn between(&self, from: TaskKind, to: TaskKind) -> u64 {
        self.by_kind[from.index()][to.index()]
    }
}

/// Round-robin scheduler over a fixed TCB arena. The ready ring is a
/// circular doubly-linked list through the arena indices; the policy is
/// purely "advance to the successor". This struct only plans transitions;
/// honouring them (parking one stack, waking another) is the runtime's job.
pub(crate) struct Scheduler {
    tasks: Vec<Tcb>,
    current: Option<usize>,
    stats: SwitchStats,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            current: None,
            stats: SwitchStats::default(),
        }
    }

    pub fn spawn(
        &mut self,
        kind: TaskKind,
        swap_loc: u32,
        swap_size: u32,
    ) -> Result<usize, KernelError> {
        if self.tasks.len() >= MAX_TASKS {
            return Err(KernelError::TaskTableFull);
        }
        let slot = self.tasks.len();
        let pid = slot + 1;
        self.tasks.push(Tcb::new(pid, kind, swap_loc, swap_size));
        if slot == 0 {
            self.tasks[0].next = Some(0);
            self.tasks[0].prev = Some(0);
        } else {
            // Ring order is spawn order: append at the tail, before slot 0.
            self.insert_before(slot, 0);
        }
        Ok(slot)
    }

    /// Undo a spawn whose later setup failed; the slot leaves the ring and
    /// will never be scheduled.
    pub fn discard(&mut self, slot: usize) {
        self.remove_from_ring(slot);
        self.tasks[slot].state = TaskState::Exited;
    }

    pub fn start(&mut self) -> Result<usize, KernelError> {
        if self.tasks.is_empty() {
            return Err(KernelError::NoTasks);
        }
        self.current = Some(0);
        Ok(0)
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn task(&self, slot: usize) -> &Tcb {
        &self.tasks[slot]
    }

    pub fn task_mut(&mut self, slot: usize) -> &mut Tcb {
        &mut self.tasks[slot]
    }

    pub fn find_pid(&self, pid: usize) -> Option<&Tcb> {
        self.tasks.iter().find(|t| t.pid == pid)
    }

    pub fn stats(&self) -> SwitchStats {
        self.stats
    }

    /// First-run bookkeeping for the task about to execute.
    pub fn dispatch(&mut self, slot: usize) {
        let task = &mut self.tasks[slot];
        if matches!(
            task.state,
            TaskState::FirstTimeProcess | TaskState::FirstTimeThread
        ) {
            task.state = TaskState::Ready;
        }
    }

    /// Voluntary yield: hand the CPU to the ring successor.
    pub fn yield_current(&mut self) -> usize {
        let cur = self.current.expect("yield with no running task");
        let next = self.tasks[cur]
            .next
            .expect("running task must be on the ready ring");
        self.note_switch(cur, next);
        self.current = Some(next);
        next
    }

    /// Block the running task on `queue`: out of the ring, onto the FIFO
    /// tail, CPU to the successor. Returns the new current task, or None
    /// when the ring emptied (every task is blocked).
    pub fn block_current(&mut self, queue: &mut WaitQueue) -> Option<usize> {
        let cur = self.current.expect("block with no running task");
        self.tasks[cur].state = TaskState::Blocked;
        let next = self.remove_from_ring(cur);
        self.queue_append(queue, cur);
        if let Some(next) = next {
            self.note_switch(cur, next);
        }
        self.current = next;
        next
    }

    /// Release the head waiter of `queue`. Must be called inside a critical
    /// section. The released task re-enters the ring immediately before the
    /// running task, i.e. at the tail of the round-robin order.
    pub fn unblock(&mut self, queue: &mut WaitQueue) -> Option<usize> {
        let head = queue.head?;
        queue.head = self.tasks[head].next;
        self.tasks[head].next = None;
        self.tasks[head].state = TaskState::Ready;
        let cur = self.current.expect("unblock with no running task");
        self.insert_before(head, cur);
        Some(head)
    }

    /// Terminate the running task. Returns the successor, or None when it
    /// was the last task on the ring.
    pub fn exit_current(&mut self) -> Option<usize> {
        let cur = self.current.expect("exit with no running task");
        self.tasks[cur].state = TaskState::Exited;
        let next = self.remove_from_ring(cur);
        if let Some(next) = next {
            self.note_switch(cur, next);
        }
        self.current = next;
        next
    }

    fn insert_before(&mut self, slot: usize, at: usize) {
        let prev = self.tasks[at].prev.expect("ring node must be linked");
        self.tasks[slot].prev = Some(prev);
        self.tasks[slot].next = Some(at);
        self.tasks[prev].next = Some(slot);
        self.tasks[at].prev = Some(slot);
    }

    /// Splice `slot` out of the ring, clearing its links. Returns the
    /// former successor, or None when `slot` was the only member.
    fn remove_from_ring(&mut self, slot: usize) -> Option<usize> {
        let next = self.tasks[slot].next.expect("task is not on the ring");
        let prev = self.tasks[slot].prev.expect("task is not on the ring");
        self.tasks[slot].next = None;
        self.tasks[slot].prev = None;
        if next == slot {
            return None;
        }
        self.tasks[prev].next = Some(next);
        self.tasks[next].prev = Some(prev);
        Some(next)
    }

    fn queue_append(&mut self, queue: &mut WaitQueue, slot: usize) {
        match queue.head {
            None => queue.head = Some(slot),
            Some(head) => {
                let mut tail = head;
                while let Some(next) = self.tasks[tail].next {
                    tail = next;
                }
                self.tasks[tail].next = Some(slot);
            }
        }
    }

    fn note_switch(&mut self, from: usize, to: usize) {
        self.stats.total += 1;
        self.stats.by_kind[self.tasks[from].kind.index()][self.tasks[to].kind.index()] += 1;
    }

    /// A task is on the ready ring iff its `prev` link is set; wait queues
    /// chain through `next` only.
    #[cfg(test)]
    fn on_ring(&self, slot: usize) -> bool {
        self.tasks[slot].prev.is_some()
    }
}

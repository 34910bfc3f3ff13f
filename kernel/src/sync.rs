use std::mem;

use crate::runtime::{State, Task};
use crate::scheduler::WaitQueue;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LockId(pub(crate) usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConditionId(pub(crate) usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SemaphoreId(pub(crate) usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BarrierId(pub(crate) usize);

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockStatus {
    Unlocked,
    Locked,
}

pub(crate) struct LockState {
    pub status: LockStatus,
    pub waiting: WaitQueue,
}

pub(crate) struct ConditionState {
    pub waiting: WaitQueue,
}

pub(crate) struct SemaphoreState {
    pub counter: i32,
    pub waiting: WaitQueue,
}

pub(crate) struct BarrierState {
    pub counter: u32,
    pub reach: u32,
    pub waiting: WaitQueue,
}

impl State {
    pub(crate) fn lock_create(&mut self) -> LockId {
        self.locks.push(LockState {
            status: LockStatus::Unlocked,
            waiting: WaitQueue::new(),
        });
        LockId(self.locks.len() - 1)
    }

    pub(crate) fn condition_create(&mut self) -> ConditionId {
        self.conditions.push(ConditionState {
            waiting: WaitQueue::new(),
        });
        ConditionId(self.conditions.len() - 1)
    }

    pub(crate) fn semaphore_create(&mut self, value: i32) -> SemaphoreId {
        self.semaphores.push(SemaphoreState {
            counter: value,
            waiting: WaitQueue::new(),
        });
        SemaphoreId(self.semaphores.len() - 1)
    }

    pub(crate) fn barrier_create(&mut self, reach: u32) -> BarrierId {
        self.barriers.push(BarrierState {
            counter: 0,
            reach,
            waiting: WaitQueue::new(),
        });
        BarrierId(self.barriers.len() - 1)
    }
}

// Every operation below establishes its own critical section; blocking
// happens with the section held, and the saved nesting depth is restored
// when the task resumes.
impl Task {
    pub fn lock_acquire(&self, lock: LockId) {
        let mut st = self.state();
        st.critical.enter();
        self.lock_acquire_under_critical(st, lock);
        let mut st = self.state();
        st.critical.leave();
    }

    /// Acquire without entering or leaving the critical section, so
    /// `condition_wait` can compose its release/block/re-acquire sequence
    /// inside one enclosing section. Consumes the state guard; on return
    /// the calling task holds the lock.
    fn lock_acquire_under_critical(&self, mut st: spin::MutexGuard<'_, State>, lock: LockId) {
        if st.locks[lock.0].status == LockStatus::Unlocked {
            st.locks[lock.0].status = LockStatus::Locked;
            return;
        }
        // Contended: join the FIFO. A release hands the lock over directly,
        // so there is nothing to re-check on wakeup.
        let mut queue = mem::take(&mut st.locks[lock.0].waiting);
        st.sched.block_current(&mut queue);
        st.locks[lock.0].waiting = queue;
        self.suspend(st);
    }

    pub fn lock_release(&self, lock: LockId) {
        let mut st = self.state();
        st.critical.enter();
        if st.locks[lock.0].waiting.is_empty() {
            st.locks[lock.0].status = LockStatus::Unlocked;
        } else {
            // Direct hand-off: the lock stays LOCKED and the head waiter
            // becomes the owner.
            let mut queue = mem::take(&mut st.locks[lock.0].waiting);
            st.sched.unblock(&mut queue);
            st.locks[lock.0].waiting = queue;
        }
        st.critical.leave();
    }

    /// Release `lock`, block on `condition`, and re-acquire `lock` before
    /// returning. Mesa semantics: callers re-check their predicate in a
    /// loop.
    pub fn condition_wait(&self, lock: LockId, condition: ConditionId) {
        self.lock_release(lock);
        let mut st = self.state();
        st.critical.enter();
        let mut queue = mem::take(&mut st.conditions[condition.0].waiting);
        st.sched.block_current(&mut queue);
        st.conditions[condition.0].waiting = queue;
        self.suspend(st);
        self.lock_acquire_under_critical(self.state(), lock);
        let mut st = self.state();
        st.critical.leave();
    }

    pub fn condition_signal(&self, condition: ConditionId) {
        let mut st = self.state();
        st.critical.enter();
        if !st.conditions[condition.0].waiting.is_empty() {
            let mut queue = mem::take(&mut st.conditions[condition.0].waiting);
            st.sched.unblock(&mut queue);
            st.conditions[condition.0].waiting = queue;
        }
        st.critical.leave();
    }

    pub fn condition_broadcast(&self, condition: ConditionId) {
        let mut st = self.state();
        st.critical.enter();
        let mut queue = mem::take(&mut st.conditions[condition.0].waiting);
        while st.sched.unblock(&mut queue).is_some() {}
        st.conditions[condition.0].waiting = queue;
        st.critical.leave();
    }

    pub fn semaphore_up(&self, semaphore: SemaphoreId) {
        let mut st = self.state();
        st.critical.enter();
        st.semaphores[semaphore.0].counter += 1;
        if st.semaphores[semaphore.0].counter >= 0
            && !st.semaphores[semaphore.0].waiting.is_empty()
        {
            let mut queue = mem::take(&mut st.semaphores[semaphore.0].waiting);
            st.sched.unblock(&mut queue);
            st.semaphores[semaphore.0].waiting = queue;
        }
        st.critical.leave();
    }

    pub fn semaphore_down(&self, semaphore: SemaphoreId) {
        let mut st = self.state();
        st.critical.enter();
        st.semaphores[semaphore.0].counter -= 1;
        if st.semaphores[semaphore.0].counter < 0 {
            let mut queue = mem::take(&mut st.semaphores[semaphore.0].waiting);
            st.sched.block_current(&mut queue);
            st.semaphores[semaphore.0].waiting = queue;
            self.suspend(st);
            let mut st = self.state();
            st.critical.leave();
        } else {
            st.critical.leave();
        }
    }

    /// Wait until `reach` tasks have arrived; the last arrival releases
    /// everyone and resets the barrier for the next cycle.
    pub fn barrier_wait(&self, barrier: BarrierId) {
        let mut st = self.state();
        st.critical.enter();
        st.barriers[barrier.0].counter += 1;
        if st.barriers[barrier.0].counter == st.barriers[barrier.0].reach {
            let mut queue = mem::take(&mut st.barriers[barrier.0].waiting);
            while st.sched.unblock(&mut queue).is_some() {}
            st.barriers[barrier.0].waiting = queue;
            st.barriers[barrier.0].counter = 0;
            st.critical.leave();
        } else {
            let mut queue = mem::take(&mut st.barriers[barrier.0].waiting);
            st.sched.block_current(&mut queue);
            st.barriers[barrier.0].waiting = queue;
            self.suspend(st);
            let mut st = self.state();
            st.critical.leave();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::runtime::{Kernel, KernelConfig};
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

    fn kernel() -> Kernel {
        Kernel::boot(Box::new(RamDisk::new(2048)), KernelConfig::default()).unwrap()
    }

    #[test]
    fn contended_lock_sections_alternate() {
        let kernel = kernel();
        let lock = kernel.lock_create();
        let holders = Arc::new(StdMutex::new(Vec::new()));

        for name in ["t1", "t2"] {
            let holders = holders.clone();
            kernel
                .spawn_thread(move |task| {
                    for _ in 0..3 {
                        task.lock_acquire(lock);
                        holders.lock().unwrap().push(name);
                        task.yield_now();
                        task.lock_release(lock);
                    }
                })
                .unwrap();
        }

        let mut kernel = kernel;
        kernel.run().unwrap();
        let holders = holders.lock().unwrap();
        assert_eq!(holders.len(), 6, "both tasks make progress");
        // FIFO hand-off keeps the critical sections strictly alternating.
        assert_eq!(*holders, vec!["t1", "t2", "t1", "t2", "t1", "t2"]);
    }

    #[test]
    fn lock_provides_mutual_exclusion_across_yields() {
        let kernel = kernel();
        let lock = kernel.lock_create();
        let inside = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let inside = inside.clone();
            kernel
                .spawn_thread(move |task| {
                    task.lock_acquire(lock);
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    task.yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    task.lock_release(lock);
                })
                .unwrap();
        }

        let mut kernel = kernel;
        kernel.run().unwrap();
    }

    #[test]
    fn semaphore_counter_reflects_ups_minus_downs() {
        let kernel = kernel();
        let semaphore = kernel.semaphore_create(0);
        let resumed = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let resumed = resumed.clone();
            kernel
                .spawn_thread(move |task| {
                    task.semaphore_down(semaphore);
                    resumed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        kernel
            .spawn_thread(move |task| {
                for _ in 0..5 {
                    task.semaphore_up(semaphore);
                }
            })
            .unwrap();

        let mut kernel = kernel;
        kernel.run().unwrap();
        assert_eq!(resumed.load(Ordering::SeqCst), 5);
        let st = kernel.shared.state.lock();
        assert_eq!(st.semaphores[semaphore.0].counter, 0);
        assert!(st.semaphores[semaphore.0].waiting.is_empty());
    }

    #[test]
    fn semaphore_blocks_while_counter_is_negative() {
        let kernel = kernel();
        let semaphore = kernel.semaphore_create(1);
        let order = Arc::new(StdMutex::new(Vec::new()));

        let log = order.clone();
        kernel
            .spawn_thread(move |task| {
                task.semaphore_down(semaphore); // counter 1 -> 0, no block
                log.lock().unwrap().push("first");
                task.yield_now();
                task.semaphore_up(semaphore);
            })
            .unwrap();
        let log = order.clone();
        kernel
            .spawn_thread(move |task| {
                task.semaphore_down(semaphore); // counter 0 -> -1, blocks
                log.lock().unwrap().push("second");
            })
            .unwrap();

        let mut kernel = kernel;
        kernel.run().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn barrier_releases_full_cohorts_and_resets() {
        let kernel = kernel();
        let barrier = kernel.barrier_create(3);
        let crossings = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let crossings = crossings.clone();
            kernel
                .spawn_thread(move |task| {
                    for cycle in 0..2 {
                        task.barrier_wait(barrier);
                        let seen = crossings.fetch_add(1, Ordering::SeqCst) + 1;
                        // Nobody can be a full cycle ahead.
                        assert!(seen <= (cycle + 1) * 3);
                    }
                })
                .unwrap();
        }

        let mut kernel = kernel;
        kernel.run().unwrap();
        assert_eq!(crossings.load(Ordering::SeqCst), 6);
        let st = kernel.shared.state.lock();
        assert_eq!(st.barriers[barrier.0].counter, 0);
        assert!(st.barriers[barrier.0].waiting.is_empty());
    }

    #[test]
    fn condition_signal_wakes_at_most_one_waiter() {
        let kernel = kernel();
        let lock = kernel.lock_create();
        let condition = kernel.condition_create();
        let ready = Arc::new(AtomicI32::new(0));
        let woken = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let ready = ready.clone();
            let woken = woken.clone();
            kernel
                .spawn_thread(move |task| {
                    task.lock_acquire(lock);
                    while ready.load(Ordering::SeqCst) == 0 {
                        task.condition_wait(lock, condition);
                    }
                    ready.fetch_sub(1, Ordering::SeqCst);
                    woken.fetch_add(1, Ordering::SeqCst);
                    task.lock_release(lock);
                })
                .unwrap();
        }
        {
            let ready = ready.clone();
            kernel
                .spawn_thread(move |task| {
                    task.yield_now(); // let both waiters block
                    task.lock_acquire(lock);
                    ready.store(1, Ordering::SeqCst);
                    task.condition_signal(condition);
                    task.lock_release(lock);
                    // One permit, one signal: exactly one waiter gets out,
                    // the other stays blocked until we raise it again.
                    task.yield_now();
                    task.lock_acquire(lock);
                    ready.store(1, Ordering::SeqCst);
                    task.condition_broadcast(condition);
                    task.lock_release(lock);
                })
                .unwrap();
        }

        let mut kernel = kernel;
        kernel.run().unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn broadcast_drains_every_waiter() {
        let kernel = kernel();
        let lock = kernel.lock_create();
        let condition = kernel.condition_create();
        let go = Arc::new(AtomicI32::new(0));
        let out = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let go = go.clone();
            let out = out.clone();
            kernel
                .spawn_thread(move |task| {
                    task.lock_acquire(lock);
                    while go.load(Ordering::SeqCst) == 0 {
                        task.condition_wait(lock, condition);
                    }
                    out.fetch_add(1, Ordering::SeqCst);
                    task.lock_release(lock);
                })
                .unwrap();
        }
        {
            let go = go.clone();
            kernel
                .spawn_thread(move |task| {
                    task.yield_now();
                    task.lock_acquire(lock);
                    go.store(1, Ordering::SeqCst);
                    task.condition_broadcast(condition);
                    task.lock_release(lock);
                })
                .unwrap();
        }

        let mut kernel = kernel;
        kernel.run().unwrap();
        assert_eq!(out.load(Ordering::SeqCst), 4);
    }
}

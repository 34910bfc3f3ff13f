//! Fixed-key mailboxes: a monitor (one lock, two condition variables) over
//! a circular byte ring per slot. Senders wait for space, receivers wait
//! for data, and every wait re-checks its predicate because wakeups are
//! advisory.

use crate::constants::{BUFFER_SIZE, MAX_MBOX, MSG_HEADER_SIZE};
use crate::runtime::{State, Task};
use crate::sync::{ConditionId, LockId};

pub(crate) struct Mailbox {
    pub used: u32,
    pub lock: LockId,
    pub more_space: ConditionId,
    pub more_data: ConditionId,
    pub count: u32,
    pub head: usize,
    pub tail: usize,
    pub buffer: [u8; BUFFER_SIZE],
}

impl Mailbox {
    /// Free bytes in the ring. A full ring has head == tail with messages
    /// present; an empty one has head == tail and no messages.
    pub fn space_available(&self) -> usize {
        if self.tail == self.head && self.count != 0 {
            return 0;
        }
        if self.tail > self.head {
            return self.tail - self.head;
        }
        self.tail + BUFFER_SIZE - self.head
    }

    fn reset(&mut self) {
        self.used = 0;
        self.count = 0;
        self.head = 0;
        self.tail = 0;
    }
}

pub(crate) fn init_mailboxes(state: &mut State) {
    for _ in 0..MAX_MBOX {
        let lock = state.lock_create();
        let more_space = state.condition_create();
        let more_data = state.condition_create();
        state.mailboxes.push(Mailbox {
            used: 0,
            lock,
            more_space,
            more_data,
            count: 0,
            head: 0,
            tail: 0,
            buffer: [0; BUFFER_SIZE],
        });
    }
}

impl Task {
    /// Terminates the caller on an out-of-range key; there is no in-band
    /// error path for mailbox calls.
    fn mbox_monitor(&self, key: usize) -> (LockId, ConditionId, ConditionId) {
        if key >= MAX_MBOX {
            self.fatal("attempted to access a non-existent mailbox");
        }
        let st = self.state();
        let mbox = &st.mailboxes[key];
        (mbox.lock, mbox.more_space, mbox.more_data)
    }

    /// Open the mailbox with the given key; the key doubles as the handle.
    pub fn mbox_open(&self, key: usize) -> usize {
        let (lock, _, _) = self.mbox_monitor(key);
        self.lock_acquire(lock);
        self.state().mailboxes[key].used += 1;
        self.lock_release(lock);
        key
    }

    /// Drop one use of the mailbox; the last close wakes every waiter and
    /// resets the slot.
    pub fn mbox_close(&self, key: usize) {
        let (lock, more_space, more_data) = self.mbox_monitor(key);
        self.lock_acquire(lock);
        let drained = {
            let mut st = self.state();
            let mbox = &mut st.mailboxes[key];
            if mbox.used > 0 {
                mbox.used -= 1;
            }
            mbox.used == 0
        };
        if drained {
            self.condition_broadcast(more_space);
            self.condition_broadcast(more_data);
            self.state().mailboxes[key].reset();
        }
        self.lock_release(lock);
    }

    /// Message count and free buffer bytes.
    pub fn mbox_stat(&self, key: usize) -> (u32, usize) {
        let (lock, _, _) = self.mbox_monitor(key);
        self.lock_acquire(lock);
        let stat = {
            let st = self.state();
            let mbox = &st.mailboxes[key];
            (mbox.count, mbox.space_available())
        };
        self.lock_release(lock);
        stat
    }

    /// Copy `message` into the ring, waiting while it does not fit.
    pub fn mbox_send(&self, key: usize, message: &[u8]) {
        let (lock, more_space, more_data) = self.mbox_monitor(key);
        let needed = MSG_HEADER_SIZE + message.len();
        if needed > BUFFER_SIZE {
            self.fatal("message can never fit in a mailbox buffer");
        }
        self.lock_acquire(lock);
        loop {
            let mut st = self.state();
            let mbox = &mut st.mailboxes[key];
            if mbox.space_available() >= needed {
                let head = mbox.head;
                let len = (message.len() as u32).to_le_bytes();
                for (i, byte) in len.iter().chain(message.iter()).enumerate() {
                    mbox.buffer[(head + i) % BUFFER_SIZE] = *byte;
                }
                mbox.head = (head + needed) % BUFFER_SIZE;
                mbox.count += 1;
                break;
            }
            drop(st);
            self.condition_wait(lock, more_space);
        }
        self.condition_broadcast(more_data);
        self.lock_release(lock);
    }

    /// Fetch the oldest message, waiting while the mailbox is empty.
    pub fn mbox_recv(&self, key: usize) -> Vec<u8> {
        let (lock, more_space, more_data) = self.mbox_monitor(key);
        self.lock_acquire(lock);
        let message = loop {
            let mut st = self.state();
            let mbox = &mut st.mailboxes[key];
            if mbox.count > 0 {
                let tail = mbox.tail;
                // The header is read first to learn the payload size.
                let mut len = [0u8; MSG_HEADER_SIZE];
                for (i, byte) in len.iter_mut().enumerate() {
                    *byte = mbox.buffer[(tail + i) % BUFFER_SIZE];
                }
                let len = u32::from_le_bytes(len) as usize;
                let mut message = vec![0u8; len];
                for (i, byte) in message.iter_mut().enumerate() {
                    *byte = mbox.buffer[(tail + MSG_HEADER_SIZE + i) % BUFFER_SIZE];
                }
                mbox.tail = (tail + MSG_HEADER_SIZE + len) % BUFFER_SIZE;
                mbox.count -= 1;
                break message;
            }
            drop(st);
            self.condition_wait(lock, more_data);
        };
        self.condition_broadcast(more_space);
        self.lock_release(lock);
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::runtime::{Kernel, KernelConfig};
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn kernel() -> Kernel {
        Kernel::boot(Box::new(RamDisk::new(2048)), KernelConfig::default()).unwrap()
    }

    #[test]
    fn send_then_recv_round_trips_the_message() {
        let kernel = kernel();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let out = received.clone();
        kernel
            .spawn_thread(move |task| {
                let q = task.mbox_open(0);
                task.mbox_send(q, b"hello mailbox");
                *out.lock().unwrap() = task.mbox_recv(q);
                task.mbox_close(q);
            })
            .unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();
        assert_eq!(received.lock().unwrap().as_slice(), b"hello mailbox");
    }

    #[test]
    fn producer_consumer_transfers_every_byte() {
        // 64-byte payloads + 4-byte headers in a 256-byte ring: the
        // producer overruns the buffer and must block on moreSpace.
        const MESSAGES: usize = 100;
        const PAYLOAD: usize = 64;

        let kernel = kernel();
        let sent = Arc::new(AtomicUsize::new(0));
        let got = Arc::new(AtomicUsize::new(0));

        {
            let sent = sent.clone();
            kernel
                .spawn_thread(move |task| {
                    let q = task.mbox_open(0);
                    for n in 0..MESSAGES {
                        let payload = [n as u8; PAYLOAD];
                        task.mbox_send(q, &payload);
                        sent.fetch_add(payload.iter().map(|&b| b as usize).sum(), Ordering::SeqCst);
                    }
                    task.mbox_close(q);
                })
                .unwrap();
        }
        {
            let got = got.clone();
            kernel
                .spawn_thread(move |task| {
                    let q = task.mbox_open(0);
                    for n in 0..MESSAGES {
                        let message = task.mbox_recv(q);
                        assert_eq!(message.len(), PAYLOAD);
                        assert!(message.iter().all(|&b| b == n as u8));
                        got.fetch_add(message.iter().map(|&b| b as usize).sum(), Ordering::SeqCst);
                    }
                    task.mbox_close(q);
                })
                .unwrap();
        }

        let mut kernel = kernel;
        kernel.run().unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), got.load(Ordering::SeqCst));
    }

    #[test]
    fn stat_accounts_for_headers_and_payloads() {
        let kernel = kernel();
        kernel
            .spawn_thread(|task| {
                let q = task.mbox_open(1);
                let (count, space) = task.mbox_stat(q);
                assert_eq!((count, space), (0, BUFFER_SIZE));

                task.mbox_send(q, &[0u8; 10]);
                let (count, space) = task.mbox_stat(q);
                assert_eq!(count, 1);
                assert_eq!(space, BUFFER_SIZE - MSG_HEADER_SIZE - 10);

                task.mbox_recv(q);
                let (count, space) = task.mbox_stat(q);
                assert_eq!((count, space), (0, BUFFER_SIZE));
                task.mbox_close(q);
            })
            .unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();
    }

    #[test]
    fn ring_wraps_across_the_buffer_end() {
        let kernel = kernel();
        kernel
            .spawn_thread(|task| {
                let q = task.mbox_open(2);
                // Advance the cursors close to the end of the ring, then
                // push a record that must wrap.
                for _ in 0..3 {
                    task.mbox_send(q, &[0xAA; 60]);
                    task.mbox_recv(q);
                }
                let payload: Vec<u8> = (0..100u8).collect();
                task.mbox_send(q, &payload);
                assert_eq!(task.mbox_recv(q), payload);
                task.mbox_close(q);
            })
            .unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();
    }

    #[test]
    fn invalid_key_terminates_the_caller_only() {
        let kernel = kernel();
        let reached = Arc::new(AtomicBool::new(false));
        let other_ran = Arc::new(AtomicBool::new(false));

        {
            let reached = reached.clone();
            kernel
                .spawn_thread(move |task| {
                    task.mbox_open(MAX_MBOX); // terminates here
                    reached.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }
        {
            let other_ran = other_ran.clone();
            kernel
                .spawn_thread(move |_| {
                    other_ran.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }

        let mut kernel = kernel;
        kernel.run().unwrap();
        assert!(!reached.load(Ordering::SeqCst));
        assert!(other_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn last_close_resets_the_slot() {
        let kernel = kernel();
        kernel
            .spawn_thread(|task| {
                let q = task.mbox_open(3);
                task.mbox_send(q, b"left behind");
                task.mbox_close(q);
                // Reopened: the previous contents are gone.
                let q = task.mbox_open(3);
                let (count, space) = task.mbox_stat(q);
                assert_eq!((count, space), (0, BUFFER_SIZE));
                task.mbox_close(q);
            })
            .unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();
    }
}

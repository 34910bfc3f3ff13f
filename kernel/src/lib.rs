//! Core of a small cooperative operating system, hosted: a fixed table of
//! kernel threads and user processes multiplexed over one simulated CPU,
//! monitor-style synchronisation built on the scheduler's block/unblock
//! hooks, demand-paged virtual memory over a block device, and a simple
//! on-disk filesystem.

pub mod block;
pub mod console;
pub mod constants;
mod critical;
pub mod fs;
mod mbox;
mod runtime;
mod scheduler;
pub mod sync;
pub mod syscall;
mod task;
pub mod vm;

pub use block::{BlockDevice, BlockError, FileDisk, RamDisk};
pub use fs::{FileStat, FsError, FsUsage, InodeKind, Whence};
pub use runtime::{Kernel, KernelConfig, KernelError, Task};
pub use scheduler::SwitchStats;
pub use sync::{BarrierId, ConditionId, LockId, SemaphoreId};
pub use task::TaskKind;
pub use vm::{Eviction, MemoryError, VmConfig};

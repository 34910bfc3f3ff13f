use thiserror::Error as ThisError;

use crate::block::{BlockDevice, BlockError};
use crate::constants::{
    MEM_START, MODE_MASK, PAGE_N_ENTRIES, PAGE_SIZE, PE_BASE_ADDR_MASK, PE_D, PE_P, PE_RW, PE_US,
    PROCESS_ENTRY, PROCESS_STACK, SCREEN_ADDR, SECTOR_SIZE, SECTORS_PER_PAGE,
};
use crate::runtime::{State, Task};
use crate::task::TaskKind;

#[derive(ThisError, Debug)]
pub enum MemoryError {
    #[error("pid {pid}: no unpinned page frame to evict")]
    NoUnpinnedFrame { pid: usize },

    #[error("virtual address {vaddr:#x} has no backing image")]
    Unmapped { vaddr: u32 },

    #[error("disk error during paging: {0}")]
    Block(#[from] BlockError),
}

/// Eviction policy for the pageable frame pool. Victims are picked
/// uniformly at random among unpinned frames; the seed is configuration so
/// tests can pin the victim sequence.
#[derive(Clone, Copy, Debug)]
pub enum Eviction {
    Random { seed: u64 },
}

#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    pub pageable_pages: usize,
    pub stack_pages: usize,
    pub eviction: Eviction,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            pageable_pages: 32,
            stack_pages: 2,
            eviction: Eviction::Random {
                seed: 0x9E37_79B9_7F4A_7C15,
            },
        }
    }
}

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9 } else { seed },
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

/// Snapshot of the owning task taken when a frame is handed out; enough to
/// find the owner's page table and swap sectors at eviction time.
#[derive(Clone, Copy)]
pub(crate) struct Owner {
    pub pid: usize,
    pub page_directory: u32,
    pub swap_loc: u32,
    pub swap_size: u32,
}

impl Owner {
    const KERNEL: Owner = Owner {
        pid: 0,
        page_directory: 0,
        swap_loc: 0,
        swap_size: 0,
    };
}

/// One descriptor per pageable physical frame.
struct FrameDesc {
    vaddr: u32,
    paddr: u32,
    owner: Owner,
    pinned: bool,
}

/// Simulated physical memory: a flat byte array covering everything below
/// the top of the pageable region. Page directories and tables live inside
/// it as 1024-entry u32 arrays, exactly as they would in RAM.
struct PhysMem {
    data: Vec<u8>,
}

impl PhysMem {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    fn read_u32(&self, paddr: u32) -> u32 {
        let at = paddr as usize;
        let bytes: [u8; 4] = self.data[at..at + 4]
            .try_into()
            .expect("four bytes inside physical memory");
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, paddr: u32, value: u32) {
        let at = paddr as usize;
        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn frame(&mut self, paddr: u32) -> &mut [u8] {
        let at = paddr as usize;
        &mut self.data[at..at + PAGE_SIZE]
    }

    fn in_range(&self, paddr: u32, len: usize) -> bool {
        (paddr as usize) + len <= self.data.len()
    }
}

fn directory_index(vaddr: u32) -> u32 {
    vaddr >> 22
}

fn table_index(vaddr: u32) -> u32 {
    (vaddr >> 12) & 0x3FF
}

fn fault_code(write: bool) -> u32 {
    // Page-fault error code: P clear (not-present), W on writes, U always.
    PE_US | if write { PE_RW } else { 0 }
}

pub(crate) struct MemoryManager {
    phys: PhysMem,
    blocks: Vec<FrameDesc>,
    pageable_pages: usize,
    allocated: usize,
    rng: XorShift64,
    pub(crate) kernel_directory: u32,
    pub(crate) stack_pages: usize,
}

impl MemoryManager {
    /// Build the kernel address space: the page directory plus enough
    /// kernel page tables to identity-map all of simulated physical
    /// memory, with the screen page left user-accessible.
    pub fn new(config: &VmConfig, disk: &mut dyn BlockDevice) -> Result<Self, MemoryError> {
        let phys_size = MEM_START as usize + config.pageable_pages * PAGE_SIZE;
        let Eviction::Random { seed } = config.eviction;
        let mut vm = Self {
            phys: PhysMem::new(phys_size),
            blocks: Vec::with_capacity(config.pageable_pages),
            pageable_pages: config.pageable_pages,
            allocated: 0,
            rng: XorShift64::new(seed),
            kernel_directory: 0,
            stack_pages: config.stack_pages,
        };

        vm.kernel_directory = vm.get_memory(disk, true, 0, Owner::KERNEL)?;
        let tables = phys_size.div_ceil(PAGE_SIZE * PAGE_N_ENTRIES);
        let mut paddr: u32 = 0;
        for _ in 0..tables {
            let table = vm.create_table(disk, vm.kernel_directory, paddr, PE_P | PE_RW)?;
            for _ in 0..PAGE_N_ENTRIES {
                if paddr == SCREEN_ADDR {
                    // Processes print directly to video memory.
                    vm.update_entry(table, table_index(paddr), paddr, PE_P | PE_RW | PE_US);
                    let dir_entry = vm.kernel_directory + 4 * directory_index(paddr);
                    let entry = vm.phys.read_u32(dir_entry);
                    vm.phys.write_u32(dir_entry, entry | PE_US);
                } else {
                    vm.update_entry(table, table_index(paddr), paddr, PE_P | PE_RW);
                }
                paddr = paddr.wrapping_add(PAGE_SIZE as u32);
            }
        }
        Ok(vm)
    }

    fn update_entry(&mut self, table: u32, index: u32, base: u32, flags: u32) {
        self.phys
            .write_u32(table + 4 * index, (base & PE_BASE_ADDR_MASK) | (flags & MODE_MASK));
    }

    /// Hand out a physical frame. While the pool lasts, frames come out
    /// sequentially; afterwards an unpinned victim is chosen uniformly at
    /// random, its mapping is torn down, and its contents go back to the
    /// owner's swap sectors if the dirty bit was set.
    pub fn get_memory(
        &mut self,
        disk: &mut dyn BlockDevice,
        pinned: bool,
        vaddr: u32,
        owner: Owner,
    ) -> Result<u32, MemoryError> {
        let index = if self.allocated < self.pageable_pages {
            let paddr = MEM_START + (self.allocated * PAGE_SIZE) as u32;
            self.blocks.push(FrameDesc {
                vaddr: 0,
                paddr,
                owner: Owner::KERNEL,
                pinned: false,
            });
            self.allocated += 1;
            self.allocated - 1
        } else {
            let unpinned: Vec<usize> = (0..self.blocks.len())
                .filter(|&i| !self.blocks[i].pinned)
                .collect();
            if unpinned.is_empty() {
                return Err(MemoryError::NoUnpinnedFrame { pid: owner.pid });
            }
            let victim = unpinned[(self.rng.next() % unpinned.len() as u64) as usize];
            self.evict(disk, victim)?;
            victim
        };

        let paddr = self.blocks[index].paddr;
        self.blocks[index] = FrameDesc {
            vaddr,
            paddr,
            owner,
            pinned,
        };
        self.phys.frame(paddr).fill(0);
        Ok(paddr)
    }

    fn evict(&mut self, disk: &mut dyn BlockDevice, index: usize) -> Result<(), MemoryError> {
        let vaddr = self.blocks[index].vaddr;
        let owner = self.blocks[index].owner;
        let paddr = self.blocks[index].paddr;

        let (table, location, sectors) = self.entry_and_location(vaddr, &owner)?;
        let entry_at = table + 4 * table_index(vaddr);
        let dirty = self.phys.read_u32(entry_at) & PE_D != 0;
        // Clear the flags so the owner's next access faults.
        self.update_entry(table, table_index(vaddr), paddr, 0);

        if dirty {
            for sector in 0..sectors {
                let offset = (sector as usize) * SECTOR_SIZE;
                let frame = self.phys.frame(paddr);
                let data: &[u8; SECTOR_SIZE] = frame[offset..offset + SECTOR_SIZE]
                    .try_into()
                    .expect("sector-sized slice");
                disk.write_sector(location + sector, data)?;
            }
        }
        Ok(())
    }

    /// Page-table entry location and swap sectors for a pageable address
    /// of `owner`. The swap location is the image sector the page was
    /// loaded from, aligned down to a page worth of sectors and clamped to
    /// the image size.
    fn entry_and_location(
        &self,
        vaddr: u32,
        owner: &Owner,
    ) -> Result<(u32, u32, u32), MemoryError> {
        let dir_entry = self
            .phys
            .read_u32(owner.page_directory + 4 * directory_index(vaddr));
        if dir_entry & PE_P == 0 {
            return Err(MemoryError::Unmapped { vaddr });
        }
        let table = dir_entry & PE_BASE_ADDR_MASK;

        if vaddr < PROCESS_ENTRY {
            return Err(MemoryError::Unmapped { vaddr });
        }
        let sector_offset = (vaddr - PROCESS_ENTRY) / SECTOR_SIZE as u32;
        let aligned_offset = (sector_offset / SECTORS_PER_PAGE) * SECTORS_PER_PAGE;
        if aligned_offset >= owner.swap_size {
            return Err(MemoryError::Unmapped { vaddr });
        }
        let sectors = if aligned_offset + SECTORS_PER_PAGE > owner.swap_size {
            owner.swap_size - aligned_offset
        } else {
            SECTORS_PER_PAGE
        };
        Ok((table, owner.swap_loc + aligned_offset, sectors))
    }

    /// Look up the page table for `vaddr` under `directory`, allocating a
    /// pinned frame for it if absent, and stamp the directory entry with
    /// `flags`.
    fn create_table(
        &mut self,
        disk: &mut dyn BlockDevice,
        directory: u32,
        vaddr: u32,
        flags: u32,
    ) -> Result<u32, MemoryError> {
        let entry_at = directory + 4 * directory_index(vaddr);
        let entry = self.phys.read_u32(entry_at);
        let table = if entry & PE_P == 0 {
            self.get_memory(disk, true, vaddr, Owner::KERNEL)?
        } else {
            entry & PE_BASE_ADDR_MASK
        };
        self.phys
            .write_u32(entry_at, (table & PE_BASE_ADDR_MASK) | (flags & MODE_MASK));
        Ok(table)
    }

    /// One-to-one mapping for device registers in high memory.
    pub fn identity_map(
        &mut self,
        disk: &mut dyn BlockDevice,
        address: u32,
        size: u32,
    ) -> Result<(), MemoryError> {
        let pages = size.div_ceil(PAGE_SIZE as u32);
        let tables = pages / PAGE_N_ENTRIES as u32 + 1;
        let mut added = 0;
        let mut addr = address;
        for _ in 0..tables {
            let table = self.create_table(disk, self.kernel_directory, addr, PE_P | PE_RW | PE_US)?;
            for _ in 0..PAGE_N_ENTRIES {
                if added >= pages {
                    break;
                }
                self.update_entry(table, table_index(addr), addr, PE_P | PE_RW | PE_US);
                addr = addr.wrapping_add(PAGE_SIZE as u32);
                added += 1;
            }
        }
        Ok(())
    }

    /// Walk the two-level table for `vaddr`. A successful write access
    /// sets the dirty bit, as the MMU would. A miss reports the page-fault
    /// error code.
    fn translate(&mut self, directory: u32, vaddr: u32, write: bool) -> Result<u32, u32> {
        let dir_entry = self.phys.read_u32(directory + 4 * directory_index(vaddr));
        if dir_entry & PE_P == 0 {
            return Err(fault_code(write));
        }
        let entry_at = (dir_entry & PE_BASE_ADDR_MASK) + 4 * table_index(vaddr);
        let entry = self.phys.read_u32(entry_at);
        if entry & PE_P == 0 {
            return Err(fault_code(write));
        }
        if write {
            self.phys.write_u32(entry_at, entry | PE_D);
        }
        Ok((entry & PE_BASE_ADDR_MASK) | (vaddr & (PAGE_SIZE as u32 - 1)))
    }
}

impl State {
    /// Give a freshly spawned task its address space. Threads share the
    /// kernel directory; a process gets a private directory seeded with
    /// the kernel's entries, pinned stack pages, and not-present entries
    /// covering its image so first touches fault the pages in.
    pub(crate) fn setup_page_table(&mut self, slot: usize) -> Result<(), MemoryError> {
        let state = &mut *self;
        let vm = &mut state.vm;
        let disk = &mut *state.disk;
        let task = state.sched.task_mut(slot);

        if task.kind == TaskKind::Thread {
            task.page_directory = vm.kernel_directory;
            return Ok(());
        }

        let mut owner = Owner {
            pid: task.pid,
            page_directory: 0,
            swap_loc: task.swap_loc,
            swap_size: task.swap_size,
        };
        let directory = vm.get_memory(disk, true, 0, owner)?;
        task.page_directory = directory;
        owner.page_directory = directory;

        // Keep the kernel and any identity-mapped device regions visible.
        for i in 0..PAGE_N_ENTRIES as u32 {
            let entry = vm.phys.read_u32(vm.kernel_directory + 4 * i);
            vm.phys.write_u32(directory + 4 * i, entry);
        }

        let stack_table = vm.create_table(disk, directory, PROCESS_STACK, PE_P | PE_RW | PE_US)?;
        for j in 0..vm.stack_pages {
            let stack_addr = PROCESS_STACK - (j * PAGE_SIZE) as u32;
            let page = vm.get_memory(disk, true, stack_addr, owner)?;
            vm.update_entry(stack_table, table_index(stack_addr), page, PE_P | PE_RW | PE_US);
        }

        let pages = (owner.swap_size as usize).div_ceil(SECTORS_PER_PAGE as usize);
        let tables = pages / PAGE_N_ENTRIES + 1;
        let mut vaddr = PROCESS_ENTRY;
        let mut added = 0;
        for _ in 0..tables {
            let table = vm.create_table(disk, directory, vaddr, PE_P | PE_RW | PE_US)?;
            for _ in 0..PAGE_N_ENTRIES {
                if added >= pages {
                    break;
                }
                // Not present yet; RW|US marks the page as demand-loaded.
                vm.update_entry(table, table_index(vaddr), 0, PE_RW | PE_US);
                vaddr = vaddr.wrapping_add(PAGE_SIZE as u32);
                added += 1;
            }
        }
        Ok(())
    }
}

impl Task {
    /// Read guest memory at `vaddr`, faulting pages in as needed.
    pub fn mem_read(&self, vaddr: u32, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let at = vaddr + done as u32;
            let chunk = self.span_len(at, buf.len() - done);
            let paddr = self.translate_or_fault(at, false);
            let st = self.state();
            if !st.vm.phys.in_range(paddr, chunk) {
                drop(st);
                self.fatal("physical access outside simulated memory");
            }
            let frame_off = paddr as usize;
            buf[done..done + chunk].copy_from_slice(&st.vm.phys.data[frame_off..frame_off + chunk]);
            done += chunk;
        }
    }

    /// Write guest memory at `vaddr`, faulting pages in as needed and
    /// leaving them dirty.
    pub fn mem_write(&self, vaddr: u32, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let at = vaddr + done as u32;
            let chunk = self.span_len(at, data.len() - done);
            let paddr = self.translate_or_fault(at, true);
            let mut st = self.state();
            if !st.vm.phys.in_range(paddr, chunk) {
                drop(st);
                self.fatal("physical access outside simulated memory");
            }
            let frame_off = paddr as usize;
            st.vm.phys.data[frame_off..frame_off + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
    }

    pub fn mem_read_u32(&self, vaddr: u32) -> u32 {
        let mut bytes = [0u8; 4];
        self.mem_read(vaddr, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    pub fn mem_write_u32(&self, vaddr: u32, value: u32) {
        self.mem_write(vaddr, &value.to_le_bytes());
    }

    fn span_len(&self, vaddr: u32, remaining: usize) -> usize {
        let to_page_end = PAGE_SIZE - (vaddr as usize & (PAGE_SIZE - 1));
        remaining.min(to_page_end)
    }

    fn translate_or_fault(&self, vaddr: u32, write: bool) -> u32 {
        loop {
            let error_code = {
                let mut st = self.state();
                let directory = st.sched.task(self.slot).page_directory;
                match st.vm.translate(directory, vaddr, write) {
                    Ok(paddr) => return paddr,
                    Err(code) => code,
                }
            };
            self.page_fault(vaddr, error_code);
        }
    }

    /// The page-fault path. Interrupts are on; the whole handler runs
    /// under the global memory lock. Unservable faults terminate the task.
    fn page_fault(&self, vaddr: u32, error_code: u32) {
        let memory_lock = self.state().memory_lock;
        self.lock_acquire(memory_lock);

        let verdict: Result<(), &str> = {
            let mut st = self.state();
            let state = &mut *st;
            let task = state.sched.task_mut(self.slot);
            task.page_fault_count += 1;
            task.fault_addr = vaddr;
            task.error_code = error_code;

            if vaddr == 0 {
                Err("null pointer dereference")
            } else if error_code & PE_P != 0 {
                Err("access violation")
            } else {
                let owner = Owner {
                    pid: task.pid,
                    page_directory: task.page_directory,
                    swap_loc: task.swap_loc,
                    swap_size: task.swap_size,
                };
                Self::service_fault(state, vaddr, owner)
            }
        };

        match verdict {
            Ok(()) => self.lock_release(memory_lock),
            Err(message) => {
                let text = format!("page fault at {vaddr:#x}: {message}");
                self.lock_release(memory_lock);
                self.fatal(&text);
            }
        }
    }

    fn service_fault(state: &mut State, vaddr: u32, owner: Owner) -> Result<(), &'static str> {
        let vm = &mut state.vm;
        let disk = &mut *state.disk;

        let (table, location, sectors) = match vm.entry_and_location(vaddr, &owner) {
            Ok(found) => found,
            Err(_) => return Err("no backing image for this address"),
        };
        let page = match vm.get_memory(disk, false, vaddr, owner) {
            Ok(page) => page,
            Err(MemoryError::NoUnpinnedFrame { .. }) => return Err("no unpinned memory free"),
            Err(_) => return Err("paging I/O failed"),
        };
        for sector in 0..sectors {
            let offset = (sector as usize) * SECTOR_SIZE;
            let frame = vm.phys.frame(page);
            if disk
                .read_part(location + sector, 0, &mut frame[offset..offset + SECTOR_SIZE])
                .is_err()
            {
                return Err("paging I/O failed");
            }
        }
        vm.update_entry(table, table_index(vaddr), page, PE_P | PE_RW | PE_US);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::runtime::{Kernel, KernelConfig};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const IMAGE_SECTOR: u32 = 1500;
    const IMAGE_SECTORS: u32 = 24; // three pages

    fn image_disk() -> RamDisk {
        let mut disk = RamDisk::new(2048);
        for s in 0..IMAGE_SECTORS {
            let sector = [(IMAGE_SECTOR + s) as u8; SECTOR_SIZE];
            disk.write_sector(IMAGE_SECTOR + s, &sector).unwrap();
        }
        disk
    }

    fn tiny_pool_config() -> KernelConfig {
        // Pinned frames: kernel directory + kernel table + process
        // directory + stack table + one stack page + code table = 6, so a
        // seven-frame pool leaves exactly one evictable frame.
        KernelConfig {
            vm: VmConfig {
                pageable_pages: 7,
                stack_pages: 1,
                eviction: Eviction::Random { seed: 42 },
            },
            fs_start: 0,
        }
    }

    #[test]
    fn stack_pages_are_mapped_up_front() {
        let kernel = Kernel::boot(Box::new(image_disk()), KernelConfig::default()).unwrap();
        let faults = Arc::new(AtomicU32::new(u32::MAX));
        let seen = faults.clone();
        let pid = kernel
            .spawn_process(IMAGE_SECTOR, IMAGE_SECTORS, move |task| {
                task.mem_write_u32(PROCESS_STACK, 0xDEAD_BEEF);
                assert_eq!(task.mem_read_u32(PROCESS_STACK), 0xDEAD_BEEF);
                seen.store(0, Ordering::SeqCst);
            })
            .unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();
        assert_eq!(faults.load(Ordering::SeqCst), 0);
        assert_eq!(kernel.task_page_faults(pid), Some(0), "stack must not fault");
    }

    #[test]
    fn demand_paging_loads_pages_from_the_image() {
        let kernel = Kernel::boot(Box::new(image_disk()), KernelConfig::default()).unwrap();
        let pid = kernel
            .spawn_process(IMAGE_SECTOR, IMAGE_SECTORS, |task| {
                for page in 0..3u32 {
                    let vaddr = PROCESS_ENTRY + page * PAGE_SIZE as u32;
                    let expected_byte = (IMAGE_SECTOR + page * SECTORS_PER_PAGE) as u8;
                    let word = task.mem_read_u32(vaddr);
                    assert_eq!(word, u32::from_le_bytes([expected_byte; 4]));
                }
            })
            .unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();
        assert_eq!(kernel.task_page_faults(pid), Some(3));
    }

    #[test]
    fn eviction_writes_dirty_pages_back_to_swap() {
        let kernel = Kernel::boot(Box::new(image_disk()), tiny_pool_config()).unwrap();
        let pid = kernel
            .spawn_process(IMAGE_SECTOR, IMAGE_SECTORS, |task| {
                // Dirty page 0, then touch the other two pages. With a
                // single evictable frame each touch evicts the previous
                // page, so page 0 goes back to its swap sectors.
                task.mem_write_u32(PROCESS_ENTRY, 0xCAFE_F00D);
                task.mem_read_u32(PROCESS_ENTRY + PAGE_SIZE as u32);
                task.mem_read_u32(PROCESS_ENTRY + 2 * PAGE_SIZE as u32);
                // Faulting page 0 back in must observe the written value.
                assert_eq!(task.mem_read_u32(PROCESS_ENTRY), 0xCAFE_F00D);
            })
            .unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();
        assert!(kernel.task_page_faults(pid).unwrap() >= 4);

        // The dirty victim reached the disk, not just the frame pool.
        let mut disk = kernel.shutdown();
        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_sector(IMAGE_SECTOR, &mut sector).unwrap();
        assert_eq!(u32::from_le_bytes(sector[0..4].try_into().unwrap()), 0xCAFE_F00D);
        // Bytes beyond the written word keep the image pattern.
        assert_eq!(sector[100], IMAGE_SECTOR as u8);
    }

    #[test]
    fn clean_pages_are_not_written_back() {
        let kernel = Kernel::boot(Box::new(image_disk()), tiny_pool_config()).unwrap();
        kernel
            .spawn_process(IMAGE_SECTOR, IMAGE_SECTORS, |task| {
                task.mem_read_u32(PROCESS_ENTRY);
                task.mem_read_u32(PROCESS_ENTRY + PAGE_SIZE as u32);
                task.mem_read_u32(PROCESS_ENTRY);
            })
            .unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();

        let mut disk = kernel.shutdown();
        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_sector(IMAGE_SECTOR, &mut sector).unwrap();
        assert!(sector.iter().all(|&b| b == IMAGE_SECTOR as u8));
    }

    #[test]
    fn null_dereference_terminates_the_task() {
        let kernel = Kernel::boot(Box::new(image_disk()), KernelConfig::default()).unwrap();
        let reached = Arc::new(AtomicBool::new(false));
        let seen = reached.clone();
        kernel
            .spawn_process(IMAGE_SECTOR, IMAGE_SECTORS, move |task| {
                task.mem_read_u32(0);
                seen.store(true, Ordering::SeqCst);
            })
            .unwrap();
        kernel.spawn_thread(|_| {}).unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();
        assert!(!reached.load(Ordering::SeqCst));
    }

    #[test]
    fn access_outside_the_image_terminates_the_task() {
        let kernel = Kernel::boot(Box::new(image_disk()), KernelConfig::default()).unwrap();
        let reached = Arc::new(AtomicBool::new(false));
        let seen = reached.clone();
        kernel
            .spawn_process(IMAGE_SECTOR, IMAGE_SECTORS, move |task| {
                // Two pages past a three-page image.
                task.mem_read_u32(PROCESS_ENTRY + 5 * PAGE_SIZE as u32);
                seen.store(true, Ordering::SeqCst);
            })
            .unwrap();
        kernel.spawn_thread(|_| {}).unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();
        assert!(!reached.load(Ordering::SeqCst));
    }

    #[test]
    fn threads_share_the_kernel_identity_mapping() {
        let kernel = Kernel::boot(Box::new(image_disk()), KernelConfig::default()).unwrap();
        kernel
            .spawn_thread(|task| {
                // The screen page is identity-mapped and writable.
                task.mem_write(SCREEN_ADDR, b"ok");
                let mut back = [0u8; 2];
                task.mem_read(SCREEN_ADDR, &mut back);
                assert_eq!(&back, b"ok");
            })
            .unwrap();
        let mut kernel = kernel;
        kernel.run().unwrap();
    }

    #[test]
    fn identity_map_installs_one_to_one_entries() {
        let kernel = Kernel::boot(Box::new(image_disk()), KernelConfig::default()).unwrap();
        kernel.identity_map(0xFEC0_0000, 2 * PAGE_SIZE as u32).unwrap();

        let mut st = kernel.shared.state.lock();
        let directory = st.vm.kernel_directory;
        assert_eq!(
            st.vm.translate(directory, 0xFEC0_1000, false),
            Ok(0xFEC0_1000),
            "device registers map one-to-one"
        );
        assert!(
            st.vm.translate(directory, 0xFEC0_2000, false).is_err(),
            "mapping ends at the requested size"
        );
    }

    #[test]
    fn boot_fails_when_the_pool_cannot_hold_the_kernel_tables() {
        let config = KernelConfig {
            vm: VmConfig {
                pageable_pages: 1, // directory fits, kernel table does not
                stack_pages: 1,
                eviction: Eviction::Random { seed: 1 },
            },
            fs_start: 0,
        };
        assert!(Kernel::boot(Box::new(RamDisk::new(64)), config).is_err());
    }
}

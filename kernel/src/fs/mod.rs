mod bitmap;
mod layout;

use thiserror::Error as ThisError;

use crate::block::{BlockDevice, BlockError};
use crate::constants::{
    BITMAP_BLOCKS, BITMAP_BYTES, BLOCK_SIZE, DIRENT_SIZE, INODE_BLOCKS, INODE_NDIRECT, INODE_SIZE,
    INODES_PER_BLOCK, MAX_FILESIZE, MAX_INODES, MAX_OPEN_FILES, MODE_CREAT, MODE_RDONLY,
    MODE_UNUSED, MODE_WRONLY, NDATA_BLKS,
};
use crate::runtime::Task;
use crate::task::FileDescriptor;

use bitmap::Bitmap;
use layout::{Dirent, DiskInode, INTYPE_DIR, INTYPE_FILE, SUPERBLOCK_SIZE, SuperBlock};

#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("filesystem error")]
    Error,

    #[error("no more inodes")]
    NoMoreInodes,

    #[error("filesystem is full")]
    Full,

    #[error("file table is full")]
    InodeTableFull,

    #[error("no such file or directory")]
    NotExist,

    #[error("invalid mode")]
    InvalidMode,

    #[error("invalid name")]
    InvalidName,

    #[error("not a directory")]
    DirIsFile,

    #[error("end of file")]
    Eof,
}

impl FsError {
    /// The numeric code returned through the syscall boundary; FSE_OK is 0.
    pub const fn code(self) -> i32 {
        match self {
            FsError::Error => -1,
            FsError::NoMoreInodes => -2,
            FsError::Full => -3,
            FsError::InodeTableFull => -4,
            FsError::NotExist => -5,
            FsError::InvalidMode => -6,
            FsError::InvalidName => -7,
            FsError::DirIsFile => -8,
            FsError::Eof => -9,
        }
    }
}

impl From<BlockError> for FsError {
    fn from(_: BlockError) -> Self {
        FsError::Error
    }
}

pub type Result<T> = core::result::Result<T, FsError>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeKind {
    File,
    Dir,
}

#[derive(Clone, Copy, Debug)]
pub struct FileStat {
    pub kind: InodeKind,
    pub nlinks: i16,
    pub size: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FsUsage {
    pub inodes_used: usize,
    pub data_blocks_used: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// In-memory inode: the disk half plus bookkeeping. `pos` is the inode's
/// read/write cursor, shared by every descriptor open on it.
#[derive(Clone, Copy)]
struct MemInode {
    d: DiskInode,
    open_count: u32,
    pos: i32,
    dirty: bool,
    inode_num: u16,
}

impl MemInode {
    fn cleared(inode_num: u16) -> Self {
        Self {
            d: DiskInode::cleared(),
            open_count: 0,
            pos: 0,
            dirty: false,
            inode_num,
        }
    }
}

/// The filesystem lives in a contiguous run of sectors starting at
/// `start`: superblock, inode bitmap, data bitmap, inode blocks, data
/// blocks. Syscalls never yield between their block operations, so the
/// cooperative scheduler is the only lock this state needs.
pub(crate) struct FileSys {
    start: u32,
    sb: SuperBlock,
    inode_bmap: Bitmap,
    dblk_bmap: Bitmap,
    inodes: Vec<MemInode>,
}

impl FileSys {
    /// Check the superblock and load the inode table; anything that does
    /// not look like this filesystem is reformatted.
    pub fn mount(disk: &mut dyn BlockDevice, start: u32) -> Result<FileSys> {
        let mut fs = FileSys {
            start,
            sb: SuperBlock {
                ninodes: 0,
                ndata_blks: 0,
                max_filesize: 0,
                root_inode: 0,
            },
            inode_bmap: Bitmap::new(),
            dblk_bmap: Bitmap::new(),
            inodes: (0..MAX_INODES as u16).map(MemInode::cleared).collect(),
        };

        let mut raw = [0u8; SUPERBLOCK_SIZE];
        disk.read_part(start, 0, &mut raw)?;
        fs.sb = SuperBlock::from_bytes(&raw);

        if fs.sb.ninodes != MAX_INODES as u32
            || fs.sb.ndata_blks != NDATA_BLKS
            || fs.sb.max_filesize != MAX_FILESIZE as u32
            || fs.sb.root_inode >= MAX_INODES as u32
        {
            fs.mkfs(disk)?;
            return Ok(fs);
        }

        fs.load_bitmaps(disk)?;
        for id in 0..MAX_INODES as u16 {
            if fs.inode_bmap.is_set(id as usize) && fs.load_inode(disk, id).is_err() {
                // No data recovery: a bad inode is dropped with a notice.
                crate::kprintln!("fs: freeing corrupted inode {id}");
                fs.free_inode(disk, id)?;
            }
        }
        Ok(fs)
    }

    pub fn mkfs(&mut self, disk: &mut dyn BlockDevice) -> Result<()> {
        self.inode_bmap.clear();
        self.dblk_bmap.clear();
        self.save_bitmaps(disk)?;
        for (id, inode) in self.inodes.iter_mut().enumerate() {
            *inode = MemInode::cleared(id as u16);
        }
        self.sb = SuperBlock {
            ninodes: MAX_INODES as u32,
            ndata_blks: NDATA_BLKS,
            max_filesize: MAX_FILESIZE as u32,
            root_inode: 0,
        };
        let root = self.create_directory(disk, -1)?;
        self.sb.root_inode = root as u32;
        disk.modify(self.start, 0, &self.sb.to_bytes())?;
        Ok(())
    }

    pub fn root(&self) -> u16 {
        self.sb.root_inode as u16
    }

    /// Write back any in-memory inode still marked dirty.
    pub fn sync(&mut self, disk: &mut dyn BlockDevice) -> Result<()> {
        for at in 0..self.inodes.len() {
            if self.inodes[at].dirty {
                let id = self.inodes[at].inode_num;
                self.save_inode(disk, id)?;
            }
        }
        Ok(())
    }

    pub fn usage(&self) -> FsUsage {
        FsUsage {
            inodes_used: self.inode_bmap.used_count(),
            data_blocks_used: self.dblk_bmap.used_count(),
        }
    }

    fn inode(&self, id: u16) -> &MemInode {
        &self.inodes[id as usize]
    }

    fn inode_mut(&mut self, id: u16) -> &mut MemInode {
        &mut self.inodes[id as usize]
    }

    // Block number holding inode `ino`: superblock + two bitmap sectors
    // come first, then 16 inodes per block.
    fn ino2blk(&self, ino: u16) -> u32 {
        self.start + 1 + BITMAP_BLOCKS + ino as u32 / INODES_PER_BLOCK as u32
    }

    fn idx2blk(&self, index: i16) -> Result<u32> {
        if index < 0 || index as u32 >= self.sb.ndata_blks {
            return Err(FsError::Error);
        }
        Ok(self.start + 1 + BITMAP_BLOCKS + INODE_BLOCKS + index as u32)
    }

    fn save_bitmaps(&mut self, disk: &mut dyn BlockDevice) -> Result<()> {
        disk.modify(self.start + 1, 0, self.inode_bmap.as_bytes())?;
        disk.modify(self.start + 2, 0, self.dblk_bmap.as_bytes())?;
        Ok(())
    }

    fn load_bitmaps(&mut self, disk: &mut dyn BlockDevice) -> Result<()> {
        let mut raw = [0u8; BITMAP_BYTES];
        disk.read_part(self.start + 1, 0, &mut raw)?;
        self.inode_bmap = Bitmap::from_bytes(raw);
        disk.read_part(self.start + 2, 0, &mut raw)?;
        self.dblk_bmap = Bitmap::from_bytes(raw);
        Ok(())
    }

    fn save_inode(&mut self, disk: &mut dyn BlockDevice, id: u16) -> Result<()> {
        if !self.inode(id).dirty {
            return Ok(());
        }
        let block = self.ino2blk(id);
        let offset = (id as usize % INODES_PER_BLOCK) * INODE_SIZE;
        let bytes = self.inode(id).d.to_bytes();
        disk.modify(block, offset, &bytes)?;
        self.inode_mut(id).dirty = false;
        Ok(())
    }

    /// Read and validate one inode: plausible type, size within bounds,
    /// and every referenced data block actually allocated.
    fn load_inode(&mut self, disk: &mut dyn BlockDevice, id: u16) -> Result<()> {
        let mut raw = [0u8; INODE_SIZE];
        let offset = (id as usize % INODES_PER_BLOCK) * INODE_SIZE;
        disk.read_part(self.ino2blk(id), offset, &mut raw)?;
        let d = DiskInode::from_bytes(&raw);
        // Install before validating so a rejected inode can still be freed
        // along with whatever blocks it referenced.
        self.inodes[id as usize] = MemInode {
            d,
            open_count: 0,
            pos: 0,
            dirty: false,
            inode_num: id,
        };

        if d.itype != INTYPE_FILE && d.itype != INTYPE_DIR {
            return Err(FsError::Error);
        }
        if d.size < 0 || d.size as usize > self.sb.max_filesize as usize {
            return Err(FsError::Error);
        }
        let blocks = (d.size as usize).div_ceil(BLOCK_SIZE);
        for k in 0..blocks {
            let block = d.direct[k];
            if block < 0 || !self.dblk_bmap.is_set(block as usize) {
                return Err(FsError::Error);
            }
        }
        Ok(())
    }

    /// Grow or shrink a file to `new_size`. Block count follows the "+1"
    /// rule: `new_size / BLOCK_SIZE + 1` blocks stay allocated, so a write
    /// landing exactly on the size always has a block under it. On a full
    /// data bitmap the blocks claimed by this call are rolled back.
    fn resize_inode(&mut self, disk: &mut dyn BlockDevice, id: u16, new_size: usize) -> Result<()> {
        if new_size > self.sb.max_filesize as usize {
            return Err(FsError::Full);
        }
        let blocks = new_size / BLOCK_SIZE + 1;
        let mut claimed: Vec<(usize, usize)> = Vec::new();
        for x in 0..INODE_NDIRECT {
            if x < blocks {
                if self.inode(id).d.direct[x] != -1 {
                    continue;
                }
                let got = self.dblk_bmap.get_free_entry();
                match got {
                    Some(entry) if entry < self.sb.ndata_blks as usize => {
                        self.inode_mut(id).d.direct[x] = entry as i16;
                        claimed.push((x, entry));
                    }
                    _ => {
                        if let Some(entry) = got {
                            self.dblk_bmap.free_entry(entry);
                        }
                        for (slot, entry) in claimed {
                            self.dblk_bmap.free_entry(entry);
                            self.inode_mut(id).d.direct[slot] = -1;
                        }
                        return Err(FsError::Full);
                    }
                }
            } else if self.inode(id).d.direct[x] != -1 {
                let entry = self.inode(id).d.direct[x];
                self.dblk_bmap.free_entry(entry as usize);
                self.inode_mut(id).d.direct[x] = -1;
            }
        }
        self.inode_mut(id).d.size = new_size as i32;
        self.inode_mut(id).dirty = true;
        self.save_bitmaps(disk)?;
        self.save_inode(disk, id)
    }

    /// Allocate a fresh inode, typed as a file until told otherwise. The
    /// caller links it into a directory or frees it.
    fn create_inode(&mut self, disk: &mut dyn BlockDevice) -> Result<u16> {
        let Some(id) = self.inode_bmap.get_free_entry() else {
            return Err(FsError::NoMoreInodes);
        };
        if id >= MAX_INODES {
            self.inode_bmap.free_entry(id);
            return Err(FsError::NoMoreInodes);
        }
        self.save_bitmaps(disk)?;
        self.inodes[id] = MemInode {
            d: DiskInode::empty_file(),
            open_count: 0,
            pos: 0,
            dirty: true,
            inode_num: id as u16,
        };
        Ok(id as u16)
    }

    /// Release an inode and every data block it references.
    fn free_inode(&mut self, disk: &mut dyn BlockDevice, id: u16) -> Result<()> {
        for x in 0..INODE_NDIRECT {
            let block = self.inode(id).d.direct[x];
            if block != -1 {
                self.dblk_bmap.free_entry(block as usize);
            }
        }
        self.inode_bmap.free_entry(id as usize);
        self.inodes[id as usize] = MemInode::cleared(id);
        self.save_bitmaps(disk)
    }

    /// Drop one link; the inode is freed when none remain. Directories are
    /// freed outright since they cannot be hardlinked.
    fn reduce_links(&mut self, disk: &mut dyn BlockDevice, id: u16) -> Result<()> {
        let inode = self.inode_mut(id);
        inode.d.nlinks -= 1;
        inode.dirty = true;
        if inode.d.nlinks <= 0 || inode.d.itype == INTYPE_DIR {
            self.free_inode(disk, id)
        } else {
            self.save_inode(disk, id)
        }
    }

    /// Copy up to `buf.len()` bytes starting at `start_pos` out of the
    /// file, clamped to its size. Returns the bytes read.
    fn db_read(
        &self,
        disk: &mut dyn BlockDevice,
        id: u16,
        buf: &mut [u8],
        start_pos: usize,
    ) -> Result<usize> {
        let size = self.inode(id).d.size as usize;
        let finish = (start_pos + buf.len()).min(size);
        if finish <= start_pos {
            return Ok(0);
        }
        let mut pos = start_pos;
        let mut read = 0;
        while pos < finish {
            let offset = pos % BLOCK_SIZE;
            let span = (BLOCK_SIZE - offset).min(finish - pos);
            let block = self.inode(id).d.direct[pos / BLOCK_SIZE];
            disk.read_part(self.idx2blk(block)?, offset, &mut buf[read..read + span])?;
            pos += span;
            read += span;
        }
        Ok(read)
    }

    /// Write `data` starting at `start_pos`, resizing the file to the end
    /// of the write first (clamped to the maximum file size). Returns the
    /// bytes written.
    fn db_write(
        &mut self,
        disk: &mut dyn BlockDevice,
        id: u16,
        data: &[u8],
        start_pos: usize,
    ) -> Result<usize> {
        let finish = (start_pos + data.len()).min(self.sb.max_filesize as usize);
        self.resize_inode(disk, id, finish)?;
        if finish <= start_pos {
            return Ok(0);
        }
        let mut pos = start_pos;
        let mut written = 0;
        while pos < finish {
            let offset = pos % BLOCK_SIZE;
            let span = (BLOCK_SIZE - offset).min(finish - pos);
            let block = self.inode(id).d.direct[pos / BLOCK_SIZE];
            disk.modify(self.idx2blk(block)?, offset, &data[written..written + span])?;
            pos += span;
            written += span;
        }
        Ok(written)
    }

    fn dir_entries(&self, disk: &mut dyn BlockDevice, dir: u16) -> Result<Vec<Dirent>> {
        let size = self.inode(dir).d.size as usize;
        let mut raw = vec![0u8; size];
        let read = self.db_read(disk, dir, &mut raw, 0)?;
        Ok(raw[..read]
            .chunks_exact(DIRENT_SIZE)
            .map(|chunk| {
                let bytes: &[u8; DIRENT_SIZE] =
                    chunk.try_into().expect("dirent-sized chunk");
                Dirent::from_bytes(bytes)
            })
            .collect())
    }

    fn find_in_dir(&self, disk: &mut dyn BlockDevice, dir: u16, name: &str) -> Result<Option<u16>> {
        Ok(self
            .dir_entries(disk, dir)?
            .iter()
            .find(|entry| entry.name_matches(name))
            .map(|entry| entry.inode))
    }

    /// Append one entry record to `dir` and count the new link on the
    /// target inode.
    fn create_directory_entry(
        &mut self,
        disk: &mut dyn BlockDevice,
        dir: u16,
        inode: u16,
        name: &str,
    ) -> Result<()> {
        let entry = Dirent::new(name, inode);
        let old_size = self.inode(dir).d.size as usize;
        self.resize_inode(disk, dir, old_size + DIRENT_SIZE)?;
        self.db_write(disk, dir, &entry.to_bytes(), old_size)?;
        self.inode_mut(inode).d.nlinks += 1;
        self.inode_mut(inode).dirty = true;
        self.save_inode(disk, inode)
    }

    /// Remove the first entry for `id` from `dir`, deleting `id`'s own
    /// contents first when it is a directory. Iterative on an explicit
    /// work stack; every removal shrinks exactly one entry from its
    /// parent.
    fn remove_directory_entry(&mut self, disk: &mut dyn BlockDevice, dir: u16, id: u16) -> Result<()> {
        let mut stack = vec![(dir, id)];
        while let Some(&(parent, target)) = stack.last() {
            if self.inode(target).d.itype == INTYPE_DIR {
                if let Some(child) = self.first_removable_child(disk, target)? {
                    stack.push((target, child));
                    continue;
                }
            }
            stack.pop();
            self.unlink_entry(disk, parent, target)?;
        }
        Ok(())
    }

    /// First entry of `dir` other than "." and "..".
    fn first_removable_child(&self, disk: &mut dyn BlockDevice, dir: u16) -> Result<Option<u16>> {
        Ok(self
            .dir_entries(disk, dir)?
            .iter()
            .find(|entry| !entry.name_matches(".") && !entry.name_matches(".."))
            .map(|entry| entry.inode))
    }

    fn unlink_entry(&mut self, disk: &mut dyn BlockDevice, dir: u16, id: u16) -> Result<()> {
        let entries = self.dir_entries(disk, dir)?;
        let mut rebuilt = Vec::with_capacity(entries.len().saturating_sub(1) * DIRENT_SIZE);
        let mut removed = false;
        for entry in entries {
            if !removed && entry.inode == id {
                removed = true;
                continue;
            }
            rebuilt.extend_from_slice(&entry.to_bytes());
        }
        if !removed {
            return Err(FsError::NotExist);
        }
        self.reduce_links(disk, id)?;
        self.resize_inode(disk, dir, rebuilt.len())?;
        self.db_write(disk, dir, &rebuilt, 0)?;
        Ok(())
    }

    /// New directory holding "." and ".."; `parent < 0` means the
    /// directory is its own parent (the root).
    fn create_directory(&mut self, disk: &mut dyn BlockDevice, parent: i32) -> Result<u16> {
        let dir = self.create_inode(disk)?;
        let parent = if parent < 0 { dir } else { parent as u16 };
        self.inode_mut(dir).d.itype = INTYPE_DIR;
        let linked = self
            .create_directory_entry(disk, dir, dir, ".")
            .and_then(|()| self.create_directory_entry(disk, dir, parent, ".."));
        if linked.is_err() {
            self.free_inode(disk, dir)?;
            return Err(FsError::Full);
        }
        self.inode_mut(dir).dirty = true;
        self.save_inode(disk, dir)?;
        Ok(dir)
    }

    fn create_file(&mut self, disk: &mut dyn BlockDevice, dir: u16, name: &str) -> Result<u16> {
        let file = self.create_inode(disk)?;
        if let Err(err) = self.create_directory_entry(disk, dir, file, name) {
            self.free_inode(disk, file)?;
            return Err(err);
        }
        self.save_inode(disk, file)?;
        self.save_bitmaps(disk)?;
        Ok(file)
    }

    /// Resolve a path to an inode: from the root for absolute paths, from
    /// `cwd` otherwise. An empty remainder names the directory itself.
    fn name2inode(&self, disk: &mut dyn BlockDevice, cwd: u16, path: &str) -> Result<Option<u16>> {
        let (mut dir, mut rest) = match path.strip_prefix('/') {
            Some(rest) => (self.root(), rest),
            None => (cwd, path),
        };
        loop {
            while let Some(stripped) = rest.strip_prefix('/') {
                rest = stripped;
            }
            if rest.is_empty() {
                return Ok(Some(dir));
            }
            if self.inode(dir).d.itype != INTYPE_DIR {
                return Ok(None);
            }
            let (component, remainder) = match rest.split_once('/') {
                Some((component, remainder)) => (component, remainder),
                None => (rest, ""),
            };
            match self.find_in_dir(disk, dir, component)? {
                Some(next) => {
                    dir = next;
                    rest = remainder;
                }
                None => return Ok(None),
            }
        }
    }
}

// Filesystem syscalls run on the caller's kernel stack; state they need
// beyond the filesystem itself lives in the TCB (cwd and the open-file
// table).
impl Task {
    pub fn fs_open(&self, name: &str, mode: u32) -> Result<usize> {
        let mut st = self.state();
        let state = &mut *st;
        let fs = &mut state.fs;
        let disk = &mut *state.disk;
        let task = state.sched.task_mut(self.slot);
        if task.cwd < 0 {
            task.cwd = fs.root() as i32;
        }
        let cwd = task.cwd as u16;

        let Some(fd) = task.filedes.iter().position(|f| f.mode == MODE_UNUSED) else {
            return Err(FsError::InodeTableFull);
        };
        let inode = match fs.name2inode(disk, cwd, name)? {
            Some(inode) => inode,
            None if mode & MODE_CREAT != 0 && !name.contains('/') => {
                fs.create_file(disk, cwd, name)?
            }
            None => return Err(FsError::NotExist),
        };
        task.filedes[fd] = FileDescriptor {
            mode,
            inode: inode as i32,
        };
        fs.inode_mut(inode).pos = 0;
        fs.inode_mut(inode).open_count += 1;
        Ok(fd)
    }

    pub fn fs_close(&self, fd: usize) -> Result<()> {
        let mut st = self.state();
        let state = &mut *st;
        let fs = &mut state.fs;
        let task = state.sched.task_mut(self.slot);
        if fd >= MAX_OPEN_FILES {
            return Err(FsError::InvalidMode);
        }
        if task.filedes[fd].mode == MODE_UNUSED {
            return Ok(());
        }
        let inode = task.filedes[fd].inode as u16;
        fs.inode_mut(inode).pos = 0;
        fs.inode_mut(inode).open_count = fs.inode(inode).open_count.saturating_sub(1);
        task.filedes[fd] = FileDescriptor {
            mode: MODE_UNUSED,
            inode: -1,
        };
        Ok(())
    }

    pub fn fs_read(&self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state();
        let state = &mut *st;
        let fs = &mut state.fs;
        let disk = &mut *state.disk;
        let task = state.sched.task_mut(self.slot);
        let entry = *task.filedes.get(fd).ok_or(FsError::InvalidMode)?;
        if entry.mode & MODE_RDONLY == 0 {
            return Err(FsError::InvalidMode);
        }
        let inode = entry.inode as u16;
        let pos = fs.inode(inode).pos as usize;
        let read = fs.db_read(disk, inode, buf, pos)?;
        lseek_inner(fs, disk, entry, read as i32, Whence::Cur)?;
        Ok(read)
    }

    pub fn fs_write(&self, fd: usize, data: &[u8]) -> Result<usize> {
        let mut st = self.state();
        let state = &mut *st;
        let fs = &mut state.fs;
        let disk = &mut *state.disk;
        let task = state.sched.task_mut(self.slot);
        let entry = *task.filedes.get(fd).ok_or(FsError::InvalidMode)?;
        if entry.mode & MODE_WRONLY == 0 {
            return Err(FsError::InvalidMode);
        }
        let inode = entry.inode as u16;
        let pos = fs.inode(inode).pos as usize;
        let written = fs.db_write(disk, inode, data, pos)?;
        lseek_inner(fs, disk, entry, written as i32, Whence::Cur)?;
        Ok(written)
    }

    /// Move the file cursor. Seeking past the end of a writable file
    /// allocates the blocks in between (there are no holes); a read-only
    /// descriptor reports end-of-file instead.
    pub fn fs_lseek(&self, fd: usize, offset: i32, whence: Whence) -> Result<()> {
        let mut st = self.state();
        let state = &mut *st;
        let fs = &mut state.fs;
        let disk = &mut *state.disk;
        let task = state.sched.task_mut(self.slot);
        let entry = *task.filedes.get(fd).ok_or(FsError::InvalidMode)?;
        lseek_inner(fs, disk, entry, offset, whence)
    }

    pub fn fs_mkdir(&self, name: &str) -> Result<()> {
        let mut st = self.state();
        let state = &mut *st;
        let fs = &mut state.fs;
        let disk = &mut *state.disk;
        let task = state.sched.task_mut(self.slot);
        if task.cwd < 0 {
            task.cwd = fs.root() as i32;
        }
        let cwd = task.cwd as u16;
        let dir = fs.create_directory(disk, cwd as i32)?;
        if fs.create_directory_entry(disk, cwd, dir, name).is_err() {
            fs.free_inode(disk, dir)?;
            return Err(FsError::Full);
        }
        Ok(())
    }

    pub fn fs_chdir(&self, path: &str) -> Result<()> {
        let mut st = self.state();
        let state = &mut *st;
        let fs = &mut state.fs;
        let disk = &mut *state.disk;
        let task = state.sched.task_mut(self.slot);
        if task.cwd < 0 {
            task.cwd = fs.root() as i32;
        }
        let id = fs
            .name2inode(disk, task.cwd as u16, path)?
            .ok_or(FsError::NotExist)?;
        if fs.inode(id).d.itype != INTYPE_DIR {
            return Err(FsError::DirIsFile);
        }
        task.cwd = id as i32;
        Ok(())
    }

    /// Remove a directory and, recursively, everything below it.
    pub fn fs_rmdir(&self, path: &str) -> Result<()> {
        let mut st = self.state();
        let state = &mut *st;
        let fs = &mut state.fs;
        let disk = &mut *state.disk;
        let task = state.sched.task_mut(self.slot);
        if task.cwd < 0 {
            task.cwd = fs.root() as i32;
        }
        let cwd = task.cwd as u16;

        let (parent_path, last) = match path.rsplit_once('/') {
            Some((parent, last)) => (Some(parent), last),
            None => (None, path),
        };
        if last.is_empty() || last == "." || last == ".." {
            return Err(FsError::InvalidName);
        }
        let parent = match parent_path {
            None => cwd,
            Some("") => fs.root(), // "/name"
            Some(prefix) => fs
                .name2inode(disk, cwd, prefix)?
                .ok_or(FsError::NotExist)?,
        };
        let target = fs
            .name2inode(disk, cwd, path)?
            .ok_or(FsError::NotExist)?;
        if fs.inode(parent).d.itype != INTYPE_DIR || fs.inode(target).d.itype != INTYPE_DIR {
            return Err(FsError::NotExist);
        }
        fs.remove_directory_entry(disk, parent, target)
    }

    /// Hard-link `existing` under a second name in the working directory.
    pub fn fs_link(&self, linkname: &str, existing: &str) -> Result<()> {
        let mut st = self.state();
        let state = &mut *st;
        let fs = &mut state.fs;
        let disk = &mut *state.disk;
        let task = state.sched.task_mut(self.slot);
        if task.cwd < 0 {
            task.cwd = fs.root() as i32;
        }
        let cwd = task.cwd as u16;
        let id = fs
            .name2inode(disk, cwd, existing)?
            .ok_or(FsError::NotExist)?;
        if fs.inode(id).d.itype == INTYPE_DIR {
            return Err(FsError::NotExist);
        }
        fs.create_directory_entry(disk, cwd, id, linkname)
    }

    pub fn fs_unlink(&self, linkname: &str) -> Result<()> {
        let mut st = self.state();
        let state = &mut *st;
        let fs = &mut state.fs;
        let disk = &mut *state.disk;
        let task = state.sched.task_mut(self.slot);
        if task.cwd < 0 {
            task.cwd = fs.root() as i32;
        }
        let cwd = task.cwd as u16;
        let id = fs
            .find_in_dir(disk, cwd, linkname)?
            .ok_or(FsError::NotExist)?;
        fs.remove_directory_entry(disk, cwd, id)
    }

    pub fn fs_stat(&self, fd: usize) -> Result<FileStat> {
        let st = self.state();
        let task = st.sched.task(self.slot);
        let entry = *task.filedes.get(fd).ok_or(FsError::InvalidMode)?;
        if entry.mode == MODE_UNUSED {
            return Err(FsError::InvalidMode);
        }
        let inode = &st.fs.inode(entry.inode as u16).d;
        Ok(FileStat {
            kind: if inode.itype == INTYPE_DIR {
                InodeKind::Dir
            } else {
                InodeKind::File
            },
            nlinks: inode.nlinks,
            size: inode.size,
        })
    }
}

fn lseek_inner(
    fs: &mut FileSys,
    disk: &mut dyn BlockDevice,
    entry: FileDescriptor,
    offset: i32,
    whence: Whence,
) -> Result<()> {
    if entry.mode == MODE_UNUSED {
        return Err(FsError::InvalidMode);
    }
    let inode = entry.inode as u16;
    let size = fs.inode(inode).d.size;
    let pos = match whence {
        Whence::Set => offset,
        Whence::Cur => offset + fs.inode(inode).pos,
        Whence::End => offset + size,
    };
    if pos < 0 {
        return Err(FsError::Error);
    }
    if pos > size {
        if entry.mode & MODE_WRONLY == 0 {
            return Err(FsError::Eof);
        }
        if pos as usize > fs.sb.max_filesize as usize {
            return Err(FsError::Full);
        }
        fs.resize_inode(disk, inode, pos as usize)?;
    }
    fs.inode_mut(inode).pos = pos;
    Ok(())
}

// Scheduling limits.
pub const MAX_TASKS: usize = 16;
pub const MAX_OPEN_FILES: usize = 8;

// Physical memory layout (32-bit machine model).
pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_N_ENTRIES: usize = 1024;
pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_PAGE: u32 = (PAGE_SIZE / SECTOR_SIZE) as u32;

// Pageable frames start above the low identity-mapped megabyte.
pub const MEM_START: u32 = 0x10_0000;
pub const SCREEN_ADDR: u32 = 0xB_8000;

// User process address space: image at PROCESS_ENTRY, stack growing down
// from PROCESS_STACK.
pub const PROCESS_ENTRY: u32 = 0x100_0000;
pub const PROCESS_STACK: u32 = 0xEFFF_F000;

// Page directory / table entry flag bits.
pub const PE_P: u32 = 1 << 0;
pub const PE_RW: u32 = 1 << 1;
pub const PE_US: u32 = 1 << 2;
pub const PE_D: u32 = 1 << 6;
pub const PE_BASE_ADDR_MASK: u32 = 0xFFFF_F000;
pub const MODE_MASK: u32 = 0xFFF;

// Mailboxes: fixed keys, circular byte ring per slot. Each record in the
// ring is a 4-byte little-endian payload length followed by the payload.
pub const MAX_MBOX: usize = 5;
pub const BUFFER_SIZE: usize = 256;
pub const MSG_HEADER_SIZE: usize = 4;

// Filesystem geometry. 16 inodes of 32 bytes per 512-byte block; the two
// bitmaps cover 2048 entries each, which bounds both inode count and data
// block count.
pub const BLOCK_SIZE: usize = 512;
pub const MAX_INODES: usize = 512;
pub const INODE_SIZE: usize = 32;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
pub const INODE_BLOCKS: u32 = 32;
pub const BITMAP_BYTES: usize = 256;
pub const BITMAP_BLOCKS: u32 = 2;
pub const FS_BLOCKS: u32 = 1024;
pub const NDATA_BLKS: u32 = FS_BLOCKS - INODE_BLOCKS - BITMAP_BLOCKS - 1;
pub const MAX_FILESIZE: usize = 4096;
// Eight blocks hold MAX_FILESIZE bytes; the ninth satisfies the resize
// policy's "+1" rule at exact block multiples.
pub const INODE_NDIRECT: usize = 9;
pub const MAX_FILENAME_LEN: usize = 14;
pub const DIRENT_SIZE: usize = 16;

// Open-file modes and lseek whence values, as seen by the syscall layer.
pub const MODE_UNUSED: u32 = 0;
pub const MODE_RDONLY: u32 = 1;
pub const MODE_WRONLY: u32 = 2;
pub const MODE_RDWR: u32 = 3;
pub const MODE_CREAT: u32 = 4;

pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

use std::fs;
use std::path::Path;

use goblin::elf::Elf;
use goblin::elf::program_header::PT_LOAD;
use thiserror::Error as ThisError;

pub const SECTOR_SIZE: usize = 512;
/// Byte offset inside the bootblock where the kernel sector count lives;
/// the boot stub reads it into AL for INT 13h AH=02h.
pub const OS_SIZE_LOC: usize = 2;
pub const DEFAULT_OUTPUT: &str = "image";

#[derive(ThisError, Debug)]
pub enum ImageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("elf parse error: {0}")]
    Parsing(#[from] goblin::error::Error),

    #[error("bootblock unpacks to {size} bytes, expected exactly {SECTOR_SIZE}")]
    BadBootblock { size: usize },

    #[error("kernel files contain no loadable segments")]
    EmptyKernel,

    #[error("kernel of {sectors} sectors does not fit the 16-bit size field")]
    KernelTooLarge { sectors: usize },
}

pub type Result<T> = std::result::Result<T, ImageError>;

#[derive(Clone, Copy, Debug)]
pub struct SegmentInfo {
    pub memsz: u64,
    pub filesz: u64,
    pub offset: u64,
    pub vaddr: u64,
}

pub struct FileReport {
    pub name: String,
    pub segments: Vec<SegmentInfo>,
    /// First sector of this file's segments within the image.
    pub start_sector: usize,
}

pub struct ImageReport {
    pub files: Vec<FileReport>,
    pub padding: usize,
    pub os_size: u16,
}

/// Pull the loadable segments out of an ELF: `p_memsz` bytes starting at
/// `p_offset`, zero-filled past the end of the initialised data.
fn extract_segments(data: &[u8]) -> Result<(Vec<u8>, Vec<SegmentInfo>)> {
    let elf = Elf::parse(data)?;
    let mut bytes = Vec::new();
    let mut infos = Vec::new();
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD {
            continue;
        }
        let offset = ph.p_offset as usize;
        let memsz = ph.p_memsz as usize;
        let filesz = (ph.p_filesz as usize).min(memsz);
        let available = data.len().saturating_sub(offset).min(filesz);
        bytes.extend_from_slice(&data[offset..offset + available]);
        bytes.resize(bytes.len() + (memsz - available), 0);
        infos.push(SegmentInfo {
            memsz: ph.p_memsz,
            filesz: ph.p_filesz,
            offset: ph.p_offset,
            vaddr: ph.p_vaddr,
        });
    }
    Ok((bytes, infos))
}

/// Assemble a bootable image: the bootblock's single sector, then every
/// kernel file's segments back to back, zero-padded to a sector multiple,
/// with the kernel sector count patched into the bootblock as LE u16.
pub fn build_image(output: &Path, bootblock: &Path, kernels: &[impl AsRef<Path>]) -> Result<ImageReport> {
    let boot_data = fs::read(bootblock)?;
    let (boot, boot_segments) = extract_segments(&boot_data)?;
    if boot.len() != SECTOR_SIZE {
        return Err(ImageError::BadBootblock { size: boot.len() });
    }

    let mut files = vec![FileReport {
        name: bootblock.display().to_string(),
        segments: boot_segments,
        start_sector: 0,
    }];

    let mut kernel = Vec::new();
    for path in kernels {
        let path = path.as_ref();
        let start_sector = 1 + kernel.len().div_ceil(SECTOR_SIZE);
        let data = fs::read(path)?;
        let (segment_bytes, segments) = extract_segments(&data)?;
        kernel.extend_from_slice(&segment_bytes);
        files.push(FileReport {
            name: path.display().to_string(),
            segments,
            start_sector,
        });
    }
    if kernel.is_empty() {
        return Err(ImageError::EmptyKernel);
    }

    let padding = (SECTOR_SIZE - kernel.len() % SECTOR_SIZE) % SECTOR_SIZE;
    kernel.resize(kernel.len() + padding, 0);
    let sectors = kernel.len() / SECTOR_SIZE;
    let os_size =
        u16::try_from(sectors).map_err(|_| ImageError::KernelTooLarge { sectors })?;

    let mut image = boot;
    image.extend_from_slice(&kernel);
    image[OS_SIZE_LOC..OS_SIZE_LOC + 2].copy_from_slice(&os_size.to_le_bytes());
    fs::write(output, &image)?;

    Ok(ImageReport {
        files,
        padding,
        os_size,
    })
}

/// Read back the patched kernel sector count of an existing image.
pub fn read_os_size(image: &Path) -> Result<u16> {
    let data = fs::read(image)?;
    if data.len() < OS_SIZE_LOC + 2 {
        return Err(ImageError::BadBootblock { size: data.len() });
    }
    Ok(u16::from_le_bytes([data[OS_SIZE_LOC], data[OS_SIZE_LOC + 1]]))
}

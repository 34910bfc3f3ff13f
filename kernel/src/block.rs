use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error as ThisError;

use crate::constants::SECTOR_SIZE;

#[derive(ThisError, Debug)]
pub enum BlockError {
    #[error("sector {lba} out of range (device has {sectors} sectors)")]
    OutOfRange { lba: u32, sectors: u32 },

    #[error("partial access of {len} bytes at offset {offset} exceeds the sector")]
    BadRange { offset: usize, len: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, BlockError>;

/// Fixed 512-byte sector device, the contract a USB/SCSI driver would
/// expose. Partial-sector reads and read-modify-write updates are what the
/// filesystem builds everything on.
pub trait BlockDevice: Send {
    fn sector_count(&self) -> u32;

    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()>;

    fn write_sector(&mut self, lba: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()>;

    fn read_part(&mut self, lba: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_span(offset, buf.len())?;
        let mut sector = [0u8; SECTOR_SIZE];
        self.read_sector(lba, &mut sector)?;
        buf.copy_from_slice(&sector[offset..offset + buf.len()]);
        Ok(())
    }

    fn modify(&mut self, lba: u32, offset: usize, data: &[u8]) -> Result<()> {
        check_span(offset, data.len())?;
        let mut sector = [0u8; SECTOR_SIZE];
        self.read_sector(lba, &mut sector)?;
        sector[offset..offset + data.len()].copy_from_slice(data);
        self.write_sector(lba, &sector)
    }
}

fn check_span(offset: usize, len: usize) -> Result<()> {
    if offset + len > SECTOR_SIZE {
        return Err(BlockError::BadRange { offset, len });
    }
    Ok(())
}

pub struct RamDisk {
    sectors: Vec<[u8; SECTOR_SIZE]>,
}

impl RamDisk {
    pub fn new(sectors: u32) -> Self {
        Self {
            sectors: vec![[0u8; SECTOR_SIZE]; sectors as usize],
        }
    }

    fn sector(&mut self, lba: u32) -> Result<&mut [u8; SECTOR_SIZE]> {
        let count = self.sectors.len() as u32;
        self.sectors
            .get_mut(lba as usize)
            .ok_or(BlockError::OutOfRange { lba, sectors: count })
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u32 {
        self.sectors.len() as u32
    }

    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        buf.copy_from_slice(self.sector(lba)?);
        Ok(())
    }

    fn write_sector(&mut self, lba: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.sector(lba)?.copy_from_slice(buf);
        Ok(())
    }
}

/// Disk backed by a host file, typically a `createimage` output. Reads past
/// the current end of file yield zeroes; writes extend it, which is how the
/// filesystem region materialises behind the kernel image.
pub struct FileDisk {
    file: File,
    sectors: u32,
}

impl FileDisk {
    pub fn open(path: &Path, sectors: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, sectors })
    }

    pub fn create(path: &Path, sectors: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file, sectors })
    }

    fn check(&self, lba: u32) -> Result<()> {
        if lba >= self.sectors {
            return Err(BlockError::OutOfRange {
                lba,
                sectors: self.sectors,
            });
        }
        Ok(())
    }
}

impl BlockDevice for FileDisk {
    fn sector_count(&self) -> u32 {
        self.sectors
    }

    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.check(lba)?;
        self.file
            .seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64))?;
        buf.fill(0);
        let mut filled = 0;
        while filled < SECTOR_SIZE {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break; // past end of file, rest stays zero
            }
            filled += n;
        }
        Ok(())
    }

    fn write_sector(&mut self, lba: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.check(lba)?;
        self.file
            .seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }
}

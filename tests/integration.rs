//! End-to-end: build a bootable image with the host tool, then boot the
//! kernel on a disk backed by that image and exercise paging and the
//! filesystem against it.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use cohort::image::{self, SECTOR_SIZE};
use kernel::constants::{MODE_CREAT, MODE_RDONLY, MODE_RDWR, PAGE_SIZE, PROCESS_ENTRY};
use kernel::{FileDisk, Kernel, KernelConfig, Whence};

const EHSIZE: usize = 52;
const PHENTSIZE: usize = 32;

/// Minimal little-endian ELF32 executable holding the given segments.
fn tiny_elf(segments: &[&[u8]]) -> Vec<u8> {
    let mut elf = Vec::new();
    elf.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1]);
    elf.resize(16, 0);
    elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf.extend_from_slice(&3u16.to_le_bytes()); // EM_386
    elf.extend_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
    elf.extend_from_slice(&0x8000u32.to_le_bytes()); // e_entry
    elf.extend_from_slice(&(EHSIZE as u32).to_le_bytes()); // e_phoff
    elf.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
    elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    elf.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes());

    let mut data_offset = EHSIZE + segments.len() * PHENTSIZE;
    for segment in segments {
        elf.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        elf.extend_from_slice(&(data_offset as u32).to_le_bytes());
        elf.extend_from_slice(&0x8000u32.to_le_bytes());
        elf.extend_from_slice(&0x8000u32.to_le_bytes());
        elf.extend_from_slice(&(segment.len() as u32).to_le_bytes());
        elf.extend_from_slice(&(segment.len() as u32).to_le_bytes());
        elf.extend_from_slice(&5u32.to_le_bytes());
        elf.extend_from_slice(&4u32.to_le_bytes());
        data_offset += segment.len();
    }
    for segment in segments {
        elf.extend_from_slice(segment);
    }
    elf
}

fn bootblock_elf() -> Vec<u8> {
    let mut block = vec![0u8; SECTOR_SIZE];
    block[510] = 0x55;
    block[511] = 0xAA;
    tiny_elf(&[&block])
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("cohort-it-{}-{}", std::process::id(), name))
}

struct Cleanup(Vec<PathBuf>);
impl Drop for Cleanup {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = fs::remove_file(path);
        }
    }
}

#[test]
fn image_boots_pages_and_persists_a_filesystem() {
    let boot = temp_path("boot");
    let kern = temp_path("kernel");
    let proc_img = temp_path("proc");
    let out = temp_path("image");
    let _cleanup = Cleanup(vec![boot.clone(), kern.clone(), proc_img.clone(), out.clone()]);

    // One-sector kernel, then a two-page process image with a recognisable
    // per-page pattern.
    fs::write(&boot, bootblock_elf()).unwrap();
    fs::write(&kern, tiny_elf(&[&[0xEE; SECTOR_SIZE]])).unwrap();
    let mut process_image = vec![0x11u8; PAGE_SIZE];
    process_image.extend_from_slice(&[0x22u8; PAGE_SIZE]);
    fs::write(&proc_img, tiny_elf(&[&process_image])).unwrap();

    let report = image::build_image(&out, &boot, &[&kern, &proc_img]).unwrap();
    assert_eq!(report.os_size, 17, "1 kernel sector + 16 image sectors");
    let swap_loc = report.files[2].start_sector as u32;
    assert_eq!(swap_loc, 2);

    // Boot over the image; the filesystem region begins after the kernel.
    let fs_start = 1 + report.os_size as u32;
    let disk = FileDisk::open(&out, 2048).unwrap();
    let config = KernelConfig {
        fs_start,
        ..KernelConfig::default()
    };
    let mut kernel_run = Kernel::boot(Box::new(disk), config).unwrap();

    kernel_run
        .spawn_process(swap_loc, 16, |task| {
            // Demand paging reads the image the host tool laid out.
            assert_eq!(task.mem_read_u32(PROCESS_ENTRY), 0x1111_1111);
            assert_eq!(
                task.mem_read_u32(PROCESS_ENTRY + PAGE_SIZE as u32),
                0x2222_2222
            );

            let fd = task.fs_open("journal", MODE_RDWR | MODE_CREAT).unwrap();
            assert_eq!(task.fs_write(fd, b"written at first boot").unwrap(), 21);
            task.fs_close(fd).unwrap();
        })
        .unwrap();
    kernel_run.run().unwrap();
    drop(kernel_run.shutdown());

    // The bootblock still fronts the image file.
    let raw = fs::read(&out).unwrap();
    assert_eq!(&raw[0..2], &[0, 0]);
    assert_eq!(image::read_os_size(&out).unwrap(), 17);
    assert_eq!(raw[510], 0x55);
    assert_eq!(raw[511], 0xAA);

    // Second boot from the same file finds the journal.
    let disk = FileDisk::open(&out, 2048).unwrap();
    let config = KernelConfig {
        fs_start,
        ..KernelConfig::default()
    };
    let mut kernel_run = Kernel::boot(Box::new(disk), config).unwrap();
    kernel_run
        .spawn_thread(|task| {
            let fd = task.fs_open("journal", MODE_RDONLY).unwrap();
            let mut back = [0u8; 21];
            assert_eq!(task.fs_read(fd, &mut back).unwrap(), 21);
            assert_eq!(&back, b"written at first boot");
            task.fs_lseek(fd, 0, Whence::Set).unwrap();
            task.fs_close(fd).unwrap();
        })
        .unwrap();
    kernel_run.run().unwrap();
    assert_eq!(kernel_run.fs_usage().inodes_used, 2);
}

#[test]
fn createimage_cli_builds_an_image_and_always_exits_zero() {
    let dir = temp_path("cli-dir");
    fs::create_dir_all(&dir).unwrap();
    let boot = dir.join("bootblock");
    let kern = dir.join("kernel");
    fs::write(&boot, bootblock_elf()).unwrap();
    fs::write(&kern, tiny_elf(&[&[0xAB; 700]])).unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_createimage"))
        .current_dir(&dir)
        .args(["--extended", "bootblock", "kernel"])
        .output()
        .unwrap();
    assert!(status.status.success());
    let stdout = String::from_utf8_lossy(&status.stdout);
    assert!(stdout.contains("os_size: 2"), "extended output: {stdout}");
    assert!(stdout.contains("padding os with:"));

    assert_eq!(image::read_os_size(&dir.join("image")).unwrap(), 2);

    // Silent on success without --extended.
    let status = Command::new(env!("CARGO_BIN_EXE_createimage"))
        .current_dir(&dir)
        .args(["bootblock", "kernel"])
        .output()
        .unwrap();
    assert!(status.status.success());
    assert!(status.stdout.is_empty());

    // Failure prints a diagnostic but still exits 0.
    let status = Command::new(env!("CARGO_BIN_EXE_createimage"))
        .current_dir(&dir)
        .args(["missing-bootblock", "kernel"])
        .output()
        .unwrap();
    assert!(status.status.success());
    assert!(String::from_utf8_lossy(&status.stdout).contains("error:"));

    let _ = fs::remove_dir_all(&dir);
}

//! Host-side tooling for the cohort kernel: building bootable disk images
//! out of a bootblock and ELF kernel files.

pub mod image;

use std::path::{Path, PathBuf};

use clap::Parser;

use cohort::image::{self, DEFAULT_OUTPUT};

#[derive(Parser)]
#[command(name = "createimage", about = "Build a bootable disk image from a bootblock and kernel ELF files")]
struct Cli {
    /// Print per-segment debug output.
    #[arg(long)]
    extended: bool,

    /// Bootblock ELF; must unpack to exactly one sector.
    bootblock: PathBuf,

    /// Kernel ELF files, emitted in order behind the bootblock.
    #[arg(required = true)]
    kernels: Vec<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    match image::build_image(Path::new(DEFAULT_OUTPUT), &cli.bootblock, &cli.kernels) {
        Ok(report) => {
            if cli.extended {
                for file in &report.files {
                    println!("{} (sector {})", file.name, file.start_sector);
                    for (i, seg) in file.segments.iter().enumerate() {
                        println!(
                            "  segment {i}: memsz {} filesz {} offset {} vaddr {:#x}",
                            seg.memsz, seg.filesz, seg.offset, seg.vaddr
                        );
                    }
                }
                println!("padding os with: {} bytes", report.padding);
                println!("os_size: {}", report.os_size);
            }
        }
        // Diagnostics only; the tool always exits 0.
        Err(err) => println!("error: {err}"),
    }
}

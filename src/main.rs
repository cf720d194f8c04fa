//! blocklog - manage crash-consistent block volume images.

use anyhow::{Context, Result};
use blocklog::storage::{BlockDevice, FileDevice, Superblock, BLOCK_SIZE};
use blocklog::volume::{Volume, VolumeConfig};
use blocklog::wal::{LogHeader, LOG_CAPACITY};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage blocklog volume images", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a fresh volume image
    Format {
        path: PathBuf,

        /// Total size of the volume in blocks
        #[arg(long, default_value = "1024")]
        blocks: u32,

        /// Size of the log region in blocks, header included
        #[arg(long, default_value = "30")]
        log_blocks: u32,

        /// Overwrite an existing image
        #[arg(long)]
        force: bool,
    },
    /// Print the superblock and the on-disk log header
    Inspect { path: PathBuf },
    /// Mount the volume, replaying any committed transaction in the log
    Recover { path: PathBuf },
}

fn log_capacity(sb: &Superblock) -> usize {
    (sb.log_blocks as usize - 1).min(LOG_CAPACITY)
}

fn read_on_disk_header(device: &FileDevice, sb: &Superblock) -> Result<LogHeader> {
    let mut buf = [0u8; BLOCK_SIZE];
    device.read_block(sb.log_start, &mut buf)?;
    Ok(LogHeader::decode(&buf, log_capacity(sb))?)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match args.command {
        Command::Format {
            path,
            blocks,
            log_blocks,
            force,
        } => {
            if force && path.exists() {
                std::fs::remove_file(&path).context("Failed to remove existing image")?;
            }
            let config = VolumeConfig {
                total_blocks: blocks,
                log_blocks,
                ..Default::default()
            };
            let volume = Volume::create(&path, config)?;
            let sb = volume.superblock();
            println!(
                "Formatted {}: {} blocks, log region {}..{}, {} data blocks",
                path.display(),
                sb.total_blocks,
                sb.log_start,
                sb.data_start,
                sb.data_blocks()
            );
        }

        Command::Inspect { path } => {
            let device = FileDevice::open(&path)?;
            let sb = Superblock::read(&device)?;
            println!("superblock:");
            println!("  magic:        {:#010x}", sb.magic);
            println!("  total blocks: {}", sb.total_blocks);
            println!("  log start:    {}", sb.log_start);
            println!("  log blocks:   {}", sb.log_blocks);
            println!("  data start:   {}", sb.data_start);

            let header = read_on_disk_header(&device, &sb)?;
            if header.is_empty() {
                println!("log header: empty, no committed transaction pending");
            } else {
                println!(
                    "log header: {} blocks awaiting install: {:?}",
                    header.len(),
                    header.blocks()
                );
            }
        }

        Command::Recover { path } => {
            let pending = {
                let device = FileDevice::open(&path)?;
                let sb = Superblock::read(&device)?;
                read_on_disk_header(&device, &sb)?.len()
            };

            // Mounting runs recovery before anything else is admitted.
            let volume = Volume::open(
                &path,
                VolumeConfig {
                    max_op_blocks: 1,
                    ..Default::default()
                },
            )?;
            drop(volume);

            if pending > 0 {
                println!("Replayed {} blocks from the log", pending);
            } else {
                println!("Volume is clean, nothing to replay");
            }
        }
    }

    Ok(())
}

//! vhdiinfo - inspect VHD and VHDX images
//!
//! Prints image metadata, checks file signatures and dumps media ranges of
//! images, following the parent chain of differencing images.

mod dump;
mod resolve;
#[cfg(test)]
mod testimage;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use vhdi_core::format_size;
use vhdi_vaults::{check_file_signature, FormatDetails, Image, ImageMetadata, VaultConfig};

#[derive(Parser)]
#[command(name = "vhdiinfo")]
#[command(about = "Inspect Virtual Hard Disk (VHD and VHDX) images", long_about = None)]
#[command(version = vhdi_vaults::get_version())]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "warn", global = true)]
    log_level: String,

    /// Memory-map images instead of reading through file handles
    #[arg(long, global = true)]
    mmap: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Display image information
    Info {
        image: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check files for a VHD or VHDX signature
    Check {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },

    /// Hexdump a media range, reading through the parent chain
    Dump {
        image: PathBuf,

        /// Media offset to start at
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Number of bytes to dump
        #[arg(long, default_value_t = 512)]
        size: u64,
    },
}

/// Image information as printed by `info`
#[derive(Serialize)]
struct ImageInfo {
    path: PathBuf,
    #[serde(flatten)]
    metadata: ImageMetadata,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = VaultConfig { use_mmap: cli.mmap };
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Command::Info { image, json } => cmd_info(&mut out, &image, json, &config),
        Command::Check { images } => cmd_check(&mut out, &images),
        Command::Dump {
            image,
            offset,
            size,
        } => cmd_dump(&mut out, &image, offset, size, &config),
    }
}

fn cmd_info<W: Write>(out: &mut W, path: &Path, json: bool, config: &VaultConfig) -> Result<()> {
    let mut image = Image::new();
    image
        .open_with_options(path, "r", config)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let info = ImageInfo {
        path: path.to_path_buf(),
        metadata: image.metadata()?.clone(),
    };
    image.close()?;

    if json {
        serde_json::to_writer_pretty(&mut *out, &info)?;
        writeln!(out)?;
    } else {
        print_info(out, &info)?;
    }
    Ok(())
}

fn print_info<W: Write>(out: &mut W, info: &ImageInfo) -> io::Result<()> {
    let metadata = &info.metadata;
    let (major, minor) = metadata.format_version;

    writeln!(out, "=== Image Information ===")?;
    writeln!(out, "Path:             {}", info.path.display())?;
    writeln!(out, "Format:           {} {}.{}", metadata.file_type, major, minor)?;
    writeln!(out, "Disk type:        {}", metadata.disk_type)?;
    writeln!(
        out,
        "Media size:       {} bytes ({})",
        metadata.media_size,
        format_size(metadata.media_size)
    )?;
    writeln!(out, "Bytes per sector: {}", metadata.bytes_per_sector)?;
    if metadata.block_size != 0 {
        writeln!(out, "Block size:       {}", format_size(metadata.block_size as u64))?;
    }
    writeln!(out, "Identifier:       {}", metadata.identifier)?;

    if let Some(parent) = metadata.parent_identifier {
        writeln!(out)?;
        writeln!(out, "=== Parent ===")?;
        writeln!(out, "Identifier:       {}", parent)?;
        writeln!(
            out,
            "Filename:         {}",
            metadata.parent_filename.as_deref().unwrap_or("(none)")
        )?;
    }

    match &metadata.details {
        FormatDetails::Vhd(details) => {
            writeln!(out)?;
            writeln!(out, "=== VHD ===")?;
            writeln!(
                out,
                "Creator:          {} {}.{} ({})",
                details.creator_application.trim_end_matches('\0'),
                details.creator_version >> 16,
                details.creator_version & 0xFFFF,
                details.creator_os.trim_end_matches('\0')
            )?;
            if let Some(time) = details.modification_time {
                writeln!(out, "Modified:         {}", time.to_rfc3339())?;
            }
            writeln!(
                out,
                "Geometry:         {}/{}/{}",
                details.geometry.cylinders, details.geometry.heads, details.geometry.sectors
            )?;
            if details.saved_state {
                writeln!(out, "Saved state:      yes")?;
            }
            for locator in &details.parent_locators {
                writeln!(
                    out,
                    "Parent locator:   {} {}",
                    locator.platform_code,
                    locator.path.as_deref().unwrap_or("(undecoded)")
                )?;
            }
        }
        FormatDetails::Vhdx(details) => {
            writeln!(out)?;
            writeln!(out, "=== VHDX ===")?;
            writeln!(out, "Creator:          {}", details.creator)?;
            writeln!(out, "Sequence number:  {}", details.sequence_number)?;
            writeln!(out, "Virtual disk id:  {}", details.virtual_disk_identifier)?;
            writeln!(out, "Physical sector:  {}", details.physical_sector_size)?;
            for (key, value) in &details.parent_locator {
                writeln!(out, "Parent locator:   {} = {}", key, value)?;
            }
        }
    }
    Ok(())
}

fn cmd_check<W: Write>(out: &mut W, paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        let verdict = if check_file_signature(path) {
            "VHD/VHDX signature found"
        } else {
            "no VHD/VHDX signature"
        };
        writeln!(out, "{}: {}", path.display(), verdict)?;
    }
    Ok(())
}

fn cmd_dump<W: Write>(
    out: &mut W,
    path: &Path,
    offset: u64,
    size: u64,
    config: &VaultConfig,
) -> Result<()> {
    let mut chain = resolve::open_chain(path, config)?;
    for (ancestor, _) in &chain.ancestors {
        tracing::debug!("reading through {}", ancestor.display());
    }

    let offset = i64::try_from(offset).context("offset out of range")?;
    let size = i64::try_from(size).context("size out of range")?;
    let data = chain.image.read_buffer_at_offset(size, offset)?;

    dump::hexdump(out, offset as u64, &data)?;
    Ok(())
}

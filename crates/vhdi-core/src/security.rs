//! Security validation constants and helpers
//!
//! Limits applied while decoding untrusted container metadata so a malformed
//! image cannot exhaust memory or drive arithmetic out of range.

use crate::Error;

/// Maximum size of a single read buffer handed to a caller (256 MiB)
pub const MAX_READ_SIZE: usize = 256 * 1024 * 1024;

/// Maximum size of a block allocation table we will load (256 MiB)
pub const MAX_TABLE_SIZE: usize = 256 * 1024 * 1024;

/// Maximum number of region or metadata table entries (VHDX limit)
pub const MAX_TABLE_ENTRIES: usize = 2047;

/// Maximum depth of a differencing chain followed during one read
pub const MAX_PARENT_CHAIN_DEPTH: usize = 64;

/// Maximum file size for memory mapping (16 GiB)
pub const MAX_MMAP_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Validate that a size decoded from the container is within a limit
///
/// # Security
/// Prevents memory exhaustion from malicious table sizes
pub fn validate_allocation_size(size: u64, limit: usize, context: &str) -> crate::Result<usize> {
    if size > limit as u64 {
        return Err(Error::invalid_format(format!(
            "{} size {} exceeds limit {}",
            context, size, limit
        )));
    }

    size.try_into()
        .map_err(|_| Error::invalid_format(format!("{} size exceeds platform limits", context)))
}

/// Safely multiply two u64 values with overflow checking
pub fn checked_multiply_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| Error::invalid_format(format!("{}: multiplication overflow", context)))
}

/// Safely add two u64 values with overflow checking
pub fn checked_add_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| Error::invalid_format(format!("{}: addition overflow", context)))
}

/// Safely convert u64 to usize with platform checking
///
/// # Security
/// Prevents truncation on 32-bit platforms
pub fn u64_to_usize(value: u64, context: &str) -> crate::Result<usize> {
    value.try_into().map_err(|_| {
        Error::invalid_format(format!(
            "{}: value {} exceeds platform usize limit",
            context, value
        ))
    })
}

/// Validate a sector size is one the formats allow (512 or 4096)
pub fn validate_sector_size(sector_size: u32) -> crate::Result<()> {
    if sector_size != 512 && sector_size != 4096 {
        return Err(Error::invalid_format(format!(
            "Invalid sector size: {} (must be 512 or 4096)",
            sector_size
        )));
    }
    Ok(())
}

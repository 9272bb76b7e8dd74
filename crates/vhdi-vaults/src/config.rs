//! Options for opening an image

/// Configuration for opening an image from a path
#[derive(Debug, Clone, Default)]
pub struct VaultConfig {
    /// Memory-map the container instead of reading through a file handle
    pub use_mmap: bool,
}

impl VaultConfig {
    /// Configuration that memory-maps the container
    pub fn mmap() -> Self {
        Self { use_mmap: true }
    }
}

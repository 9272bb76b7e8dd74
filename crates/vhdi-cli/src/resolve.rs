//! Parent image resolution
//!
//! Differencing images only name their parent. The name is a hint written
//! by the host that created the image, usually a Windows path.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use vhdi_core::{DiskType, MAX_PARENT_CHAIN_DEPTH};
use vhdi_vaults::{Image, SharedImage, VaultConfig};

/// An opened image together with the ancestors it reads through
///
/// Children hold weak links only, so the ancestors live here.
pub struct ImageChain {
    pub image: Image,
    pub ancestors: Vec<(PathBuf, SharedImage)>,
}

/// Candidate locations of the parent named by `hint`
///
/// In order: the hint's file name next to the child, the hint relative to
/// the child's directory, and the hint itself.
pub fn parent_candidates(child: &Path, hint: &str) -> Vec<PathBuf> {
    let normalized = hint.replace('\\', "/");
    let directory = child.parent().unwrap_or_else(|| Path::new(""));

    let mut candidates = Vec::new();
    if let Some(name) = normalized.rsplit('/').next().filter(|name| !name.is_empty()) {
        candidates.push(directory.join(name));
    }
    for candidate in [directory.join(&normalized), PathBuf::from(&normalized)] {
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

/// Open `path` and every ancestor it names
pub fn open_chain(path: &Path, config: &VaultConfig) -> Result<ImageChain> {
    let mut ancestors = Vec::new();
    let image = open_linked(path, config, &mut Vec::new(), &mut ancestors)?;
    Ok(ImageChain { image, ancestors })
}

/// Open `path` and link its ancestors
///
/// `descendants` holds the canonical paths of the images already being
/// opened below this one, leaf first.
fn open_linked(
    path: &Path,
    config: &VaultConfig,
    descendants: &mut Vec<PathBuf>,
    ancestors: &mut Vec<(PathBuf, SharedImage)>,
) -> Result<Image> {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if descendants.contains(&canonical) {
        bail!("parent chain of {} loops back to itself", path.display());
    }

    let mut image = Image::new();
    image
        .open_with_options(path, "r", config)
        .with_context(|| format!("failed to open {}", path.display()))?;

    if image.disk_type()? != DiskType::Differencing {
        return Ok(image);
    }
    if descendants.len() + 1 >= MAX_PARENT_CHAIN_DEPTH {
        bail!("parent chain of {} is too deep", path.display());
    }

    let hint = image
        .parent_filename()?
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} is a differencing image without a parent name", path.display()))?;
    let parent_path = parent_candidates(path, &hint)
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| anyhow!("parent {} of {} not found", hint, path.display()))?;

    tracing::info!("resolved parent {} as {}", hint, parent_path.display());

    descendants.push(canonical);
    let parent = open_linked(&parent_path, config, descendants, ancestors)?.into_shared();
    descendants.pop();
    image
        .set_parent(&parent)
        .with_context(|| format!("{} is not the parent of {}", parent_path.display(), path.display()))?;
    ancestors.push((parent_path, parent));

    Ok(image)
}

//! Parent links between differencing images
//!
//! A child never owns its parent. The caller keeps every ancestor alive as a
//! [`SharedImage`]; the child holds a weak link and locks the parent only for
//! the duration of a sub-read.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use vhdi_core::{Error, Result, MAX_PARENT_CHAIN_DEPTH};

use crate::image::Image;

/// An image that can serve as the parent of differencing images
pub type SharedImage = Arc<Mutex<Image>>;

/// Non-owning link from a differencing image to its parent
#[derive(Debug, Clone)]
pub(crate) struct ParentLink(Weak<Mutex<Image>>);

impl ParentLink {
    pub(crate) fn new(parent: &SharedImage) -> Self {
        Self(Arc::downgrade(parent))
    }

    /// Run `f` with the parent locked
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Image) -> Result<R>) -> Result<R> {
        let parent = self
            .0
            .upgrade()
            .ok_or_else(|| Error::invalid_operation("parent image has been dropped"))?;
        let mut guard = parent
            .lock()
            .map_err(|_| Error::invalid_operation("parent image lock poisoned"))?;
        f(&mut guard)
    }
}

/// Lock a candidate parent without blocking
///
/// A candidate that is already locked is either the image being linked or is
/// in use elsewhere; both are refused.
pub(crate) fn try_lock_candidate(candidate: &SharedImage) -> Result<MutexGuard<'_, Image>> {
    match candidate.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::WouldBlock) => Err(Error::invalid_argument(
            "parent image is locked: it is this image or is in use",
        )),
        Err(TryLockError::Poisoned(_)) => Err(Error::invalid_operation("parent image lock poisoned")),
    }
}

/// Walk the ancestors of `candidate` before it is linked as a parent
///
/// Fails if an ancestor cannot be locked without blocking, which is how a
/// chain leading back to the locked child shows up, or if the resulting
/// chain would be deeper than [`MAX_PARENT_CHAIN_DEPTH`].
pub(crate) fn check_candidate_chain(candidate: &Image) -> Result<()> {
    let mut next = candidate.parent_link();
    // The child and the candidate
    let mut depth = 2;

    while let Some(link) = next {
        depth += 1;
        if depth > MAX_PARENT_CHAIN_DEPTH {
            return Err(Error::invalid_format(format!(
                "parent chain deeper than {} images",
                MAX_PARENT_CHAIN_DEPTH
            )));
        }

        let ancestor = match link.0.upgrade() {
            Some(ancestor) => ancestor,
            None => break,
        };
        let guard = match ancestor.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                return Err(Error::invalid_argument(
                    "parent chain contains a locked image; refusing a possible cycle",
                ));
            }
            Err(TryLockError::Poisoned(_)) => {
                return Err(Error::invalid_operation("ancestor image lock poisoned"));
            }
        };
        next = guard.parent_link();
    }

    tracing::debug!("parent chain of candidate checked at depth {}", depth);
    Ok(())
}

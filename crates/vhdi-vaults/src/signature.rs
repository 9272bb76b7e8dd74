//! File signature detection
//!
//! A VHDX starts with `vhdxfile`; a VHD ends with a footer whose cookie is
//! `conectix`. Detection only looks at these magic bytes.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use vhdi_core::{ByteSource, FileType, Result};
use vhdi_pipeline::{FileSource, StreamSource};

use crate::vhd::types::VhdFooter;
use crate::vhdx::types::FileIdentifier;

/// Detect the container type from its magic bytes
///
/// Returns `Ok(None)` when neither signature is present.
pub fn detect_file_type(source: &mut dyn ByteSource) -> Result<Option<FileType>> {
    let size = source.size()?;

    if size >= FileIdentifier::SIGNATURE.len() as u64 {
        let mut magic = [0u8; 8];
        source.read_exact_at(0, &mut magic)?;
        if &magic == FileIdentifier::SIGNATURE {
            return Ok(Some(FileType::Vhdx));
        }
    }

    if size >= VhdFooter::SIZE as u64 {
        let mut cookie = [0u8; 8];
        source.read_exact_at(size - VhdFooter::SIZE as u64, &mut cookie)?;
        if &cookie == VhdFooter::COOKIE {
            return Ok(Some(FileType::Vhd));
        }
    }

    Ok(None)
}

/// Check whether the file at `path` carries a VHD or VHDX signature
///
/// Unreadable files yield `false`.
pub fn check_file_signature(path: &Path) -> bool {
    match FileSource::open(path) {
        Ok(mut source) => matches!(detect_file_type(&mut source), Ok(Some(_))),
        Err(e) => {
            tracing::debug!("signature check of {} failed: {}", path.display(), e);
            false
        }
    }
}

/// Check whether `stream` carries a VHD or VHDX signature
///
/// The stream position is restored afterwards when possible.
pub fn check_file_signature_stream<S: Read + Seek + Send + ?Sized>(stream: &mut S) -> bool {
    let position = match stream.stream_position() {
        Ok(position) => position,
        Err(_) => return false,
    };

    let detected = match StreamSource::new(&mut *stream) {
        Ok(mut source) => matches!(detect_file_type(&mut source), Ok(Some(_))),
        Err(_) => false,
    };

    if let Err(e) = stream.seek(SeekFrom::Start(position)) {
        tracing::debug!("could not restore stream position {}: {}", position, e);
    }
    detected
}

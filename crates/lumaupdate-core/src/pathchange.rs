//! Payload install-path patching
//!
//! Payloads carry the path they chainload from as a UTF-16 string,
//! `sdmc:/arm9loaderhax.bin`. Installing under another name means rewriting
//! the part after `sdmc:/` in place without changing the buffer size.

use thiserror::Error;

use crate::scan::{self, Encoding};

/// Path embedded in stock payloads, including its terminator
const ORIGINAL_PATH: &[u8] = b"sdmc:/arm9loaderhax.bin\0";

/// UTF-16 byte length of the `sdmc:/` prefix
const PREFIX_BYTES: usize = 12;

/// Longest replacement path the payload accepts
pub const MAX_PATH_LEN: usize = 37;

/// Install path (relative to the SD root) that needs no patching
pub const DEFAULT_INSTALL_PATH: &str = "arm9loaderhax.bin";

/// Errors that can occur while patching a payload
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PathChangeError {
    #[error("Payload path is too long ({len} chars, max {max})")]
    PathTooLong { len: usize, max: usize },

    #[error("Payload path must be plain ASCII")]
    NonAsciiPath,

    #[error("Could not find payload path, is this even a valid payload?")]
    PatternNotFound,

    #[error("Payload path field at offset {offset} runs past the end of the payload")]
    FieldOutOfBounds { offset: usize },
}

/// Replace the path after `sdmc:/` in `payload` with `path`.
///
/// `path` is relative to the SD root (no leading slash). [`MAX_PATH_LEN`]
/// applies to this stripped form, so callers holding `/luma/boot.bin` style
/// paths must strip the slash first and get one extra character. Shorter paths
/// are zero-padded over the old name. Returns the offset where the embedded
/// path string starts.
pub fn patch_payload_path(payload: &mut [u8], path: &str) -> Result<usize, PathChangeError> {
    if path.len() > MAX_PATH_LEN {
        return Err(PathChangeError::PathTooLong {
            len: path.len(),
            max: MAX_PATH_LEN,
        });
    }
    if !path.is_ascii() {
        return Err(PathChangeError::NonAsciiPath);
    }

    log::info!("Searching for \"sdmc:/{}\" in payload", DEFAULT_INSTALL_PATH);
    let found = scan::find(payload, ORIGINAL_PATH, Encoding::Utf16Ascii)
        .ok_or(PathChangeError::PatternNotFound)?;

    let offset = found + PREFIX_BYTES;
    let units = path.len().max(ORIGINAL_PATH.len());
    if offset + units * 2 > payload.len() {
        return Err(PathChangeError::FieldOutOfBounds { offset: found });
    }

    let replacement = path.bytes().chain(std::iter::repeat(0));
    for (i, byte) in replacement.take(units).enumerate() {
        payload[offset + i * 2] = byte;
    }

    log::info!("Payload path at offset {:#x} set to sdmc:/{}", found, path);
    Ok(found)
}

//! In-memory archive readers
//!
//! Release archives are downloaded into memory and a single well-known member
//! is pulled out of them. Stable releases ship as solid 7z archives, hourly
//! builds as zip files. Both readers implement [`ArchiveReader`].

mod sevenzip;
mod zipfile;

use thiserror::Error;

pub use self::sevenzip::{SevenZipArchive, MAX_ENTRY_NAME_UNITS};
pub use self::zipfile::ZipArchive;

/// Largest payload that fits the device's boot slot (128 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 0x20000;

/// Errors that can occur while reading an archive
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Could not open archive: {0}")]
    Open(String),

    #[error("Could not find {0} in archive")]
    FileNotFound(String),

    #[error("Could not extract {name}: {reason}")]
    Extraction { name: String, reason: String },
}

/// Container format of a release archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Solid LZMA 7z archive (stable releases)
    SevenZip,
    /// Deflate zip archive (hourly builds)
    Zip,
}

/// A member extracted from an archive.
///
/// `block` owns the whole decoded buffer; the member's bytes start at
/// `offset` and span `size` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    block: Vec<u8>,
    offset: usize,
    size: usize,
}

impl ExtractedFile {
    /// Wrap a decoded block. Returns `None` if the member range does not fit.
    pub fn new(block: Vec<u8>, offset: usize, size: usize) -> Option<Self> {
        let end = offset.checked_add(size)?;
        if end > block.len() {
            return None;
        }
        Some(Self {
            block,
            offset,
            size,
        })
    }

    /// Offset of the member within the decoded block
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the member in bytes
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The member's bytes
    pub fn bytes(&self) -> &[u8] {
        &self.block[self.offset..self.offset + self.size]
    }

    /// The member's bytes, mutable for in-place patching
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.block[self.offset..self.offset + self.size]
    }

    /// Whole decoded block backing this member
    pub fn block(&self) -> &[u8] {
        &self.block
    }
}

/// Capability shared by both archive formats: extract one named member.
pub trait ArchiveReader {
    /// Whether a member with this logical path is extractable
    fn contains(&self, name: &str) -> bool;

    /// Extract the member at `name` into a freshly allocated buffer
    fn extract_file(&mut self, name: &str) -> Result<ExtractedFile, ArchiveError>;
}

/// Open `data` with the reader matching `format`.
pub fn open_archive<'a>(
    format: ArchiveFormat,
    data: &'a [u8],
) -> Result<Box<dyn ArchiveReader + 'a>, ArchiveError> {
    match format {
        ArchiveFormat::SevenZip => Ok(Box::new(SevenZipArchive::new(data)?)),
        ArchiveFormat::Zip => Ok(Box::new(ZipArchive::new(data)?)),
    }
}

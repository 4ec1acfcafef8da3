//! 7z archive reader (stable releases)
//!
//! Stable releases are solid archives: several members can share one LZMA
//! block, so reaching a member means decoding the block up to it.

use std::collections::HashMap;
use std::io::Cursor;

use sevenz_rust::{Password, SevenZReader};

use super::{ArchiveError, ArchiveReader, ExtractedFile};

/// Entries with longer names are left out of the index.
pub const MAX_ENTRY_NAME_UNITS: usize = 255;

/// Fold a member name to the index key: every UTF-16 unit is cut down to its
/// low byte. Non-ASCII names lose information and may collide.
///
/// Returns `None` for names longer than [`MAX_ENTRY_NAME_UNITS`].
fn fold_name(name: &str) -> Option<String> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > MAX_ENTRY_NAME_UNITS {
        return None;
    }
    Some(units.iter().map(|u| char::from((u & 0xff) as u8)).collect())
}

/// A 7z archive viewed in place over the downloaded bytes
pub struct SevenZipArchive<'a> {
    data: &'a [u8],
    /// Folded name -> name as stored in the archive
    index: HashMap<String, String>,
}

impl<'a> SevenZipArchive<'a> {
    /// Parse the archive header and index every regular file.
    pub fn new(data: &'a [u8]) -> Result<Self, ArchiveError> {
        let reader = Self::open_reader(data)?;

        let mut index = HashMap::new();
        for entry in &reader.archive().files {
            if entry.is_directory() {
                continue;
            }
            match fold_name(entry.name()) {
                Some(key) => {
                    index.insert(key, entry.name().to_string());
                }
                None => {
                    log::debug!("Skipping 7z entry with overlong name ({} bytes)", entry.name().len());
                }
            }
        }

        log::debug!("Opened 7z archive, {} extractable entries", index.len());
        Ok(Self { data, index })
    }

    fn open_reader(data: &'a [u8]) -> Result<SevenZReader<Cursor<&'a [u8]>>, ArchiveError> {
        SevenZReader::new(Cursor::new(data), data.len() as u64, Password::empty())
            .map_err(|e| ArchiveError::Open(e.to_string()))
    }
}

impl ArchiveReader for SevenZipArchive<'_> {
    fn contains(&self, name: &str) -> bool {
        fold_name(name).is_some_and(|key| self.index.contains_key(&key))
    }

    fn extract_file(&mut self, name: &str) -> Result<ExtractedFile, ArchiveError> {
        let stored = fold_name(name)
            .and_then(|key| self.index.get(&key))
            .ok_or_else(|| ArchiveError::FileNotFound(name.to_string()))?
            .clone();

        let extraction = |reason: String| ArchiveError::Extraction {
            name: name.to_string(),
            reason,
        };

        let mut reader = Self::open_reader(self.data)?;

        // Members are decoded in stream order into one buffer; decoding stops
        // right after the wanted member.
        let mut block = Vec::new();
        let mut member: Option<(usize, usize)> = None;
        let mut failure: Option<String> = None;

        reader
            .for_each_entries(|entry, entry_reader| {
                if entry.is_directory() {
                    return Ok(true);
                }

                let start = block.len();
                if let Err(e) = entry_reader.read_to_end(&mut block) {
                    failure = Some(e.to_string());
                    return Ok(false);
                }
                let size = block.len() - start;

                if entry.name() != stored {
                    return Ok(true);
                }

                if size as u64 != entry.size() {
                    failure = Some(format!(
                        "extracted size does not match expected (got {} expected {})",
                        size,
                        entry.size()
                    ));
                } else {
                    member = Some((start, size));
                }
                Ok(false)
            })
            .map_err(|e| extraction(e.to_string()))?;

        if let Some(reason) = failure {
            return Err(extraction(reason));
        }

        let (offset, size) = member.ok_or_else(|| ArchiveError::FileNotFound(name.to_string()))?;
        log::debug!(
            "Extracted {} ({} bytes at offset {} of a {} byte block)",
            name,
            size,
            offset,
            block.len()
        );

        ExtractedFile::new(block, offset, size)
            .ok_or_else(|| extraction("invalid member range".into()))
    }
}

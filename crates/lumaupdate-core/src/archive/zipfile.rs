//! Zip archive reader (hourly builds)

use std::io::{Cursor, Read};

use zip::result::ZipError;

use super::{ArchiveError, ArchiveReader, ExtractedFile};

/// A zip container opened over an owned copy of the downloaded bytes
pub struct ZipArchive {
    inner: zip::ZipArchive<Cursor<Vec<u8>>>,
}

impl ZipArchive {
    /// Copy `data` and open it as a zip container.
    pub fn new(data: &[u8]) -> Result<Self, ArchiveError> {
        let inner = zip::ZipArchive::new(Cursor::new(data.to_vec()))
            .map_err(|e| ArchiveError::Open(e.to_string()))?;
        log::debug!("Opened zip archive with {} entries", inner.len());
        Ok(Self { inner })
    }
}

impl ArchiveReader for ZipArchive {
    fn contains(&self, name: &str) -> bool {
        self.inner.file_names().any(|n| n == name)
    }

    fn extract_file(&mut self, name: &str) -> Result<ExtractedFile, ArchiveError> {
        let extraction = |reason: String| ArchiveError::Extraction {
            name: name.to_string(),
            reason,
        };

        let file = match self.inner.by_name(name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Err(ArchiveError::FileNotFound(name.into())),
            Err(e) => return Err(extraction(e.to_string())),
        };

        let expected = file.size();
        let capacity = usize::try_from(expected)
            .map_err(|_| extraction(format!("declared size {} is too large", expected)))?;

        // Read one byte past the declared size so oversized streams are caught
        let mut data = Vec::with_capacity(capacity);
        file.take(expected + 1)
            .read_to_end(&mut data)
            .map_err(|e| extraction(e.to_string()))?;

        if data.len() != capacity {
            return Err(extraction(format!(
                "extracted size does not match expected (got {} expected {})",
                data.len(),
                expected
            )));
        }

        let size = data.len();
        ExtractedFile::new(data, 0, size).ok_or_else(|| extraction("invalid member range".into()))
    }
}

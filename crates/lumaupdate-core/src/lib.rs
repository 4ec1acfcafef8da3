//! lumaupdate-core: Payload handling library for lumaupdate
//!
//! This crate provides the pieces of the update pipeline that operate purely
//! on bytes:
//! - In-memory extraction of a single member from 7z and zip archives
//! - Detection of the Luma3DS version embedded in a payload
//! - Rewriting of the install path embedded in a payload

pub mod archive;
pub mod pathchange;
pub mod scan;
pub mod version;

pub use archive::{
    open_archive, ArchiveError, ArchiveFormat, ArchiveReader, ExtractedFile, SevenZipArchive,
    ZipArchive, MAX_PAYLOAD_SIZE,
};
pub use pathchange::{patch_payload_path, PathChangeError, DEFAULT_INSTALL_PATH, MAX_PATH_LEN};
pub use version::{
    compare_releases, FirmwareQuery, SvcVersionInfo, SystemFirmware, Version, VersionDetector,
};

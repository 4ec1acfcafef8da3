//! SD card layout migrations
//!
//! Old Luma3DS releases (called AuReiNand before 5.2) kept their files under
//! `/aurei` and used different names for chainloaded payloads. Updating such an
//! install requires moving things to the current layout first.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lumaupdate_core::Version;
use thiserror::Error;

/// Legacy install directory
pub const LEGACY_DIR: &str = "aurei";

/// Current install directory
pub const LUMA_DIR: &str = "luma";

/// Errors that can occur while migrating an install
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Could not open {path}: {source}")]
    OpenDir { path: PathBuf, source: io::Error },

    #[error("Could not create {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Could not rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Collaborator that brings an old install up to the current layout
pub trait InstallMigrator {
    /// Move a legacy `/aurei` install to `/luma`
    fn migrate_legacy_install(&self) -> Result<(), MigrationError>;

    /// Rename chainloader payloads from older naming conventions
    fn migrate_payload_names(&self) -> Result<(), MigrationError>;
}

/// Whether the installed version predates the `/luma` layout.
///
/// 5.x releases switched with 5.2, anything else is decided on the major
/// release alone. An undetectable version needs no migration.
pub fn needs_legacy_migration(version: &Version) -> bool {
    if version.release.is_empty() {
        log::info!("Installed version is unknown, skipping legacy check");
        return false;
    }

    let (major_str, minor_str) = match version.release.split_once('.') {
        Some((major, rest)) => (major, Some(rest.split('.').next().unwrap_or(""))),
        None => (version.release.as_str(), None),
    };

    let Some(major) = leading_number(major_str) else {
        log::info!("Weird version string {:?}, skipping legacy check", version.release);
        return false;
    };

    match minor_str {
        Some(minor) if major == 5 => leading_number(minor).unwrap_or(0) < 2,
        _ => major <= 5,
    }
}

/// Leading decimal digits of `s`, if any
fn leading_number(s: &str) -> Option<u64> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    // Saturate on absurdly long numbers
    Some(digits.parse().unwrap_or(u64::MAX))
}

/// [`InstallMigrator`] working on a mounted SD card
pub struct SdMigrator {
    sd_root: PathBuf,
}

impl SdMigrator {
    pub fn new(sd_root: impl Into<PathBuf>) -> Self {
        Self {
            sd_root: sd_root.into(),
        }
    }

    fn payloads_dir(&self) -> PathBuf {
        self.sd_root.join(LUMA_DIR).join("payloads")
    }

    /// Rename `old` to `new` inside the payloads directory if it exists
    fn rename_if_exists(&self, old: &str, new: &str) -> Result<(), MigrationError> {
        let dir = self.payloads_dir();
        let from = dir.join(old);
        if !from.is_file() {
            return Ok(());
        }

        let to = dir.join(new);
        log::info!("  {} -> {}", from.display(), to.display());
        fs::rename(&from, &to).map_err(|source| MigrationError::Rename { from, to, source })
    }

    /// Rename every listed file starting with `old_prefix`; failures are warnings
    fn rename_prefixed(&self, files: &[String], old_prefix: &str, new_prefix: &str) {
        let dir = self.payloads_dir();
        for file in files {
            let Some(rest) = file.strip_prefix(old_prefix) else {
                continue;
            };

            let from = dir.join(file);
            let to = dir.join(format!("{}{}", new_prefix, rest));
            log::info!("  {} -> {}", from.display(), to.display());
            if let Err(e) = fs::rename(&from, &to) {
                log::warn!("Could not rename {}: {}", from.display(), e);
            }
        }
    }

    fn list_payloads(&self) -> Vec<String> {
        let dir = self.payloads_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::info!("Could not open {}: {}", dir.display(), e);
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect()
    }
}

impl InstallMigrator for SdMigrator {
    fn migrate_legacy_install(&self) -> Result<(), MigrationError> {
        let legacy = self.sd_root.join(LEGACY_DIR);
        let luma = self.sd_root.join(LUMA_DIR);

        if luma.is_dir() {
            log::info!("Luma directory already exists, skipping migration");
            return Ok(());
        }

        log::info!("Migrating {} to {}", legacy.display(), luma.display());
        rename_recursive(&legacy, &luma)?;

        if let Err(e) = fs::remove_dir_all(&legacy) {
            log::warn!("Could not delete original {}: {}", legacy.display(), e);
        }
        Ok(())
    }

    fn migrate_payload_names(&self) -> Result<(), MigrationError> {
        // default.bin became def.bin in 5.1
        self.rename_if_exists("default.bin", "def.bin")?;

        let files = self.list_payloads();

        // def became start in 5.4
        self.rename_prefixed(&files, "def", "start");

        // sel became select in 5.4; "sel_" so "select_" is left alone
        self.rename_if_exists("sel.bin", "select.bin")?;
        self.rename_prefixed(&files, "sel_", "select_");

        Ok(())
    }
}

/// Recreate the tree under `source` at `target`, moving files over
fn rename_recursive(source: &Path, target: &Path) -> Result<(), MigrationError> {
    let entries = fs::read_dir(source).map_err(|e| MigrationError::OpenDir {
        path: source.to_path_buf(),
        source: e,
    })?;

    fs::create_dir(target).map_err(|e| MigrationError::CreateDir {
        path: target.to_path_buf(),
        source: e,
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| MigrationError::OpenDir {
            path: source.to_path_buf(),
            source: e,
        })?;
        let from = entry.path();
        let to = target.join(entry.file_name());

        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            log::info!("  {} -> {} (DIR)", from.display(), to.display());
            rename_recursive(&from, &to)?;
        } else {
            fs::rename(&from, &to).map_err(|source| MigrationError::Rename {
                from: from.clone(),
                to: to.clone(),
                source,
            })?;
            log::info!("  {} -> {}", from.display(), to.display());
        }
    }

    Ok(())
}

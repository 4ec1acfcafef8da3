//! Install transactions
//!
//! `update` replaces the installed payload with a downloaded release,
//! `restore` swaps the `.bak` copy back in. Both stop at the first failure
//! and leave whatever is on the SD card for manual recovery.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lumaupdate_core::{patch_payload_path, PathChangeError, DEFAULT_INSTALL_PATH};
use thiserror::Error;

use crate::http::HttpClient;
use crate::migrate::{InstallMigrator, MigrationError, SdMigrator};
use crate::orchestrator::Phase;
use crate::release::{Channel, ReleaseClient, ReleaseError, ReleaseVersion};

/// Error code reported on success
pub const NO_ERROR: &str = "NO ERROR";

/// Suffix of the backup copy
pub const BACKUP_SUFFIX: &str = ".bak";

/// Suffix the current payload is moved to while restoring
pub const BROKEN_SUFFIX: &str = ".broken";

/// Errors that abort an install transaction
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Could not back up {}: {source}", path.display())]
    BackupFailed { path: PathBuf, source: io::Error },

    #[error("Could not get payload: {0}")]
    DownloadFailed(#[from] ReleaseError),

    #[error("Could not change payload path: {0}")]
    PathChangeFailed(#[from] PathChangeError),

    #[error("Could not migrate AuReiNand install: {0}")]
    MigrationFailed(#[from] MigrationError),

    #[error("Could not save payload to {}: {source}", path.display())]
    WriteFailed { path: PathBuf, source: io::Error },

    #[error("Can't rename current version ({}): {source}", path.display())]
    Rename1Failed { path: PathBuf, source: io::Error },

    #[error("Can't rename backup to current payload name ({}): {source}", path.display())]
    Rename2Failed { path: PathBuf, source: io::Error },
}

impl UpdateError {
    /// Short code shown to the user
    pub fn code(&self) -> &'static str {
        match self {
            UpdateError::BackupFailed { .. } => "BACKUP FAILED",
            UpdateError::DownloadFailed(_) => "DOWNLOAD FAILED",
            UpdateError::PathChangeFailed(_) => "PATHCHANGE FAILED",
            UpdateError::MigrationFailed(_) => "MIGRATION FAILED",
            UpdateError::WriteFailed { .. } => "WRITE FAILED",
            UpdateError::Rename1Failed { .. } => "RENAME1 FAILED",
            UpdateError::Rename2Failed { .. } => "RENAME2 FAILED",
        }
    }

    /// The payload slot may be empty after this failure
    pub fn leaves_broken_install(&self) -> bool {
        matches!(self, UpdateError::Rename2Failed { .. })
    }
}

/// Outcome of a transaction as presented to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub success: bool,
    pub errcode: String,
}

impl UpdateResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            errcode: NO_ERROR.to_string(),
        }
    }

    pub fn failed(errcode: impl Into<String>) -> Self {
        Self {
            success: false,
            errcode: errcode.into(),
        }
    }
}

impl From<Result<(), UpdateError>> for UpdateResult {
    fn from(result: Result<(), UpdateError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => {
                log::error!("{}", e);
                if e.leaves_broken_install() {
                    log::error!("No payload is installed at the moment, recover it manually");
                }
                Self::failed(e.code())
            }
        }
    }
}

/// Steps of the update transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    Backup,
    Download,
    PathChange,
    Migration,
    Save,
}

impl UpdateStep {
    pub fn label(self) -> &'static str {
        match self {
            UpdateStep::Backup => "Backing up old payload",
            UpdateStep::Download => "Downloading payload",
            UpdateStep::PathChange => "Applying path changing",
            UpdateStep::Migration => "Migrating AuReiNand -> Luma3DS",
            UpdateStep::Save => "Saving payload to SD",
        }
    }

    /// Overall progress when the step starts
    pub fn fraction(self) -> f32 {
        match self {
            UpdateStep::Backup => 0.1,
            UpdateStep::Download => 0.3,
            UpdateStep::PathChange => 0.6,
            UpdateStep::Migration => 0.8,
            UpdateStep::Save => 0.9,
        }
    }
}

/// Receives progress of a running transaction
pub trait ProgressSink {
    /// A new step started
    fn on_progress(&mut self, step: UpdateStep, fraction: f32);

    /// Download progress within [`UpdateStep::Download`]
    fn on_download(&mut self, _received: u64, _total: Option<u64>) {}

    /// The session moved to another phase
    fn on_phase(&mut self, _phase: Phase) {}
}

/// Sink that drops all progress
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&mut self, _step: UpdateStep, _fraction: f32) {}
}

/// Parameters of an update
#[derive(Debug, Clone)]
pub struct UpdateArgs<'a> {
    /// Version to install
    pub release: &'a ReleaseVersion,
    /// Channel the version comes from
    pub channel: Channel,
    /// Payload location relative to the SD root (leading slash optional)
    pub payload_path: &'a str,
    /// Copy the current payload to `.bak` first
    pub backup_existing: bool,
    /// Move a legacy `/aurei` install before writing
    pub migrate_legacy: bool,
}

/// `path` with `suffix` appended to its file name
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Runs install transactions against an SD card
pub struct PayloadUpdater<M: InstallMigrator = SdMigrator> {
    sd_root: PathBuf,
    migrator: M,
}

impl PayloadUpdater<SdMigrator> {
    pub fn new(sd_root: impl Into<PathBuf>) -> Self {
        let sd_root = sd_root.into();
        let migrator = SdMigrator::new(sd_root.clone());
        Self { sd_root, migrator }
    }
}

impl<M: InstallMigrator> PayloadUpdater<M> {
    pub fn with_migrator(sd_root: impl Into<PathBuf>, migrator: M) -> Self {
        Self {
            sd_root: sd_root.into(),
            migrator,
        }
    }

    /// Location of `payload_path` on the SD card
    pub fn target_path(&self, payload_path: &str) -> PathBuf {
        self.sd_root.join(payload_path.trim_start_matches('/'))
    }

    /// Install `args.release`, reporting the outcome as an [`UpdateResult`]
    pub fn update<H: HttpClient>(
        &self,
        client: &ReleaseClient<H>,
        args: &UpdateArgs<'_>,
        progress: &mut dyn ProgressSink,
    ) -> UpdateResult {
        self.try_update(client, args, progress).into()
    }

    pub fn try_update<H: HttpClient>(
        &self,
        client: &ReleaseClient<H>,
        args: &UpdateArgs<'_>,
        progress: &mut dyn ProgressSink,
    ) -> Result<(), UpdateError> {
        let target = self.target_path(args.payload_path);

        if !args.backup_existing {
            log::info!("Payload backup is disabled in config, skipping");
        } else if !target.is_file() {
            log::info!("Original payload not found, skipping backup");
        } else {
            progress.on_progress(UpdateStep::Backup, UpdateStep::Backup.fraction());
            let backup = sibling_path(&target, BACKUP_SUFFIX);
            log::info!("Copying {} to {}", target.display(), backup.display());
            fs::copy(&target, &backup).map_err(|source| UpdateError::BackupFailed {
                path: target.clone(),
                source,
            })?;
        }

        progress.on_progress(UpdateStep::Download, UpdateStep::Download.fraction());
        let mut payload = client.get_payload(args.release, args.channel, &mut |received, total| {
            progress.on_download(received, total)
        })?;

        let install_path = args.payload_path.trim_start_matches('/');
        if install_path != DEFAULT_INSTALL_PATH {
            progress.on_progress(UpdateStep::PathChange, UpdateStep::PathChange.fraction());
            log::info!(
                "Requested payload path is not {}, applying path patch",
                DEFAULT_INSTALL_PATH
            );
            patch_payload_path(payload.bytes_mut(), install_path)?;
        }

        if args.migrate_legacy {
            progress.on_progress(UpdateStep::Migration, UpdateStep::Migration.fraction());
            log::info!("Migrating AuReiNand install to Luma3DS");
            self.migrator.migrate_legacy_install()?;
        }

        if let Err(e) = self.migrator.migrate_payload_names() {
            log::warn!("Could not migrate payloads: {}", e);
        }

        progress.on_progress(UpdateStep::Save, UpdateStep::Save.fraction());
        log::info!("Saving payload to SD (as {})", target.display());
        fs::write(&target, payload.bytes()).map_err(|source| UpdateError::WriteFailed {
            path: target.clone(),
            source,
        })?;

        log::info!("All done, freeing resources");
        Ok(())
    }

    /// Put the `.bak` payload back in place
    pub fn restore(&self, payload_path: &str) -> UpdateResult {
        self.try_restore(payload_path).into()
    }

    pub fn try_restore(&self, payload_path: &str) -> Result<(), UpdateError> {
        let target = self.target_path(payload_path);
        let broken = sibling_path(&target, BROKEN_SUFFIX);
        let backup = sibling_path(&target, BACKUP_SUFFIX);

        fs::rename(&target, &broken).map_err(|source| UpdateError::Rename1Failed {
            path: target.clone(),
            source,
        })?;

        fs::rename(&backup, &target).map_err(|source| UpdateError::Rename2Failed {
            path: backup.clone(),
            source,
        })?;

        if let Err(e) = fs::remove_file(&broken) {
            log::warn!(
                "Could not remove {}, please remove it manually: {}",
                broken.display(),
                e
            );
        }

        log::info!("Restored {} from backup", target.display());
        Ok(())
    }
}

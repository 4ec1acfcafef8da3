//! Updating the updater itself
//!
//! The updater is distributed as a zip holding both a `.3dsx` homebrew build
//! and an installable `.cia` title. Which one gets replaced depends on how the
//! running copy was launched.

use std::fs;
use std::path::PathBuf;

use lumaupdate_core::archive::{open_archive, ArchiveError, ArchiveFormat, ArchiveReader};
use semver::Version;
use thiserror::Error;

use crate::http::HttpClient;
use crate::release::{parse_manifest, release_tag, verify_download, ReleaseError, ReleaseVersion};
use crate::update::UpdateResult;

/// CIA member of the updater archive
pub const CIA_MEMBER: &str = "lumaupdater.cia";

/// Homebrew executable member of the updater archive
pub const HOMEBREW_MEMBER: &str = "3DS/lumaupdater/lumaupdater.3dsx";

/// Homebrew metadata member of the updater archive
pub const SMDH_MEMBER: &str = "3DS/lumaupdater/lumaupdater.smdh";

/// Errors that can occur while updating the updater
#[derive(Error, Debug)]
pub enum SelfUpdateError {
    #[error("Could not fetch updater release: {0}")]
    Release(#[from] ReleaseError),

    #[error("Failed to parse version: {0}")]
    Version(String),

    #[error("Download failed: {0}")]
    Download(ReleaseError),

    #[error("Could not extract {name}: {reason}")]
    Extract { name: String, reason: String },

    #[error("CIA install failed: {0}")]
    Install(String),

    #[error("Unknown install type, cannot update")]
    UnknownInstall,
}

impl SelfUpdateError {
    /// Short code shown to the user
    pub fn code(&self) -> &'static str {
        match self {
            SelfUpdateError::Release(_)
            | SelfUpdateError::Version(_)
            | SelfUpdateError::Download(_) => "DOWNLOAD FAILED",
            SelfUpdateError::Extract { .. } => "EXTRACT FAILED",
            SelfUpdateError::Install(_) => "CIA INSTALL FAILED",
            SelfUpdateError::UnknownInstall => "UNKNOWN INSTALL",
        }
    }
}

impl From<Result<(), SelfUpdateError>> for UpdateResult {
    fn from(result: Result<(), SelfUpdateError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => {
                log::error!("{}", e);
                Self::failed(e.code())
            }
        }
    }
}

/// How the running updater was packaged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HomebrewType {
    #[default]
    Unknown,
    /// `.3dsx` started from a homebrew launcher
    Homebrew,
    /// Installed title started from the home menu
    Cia,
}

/// Where the running updater was loaded from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HomebrewLocation {
    #[default]
    Unknown,
    Sdmc,
    /// Pushed over the network with 3dslink
    Remote,
}

/// Install details of the running updater
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdaterInfo {
    pub kind: HomebrewType,
    pub location: HomebrewLocation,
    /// Directory of the `.3dsx` on the SD card
    pub sdmc_dir: String,
    /// Base name of the `.3dsx`
    pub sdmc_name: String,
}

impl UpdaterInfo {
    /// Work out the install from the launch path (usually `argv[0]`).
    ///
    /// `installed_title` wins over whatever the path suggests.
    pub fn from_launch_path(path: Option<&str>, installed_title: bool) -> Self {
        let mut info = Self::default();

        if let Some(source) = path {
            if source.starts_with("sdmc:") {
                info.location = HomebrewLocation::Sdmc;
            } else if source.starts_with("3dslink:") {
                info.location = HomebrewLocation::Remote;
            }

            if source.contains(".3dsx") {
                info.kind = HomebrewType::Homebrew;
                let start = source.find(':').map_or(0, |i| i + 1);
                let end = source.rfind('/').filter(|&i| i >= start).unwrap_or(start);
                info.sdmc_dir = source[start..end].to_string();

                let file = source[end..].trim_start_matches('/');
                info.sdmc_name = match file.rfind('.') {
                    Some(ext) => file[..ext].to_string(),
                    None => file.to_string(),
                };
            }
        }

        if installed_title {
            info.kind = HomebrewType::Cia;
        }

        info
    }
}

/// Latest published updater release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatestUpdaterInfo {
    /// Version tag without a leading `v`
    pub version: String,
    /// Archive download URL
    pub url: String,
    pub changelog: String,
    /// Newer than the running updater
    pub is_newer: bool,
    /// Declared archive size, 0 if unknown
    pub file_size: u64,
}

/// Receives an extracted CIA and installs it as a title
pub trait TitleInstaller {
    fn install_cia(&self, data: &[u8]) -> Result<(), String>;
}

/// Installer for hosts without a title manager
pub struct NoTitleInstaller;

impl TitleInstaller for NoTitleInstaller {
    fn install_cia(&self, _data: &[u8]) -> Result<(), String> {
        Err("title installation is not supported on this system".into())
    }
}

/// Parse a tag as semver, padding missing components with zero
pub fn parse_padded_version(tag: &str) -> Result<Version, semver::Error> {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    let split = tag.find(['-', '+']).unwrap_or(tag.len());
    let (core, rest) = tag.split_at(split);

    let mut core = core.to_string();
    for _ in core.split('.').count()..3 {
        core.push_str(".0");
    }
    Version::parse(&format!("{}{}", core, rest))
}

/// Checks for and installs new versions of the updater
pub struct SelfUpdater<H: HttpClient> {
    http: H,
    release_url: String,
    current_version: String,
    sd_root: PathBuf,
}

impl<H: HttpClient> SelfUpdater<H> {
    pub fn new(
        http: H,
        release_url: impl Into<String>,
        current_version: impl Into<String>,
        sd_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            http,
            release_url: release_url.into(),
            current_version: current_version.into(),
            sd_root: sd_root.into(),
        }
    }

    /// Fetch the latest updater release and compare it to the running one
    pub fn get_latest(&self) -> Result<LatestUpdaterInfo, SelfUpdateError> {
        log::info!("Downloading {}", self.release_url);
        let response = self.http.get(&self.release_url).map_err(ReleaseError::from)?;
        log::debug!("Downloaded {} bytes", response.body.len());

        let release = parse_manifest(&response.body)?;
        let version = release_tag(&release)
            .ok_or_else(|| ReleaseError::Parse("Missing tag_name".to_string()))?
            .to_string();
        log::info!("Updater release found: {}", version);

        let mut latest = LatestUpdaterInfo {
            version,
            changelog: release["body"].as_str().unwrap_or("").to_string(),
            ..Default::default()
        };

        for asset in release["assets"].as_array().into_iter().flatten() {
            let Some(url) = asset["browser_download_url"].as_str() else {
                continue;
            };
            if url.contains(".zip") {
                latest.url = url.to_string();
                latest.file_size = asset["size"].as_u64().unwrap_or(0);
            }
        }

        let remote = parse_padded_version(&latest.version)
            .map_err(|e| SelfUpdateError::Version(e.to_string()))?;
        let current = parse_padded_version(&self.current_version)
            .map_err(|e| SelfUpdateError::Version(e.to_string()))?;
        latest.is_newer = remote > current;

        Ok(latest)
    }

    /// Replace the running updater with `latest`
    pub fn do_update(
        &self,
        latest: &LatestUpdaterInfo,
        current: &UpdaterInfo,
        installer: &dyn TitleInstaller,
    ) -> UpdateResult {
        self.try_do_update(latest, current, installer).into()
    }

    pub fn try_do_update(
        &self,
        latest: &LatestUpdaterInfo,
        current: &UpdaterInfo,
        installer: &dyn TitleInstaller,
    ) -> Result<(), SelfUpdateError> {
        log::info!("Downloading {}", latest.url);
        let response = self
            .http
            .get(&latest.url)
            .map_err(|e| SelfUpdateError::Download(e.into()))?;
        log::info!("Download complete! Size: {}", response.body.len());

        let asset = ReleaseVersion {
            url: latest.url.clone(),
            size: latest.file_size,
            ..Default::default()
        };
        verify_download(&asset, response.etag.as_deref(), &response.body)
            .map_err(SelfUpdateError::Download)?;

        let mut archive = open_archive(ArchiveFormat::Zip, &response.body)
            .map_err(|e| extract_error("archive", e))?;

        match current.kind {
            HomebrewType::Cia => {
                log::info!("Extracting {}", CIA_MEMBER);
                let cia = archive
                    .extract_file(CIA_MEMBER)
                    .map_err(|e| extract_error(CIA_MEMBER, e))?;
                log::info!("Installing {} ({} bytes)", CIA_MEMBER, cia.len());
                installer
                    .install_cia(cia.bytes())
                    .map_err(SelfUpdateError::Install)?;
            }
            HomebrewType::Homebrew => {
                self.copy_member(archive.as_mut(), HOMEBREW_MEMBER, current, "3dsx")?;
                self.copy_member(archive.as_mut(), SMDH_MEMBER, current, "smdh")?;
            }
            HomebrewType::Unknown => return Err(SelfUpdateError::UnknownInstall),
        }

        log::info!("Updater updated to {}", latest.version);
        Ok(())
    }

    /// Extract `member` and write it next to the running `.3dsx`
    fn copy_member(
        &self,
        archive: &mut dyn ArchiveReader,
        member: &str,
        current: &UpdaterInfo,
        extension: &str,
    ) -> Result<(), SelfUpdateError> {
        log::info!("Extracting {}", member);
        let file = archive
            .extract_file(member)
            .map_err(|e| extract_error(member, e))?;

        let target = self
            .sd_root
            .join(current.sdmc_dir.trim_start_matches('/'))
            .join(format!("{}.{}", current.sdmc_name, extension));
        log::info!("Copying to {}", target.display());
        fs::write(&target, file.bytes()).map_err(|e| SelfUpdateError::Extract {
            name: member.to_string(),
            reason: e.to_string(),
        })
    }
}

fn extract_error(name: &str, e: ArchiveError) -> SelfUpdateError {
    SelfUpdateError::Extract {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

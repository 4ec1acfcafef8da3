//! Update session state machine
//!
//! A session starts on the confirmation screen with everything the user needs
//! to decide: installed and backup versions, available releases and whether
//! the updater itself can be updated. [`Orchestrator::handle`] takes the
//! current state and one user event and returns the next state. Finished
//! sessions wait for an explicit [`Event::Acknowledge`] before exiting.

use std::cmp::Ordering;
use std::path::PathBuf;

use lumaupdate_core::{compare_releases, FirmwareQuery, SystemFirmware, Version, VersionDetector};

use crate::config::Config;
use crate::http::HttpClient;
use crate::migrate::{needs_legacy_migration, InstallMigrator, SdMigrator};
use crate::release::{Channel, ReleaseCatalog, ReleaseClient};
use crate::selfupdate::{
    LatestUpdaterInfo, NoTitleInstaller, SelfUpdater, TitleInstaller, UpdaterInfo,
};
use crate::update::{
    sibling_path, PayloadUpdater, ProgressSink, UpdateArgs, UpdateResult, BACKUP_SUFFIX,
};

/// Where a session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ConfirmationScreen,
    Updating,
    Restoring,
    Complete,
    Failed,
    Exit,
}

impl Phase {
    /// Finished, waiting for acknowledgment
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }
}

/// What the user picked on the confirmation screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    /// Install `versions[index]` of the channel's catalog
    Update { channel: Channel, index: usize },
    /// Swap the backup payload back in
    Restore,
    /// Install the latest updater release
    SelfUpdate,
}

/// User input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Confirm(Choice),
    Cancel,
    Acknowledge,
}

/// What is on the SD card right now
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallStatus {
    /// Location of the installed payload
    pub payload_file: PathBuf,
    pub installed: Version,
    pub backup: Version,
    /// A `.bak` payload exists
    pub backup_exists: bool,
    /// The install still uses the pre-5.2 layout
    pub migrate_legacy: bool,
}

/// Everything the session knows, passed in and out of [`Orchestrator::handle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: Phase,
    pub install: InstallStatus,
    pub stable: ReleaseCatalog,
    pub hourly: ReleaseCatalog,
    /// Latest updater release, when self-update is enabled and reachable
    pub updater: Option<LatestUpdaterInfo>,
    /// Outcome of the last transaction
    pub result: Option<UpdateResult>,
}

impl SessionState {
    pub fn new(install: InstallStatus) -> Self {
        Self {
            phase: Phase::ConfirmationScreen,
            install,
            stable: ReleaseCatalog::default(),
            hourly: ReleaseCatalog::default(),
            updater: None,
            result: None,
        }
    }

    /// The stable release is worth installing over what is there
    pub fn stable_update_available(&self) -> bool {
        if !self.stable.is_valid() {
            return false;
        }

        let installed = &self.install.installed;
        if !installed.is_valid() {
            return true;
        }

        match compare_releases(&installed.release, &self.stable.name) {
            Ordering::Less => true,
            // Hourly builds carry a commit; a stable of the same release replaces them
            _ => {
                !installed.commit.is_empty()
                    && compare_releases(&self.stable.name, &installed.release) != Ordering::Less
            }
        }
    }

    /// Branch label an hourly update would follow
    pub fn hourly_branch(&self) -> &'static str {
        if self.install.installed.is_dev {
            "dev"
        } else {
            "normal"
        }
    }

    /// The matching hourly branch has a build other than the installed one
    pub fn hourly_update_available(&self) -> bool {
        let Some(latest) = self.hourly.commits.get(self.hourly_branch()) else {
            return false;
        };

        let installed = &self.install.installed.commit;
        installed.is_empty() || !same_commit(installed, latest)
    }

    /// A newer updater has been published
    pub fn self_update_available(&self) -> bool {
        self.updater.as_ref().is_some_and(|latest| latest.is_newer)
    }

    pub fn catalog(&self, channel: Channel) -> &ReleaseCatalog {
        match channel {
            Channel::Stable => &self.stable,
            Channel::Hourly => &self.hourly,
        }
    }
}

/// Short hashes of different lengths name the same commit if one prefixes the other
fn same_commit(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    a.starts_with(&b) || b.starts_with(&a)
}

/// Drives an update session
pub struct Orchestrator<
    H: HttpClient,
    Q: FirmwareQuery = SystemFirmware,
    M: InstallMigrator = SdMigrator,
> {
    config: Config,
    http: H,
    detector: VersionDetector<Q>,
    updater: PayloadUpdater<M>,
    updater_info: UpdaterInfo,
    installer: Box<dyn TitleInstaller>,
    current_version: String,
}

impl<H: HttpClient> Orchestrator<H> {
    /// Orchestrator for the system the process runs on
    pub fn new(config: Config, http: H) -> Self {
        let detector = VersionDetector::default();
        let migrator = SdMigrator::new(config.general.sd_root.clone());
        Self::with_parts(config, http, detector, migrator)
    }
}

impl<H: HttpClient, Q: FirmwareQuery, M: InstallMigrator> Orchestrator<H, Q, M> {
    pub fn with_parts(
        config: Config,
        http: H,
        detector: VersionDetector<Q>,
        migrator: M,
    ) -> Self {
        let updater = PayloadUpdater::with_migrator(config.general.sd_root.clone(), migrator);
        Self {
            config,
            http,
            detector,
            updater,
            updater_info: UpdaterInfo::default(),
            installer: Box::new(NoTitleInstaller),
            current_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Describe the running updater for self-updates
    pub fn with_self_update(
        mut self,
        info: UpdaterInfo,
        installer: Box<dyn TitleInstaller>,
        current_version: impl Into<String>,
    ) -> Self {
        self.updater_info = info;
        self.installer = installer;
        self.current_version = current_version.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn releases(&self) -> ReleaseClient<&H> {
        ReleaseClient::new(&self.http, self.config.sources.clone())
    }

    fn self_updater(&self) -> SelfUpdater<&H> {
        SelfUpdater::new(
            &self.http,
            self.config.sources.updater_release_url.clone(),
            self.current_version.clone(),
            self.config.general.sd_root.clone(),
        )
    }

    /// Inspect the SD card
    pub fn detect_install(&self) -> InstallStatus {
        let payload_file = self.config.general.payload_file();
        let installed = self.detector.detect_installed(&payload_file);
        log::info!("Installed version: {}", describe(&installed));

        let backup_file = sibling_path(&payload_file, BACKUP_SUFFIX);
        let backup_exists = backup_file.is_file();
        let backup = if backup_exists {
            self.detector.detect_file(&backup_file)
        } else {
            Version::invalid()
        };
        if backup_exists {
            log::info!("Backup version: {}", describe(&backup));
        }

        let migrate_legacy = needs_legacy_migration(&installed);
        if migrate_legacy {
            log::info!("Installed version predates Luma3DS 5.2, migration needed");
        }

        InstallStatus {
            payload_file,
            installed,
            backup,
            backup_exists,
            migrate_legacy,
        }
    }

    /// Gather everything the confirmation screen shows
    pub fn prepare(&self) -> SessionState {
        let mut state = SessionState::new(self.detect_install());
        let releases = self.releases();

        state.stable = releases.get_latest_stable().unwrap_or_else(|e| {
            log::warn!("Could not fetch stable release: {}", e);
            ReleaseCatalog::default()
        });
        state.hourly = releases.get_latest_hourly();

        if self.config.general.self_update {
            state.updater = match self.self_updater().get_latest() {
                Ok(latest) => {
                    if latest.is_newer {
                        log::info!("Updater {} is available", latest.version);
                    }
                    Some(latest)
                }
                Err(e) => {
                    log::warn!("Could not check for updater updates: {}", e);
                    None
                }
            };
        }

        state
    }

    /// Apply `event` to `state`.
    ///
    /// Returns the next state and, when a transaction ran, its result.
    pub fn handle(
        &self,
        state: SessionState,
        event: Event,
        progress: &mut dyn ProgressSink,
    ) -> (SessionState, Option<UpdateResult>) {
        match (state.phase, event) {
            (Phase::ConfirmationScreen, Event::Confirm(choice)) => {
                self.run_choice(state, choice, progress)
            }
            (Phase::ConfirmationScreen, Event::Cancel) => {
                log::info!("Cancelled, exiting");
                (enter(state, Phase::Exit, progress), None)
            }
            (phase, Event::Acknowledge) if phase.is_terminal() => {
                (enter(state, Phase::Exit, progress), None)
            }
            (phase, event) => {
                log::debug!("Ignoring {:?} in {:?}", event, phase);
                (state, None)
            }
        }
    }

    fn run_choice(
        &self,
        state: SessionState,
        choice: Choice,
        progress: &mut dyn ProgressSink,
    ) -> (SessionState, Option<UpdateResult>) {
        let payload_path = self.config.general.payload_path.as_str();

        let (state, result) = match choice {
            Choice::Update { channel, index } => {
                let Some(release) = state.catalog(channel).versions.get(index).cloned() else {
                    log::warn!("No {:?} version at index {}", channel, index);
                    return (state, None);
                };

                let state = enter(state, Phase::Updating, progress);
                log::info!("Installing {} ({})", release.friendly_name, release.filename);
                let args = UpdateArgs {
                    release: &release,
                    channel,
                    payload_path,
                    backup_existing: self.config.general.backup_existing,
                    migrate_legacy: state.install.migrate_legacy,
                };
                let result = self.updater.update(&self.releases(), &args, progress);
                (state, result)
            }
            Choice::Restore => {
                if !state.install.backup_exists {
                    log::warn!("No backup payload to restore");
                    return (state, None);
                }
                let state = enter(state, Phase::Restoring, progress);
                let result = self.updater.restore(payload_path);
                (state, result)
            }
            Choice::SelfUpdate => {
                let Some(latest) = state.updater.clone().filter(|l| l.is_newer) else {
                    log::warn!("No newer updater release available");
                    return (state, None);
                };
                let state = enter(state, Phase::Updating, progress);
                let result = self.self_updater().do_update(
                    &latest,
                    &self.updater_info,
                    self.installer.as_ref(),
                );
                (state, result)
            }
        };

        finish(state, result, progress)
    }
}

fn enter(mut state: SessionState, phase: Phase, progress: &mut dyn ProgressSink) -> SessionState {
    state.phase = phase;
    progress.on_phase(phase);
    state
}

fn finish(
    mut state: SessionState,
    result: UpdateResult,
    progress: &mut dyn ProgressSink,
) -> (SessionState, Option<UpdateResult>) {
    let phase = if result.success {
        Phase::Complete
    } else {
        Phase::Failed
    };
    state.result = Some(result.clone());
    (enter(state, phase, progress), Some(result))
}

fn describe(version: &Version) -> String {
    if version.is_valid() {
        version.display(true)
    } else {
        "unknown".to_string()
    }
}

//! lumaupdate-app: Update logic for lumaupdate
//!
//! This crate contains everything between the payload bytes and the user:
//! configuration, release fetching, install transactions, SD card migrations,
//! self-updates and the session state machine tying them together.

pub mod config;
pub mod http;
pub mod migrate;
pub mod orchestrator;
pub mod release;
pub mod selfupdate;
pub mod update;

pub use config::{load_config, load_config_from, save_config, Config};
pub use http::{HttpClient, HttpError, HttpResponse, ReqwestClient};
pub use migrate::{needs_legacy_migration, InstallMigrator, SdMigrator};
pub use orchestrator::{Choice, Event, InstallStatus, Orchestrator, Phase, SessionState};
pub use release::{Channel, ReleaseCatalog, ReleaseClient, ReleaseError, ReleaseVersion};
pub use selfupdate::{SelfUpdater, TitleInstaller, UpdaterInfo};
pub use update::{PayloadUpdater, ProgressSink, UpdateArgs, UpdateResult, UpdateStep};

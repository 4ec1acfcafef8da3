//! lumaupdate - Luma3DS payload updater
//!
//! Detects the installed payload, shows what is available and runs one
//! update, restore or self-update session against the configured SD card.

mod cli;

use anyhow::{bail, Context};
use lumaupdate_app::selfupdate::NoTitleInstaller;
use lumaupdate_app::{
    load_config, load_config_from, Channel, Choice, Event, Orchestrator, Phase, ProgressSink,
    ReqwestClient, SessionState, UpdateStep, UpdaterInfo,
};
use lumaupdate_core::Version;

use crate::cli::{Cli, Command};

/// Reports progress through the log
struct LogProgress {
    last_percent: Option<u64>,
}

impl ProgressSink for LogProgress {
    fn on_progress(&mut self, step: UpdateStep, fraction: f32) {
        log::info!("[{:>3}%] {}", (fraction * 100.0).round() as u32, step.label());
    }

    fn on_download(&mut self, received: u64, total: Option<u64>) {
        let Some(total) = total.filter(|&t| t > 0) else {
            return;
        };
        let percent = received * 100 / total;
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            log::debug!("Downloaded {} / {} bytes ({}%)", received, total, percent);
        }
    }

    fn on_phase(&mut self, phase: Phase) {
        log::debug!("Session phase: {:?}", phase);
    }
}

fn describe(version: &Version) -> String {
    if version.is_valid() {
        version.display(true)
    } else {
        "not found".to_string()
    }
}

fn print_summary(state: &SessionState) {
    println!("Installed: {}", describe(&state.install.installed));
    if state.install.backup_exists {
        println!("Backup:    {}", describe(&state.install.backup));
    }

    if state.stable.is_valid() {
        let marker = if state.stable_update_available() { " (update available)" } else { "" };
        println!("Stable:    {}{}", state.stable.name, marker);
        for version in &state.stable.versions {
            println!("  - {} [{}]", version.filename, version.friendly_name);
        }
    } else {
        println!("Stable:    unavailable");
    }

    if state.hourly.is_valid() {
        let marker = if state.hourly_update_available() { " (update available)" } else { "" };
        println!("Hourly:{}", marker);
        for (branch, commit) in &state.hourly.commits {
            println!("  - {}: {}", branch, commit);
        }
    } else {
        println!("Hourly:    unavailable");
    }

    if let Some(latest) = &state.updater {
        let marker = if latest.is_newer { " (update available)" } else { "" };
        println!("Updater:   {}{}", latest.version, marker);
    }
}

/// Index of the requested variant in the channel's catalog
fn pick_version(state: &SessionState, channel: Channel, dev: bool) -> Option<usize> {
    let versions = &state.catalog(channel).versions;
    match channel {
        Channel::Stable => versions.iter().position(|v| v.is_dev() == dev),
        Channel::Hourly => {
            let branch = if dev { "dev" } else { "normal" };
            let commit = state.hourly.commits.get(branch)?;
            versions.iter().position(|v| &v.filename == commit)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut config = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    cli.apply_overrides(&mut config);
    log::debug!("SD root: {}", config.general.sd_root.display());

    let command = cli.command();
    let http = ReqwestClient::new(&config.network).context("Failed to create HTTP client")?;
    let mut orchestrator = Orchestrator::new(config, http);
    if let Command::SelfUpdate { launch_path, cia } = &command {
        let info = UpdaterInfo::from_launch_path(launch_path.as_deref(), *cia);
        orchestrator = orchestrator.with_self_update(
            info,
            Box::new(NoTitleInstaller),
            env!("CARGO_PKG_VERSION"),
        );
    }

    let state = orchestrator.prepare();
    print_summary(&state);

    let event = match command {
        Command::Check => Event::Cancel,
        Command::Update { hourly, dev } => {
            let channel = if hourly { Channel::Hourly } else { Channel::Stable };
            let Some(index) = pick_version(&state, channel, dev) else {
                bail!("No matching {:?} version available", channel);
            };
            let up_to_date = match channel {
                Channel::Stable => !state.stable_update_available(),
                Channel::Hourly => !state.hourly_update_available(),
            };
            if up_to_date {
                log::info!("Installed version is already current, reinstalling");
            }
            Event::Confirm(Choice::Update { channel, index })
        }
        Command::Restore => Event::Confirm(Choice::Restore),
        Command::SelfUpdate { .. } => Event::Confirm(Choice::SelfUpdate),
    };

    let mut progress = LogProgress { last_percent: None };
    let (state, result) = orchestrator.handle(state, event, &mut progress);

    if state.phase == Phase::ConfirmationScreen {
        bail!("Nothing to do for this choice");
    }

    let failure = result.filter(|r| !r.success);
    match (&state.result, state.phase) {
        (Some(result), Phase::Complete) => println!("Done ({})", result.errcode),
        (Some(result), _) => println!("Failed: {}", result.errcode),
        _ => {}
    }

    // Terminal states only end on acknowledgment
    let (state, _) = orchestrator.handle(state, Event::Acknowledge, &mut progress);
    log::debug!("Exiting from {:?}", state.phase);

    if let Some(result) = failure {
        bail!("Session failed with {}", result.errcode);
    }
    Ok(())
}

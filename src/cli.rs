//! CLI argument parsing for lumaupdate

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use lumaupdate_app::Config;

/// lumaupdate - Luma3DS payload updater
#[derive(Parser, Debug)]
#[command(name = "lumaupdate")]
#[command(about = "Update, restore and inspect a Luma3DS payload on an SD card")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// SD card root, overrides the configuration
    #[arg(long = "sd-root", global = true)]
    pub sd_root: Option<PathBuf>,

    /// Log level
    #[arg(long = "log-level", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show installed and available versions
    Check,

    /// Install the latest release
    Update {
        /// Use the hourly build channel
        #[arg(long)]
        hourly: bool,

        /// Install the developer variant
        #[arg(long)]
        dev: bool,
    },

    /// Put the backup payload back in place
    Restore,

    /// Update the updater itself
    SelfUpdate {
        /// Path the updater was launched from (e.g. sdmc:/3ds/lumaupdater/lumaupdater.3dsx)
        #[arg(long = "launch-path")]
        launch_path: Option<String>,

        /// The updater is installed as a title
        #[arg(long)]
        cia: bool,
    },
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Subcommand to run, `check` if none was given
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Check)
    }

    /// Apply command-line overrides to the loaded configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(root) = &self.sd_root {
            config.general.sd_root = root.clone();
        }
    }
}

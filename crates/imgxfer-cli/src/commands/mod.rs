//! CLI command definitions and handlers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use imgxfer_core::config::Config;
use imgxfer_core::session::rest::Auth;
use imgxfer_core::session::ImageRef;

pub mod checksum;
pub mod completions;
pub mod config;
pub mod transfer;

/// Load configuration from the default location.
///
/// A missing file yields defaults. A file that exists but does not parse or
/// validate is an error rather than a silent fallback.
pub fn load_config() -> Result<Config> {
    Config::load().with_context(|| {
        format!(
            "Failed to load configuration from {}",
            Config::config_path().display()
        )
    })
}

/// imgxfer - Virtual-disk image transfer client
#[derive(Parser)]
#[command(name = "imgxfer")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Options shared by every command
    #[command(flatten)]
    pub global: GlobalArgs,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Options accepted before or after any subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Bearer token for the control plane
    #[arg(long, global = true, env = "IMGXFER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Password for basic authentication (user from [control_plane] username)
    #[arg(long, global = true, env = "IMGXFER_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Detailed logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Minimal output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Pause the transfer once this fraction (0.0-1.0) has been moved
    #[arg(long, global = true, value_parser = parse_fraction)]
    pub pause_at: Option<f64>,

    /// How long to stay paused (e.g. 30s, 2m); defaults to [polling] settle_duration
    #[arg(long, global = true, requires = "pause_at")]
    pub settle: Option<String>,

    /// Compare local and backend checksums after the transfer
    #[arg(long, global = true)]
    pub verify: bool,
}

impl GlobalArgs {
    /// Control-plane credentials from the flags and configuration.
    ///
    /// A token wins over a password. A password needs a configured user name.
    pub fn auth(&self, config: &Config) -> Result<Auth> {
        if let Some(token) = &self.token {
            return Ok(Auth::Bearer(token.clone()));
        }
        match (&self.password, &config.control_plane.username) {
            (Some(password), Some(username)) => Ok(Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            (Some(_), None) => anyhow::bail!(
                "--password needs [control_plane] username in {}",
                Config::config_path().display()
            ),
            (None, _) => Ok(Auth::None),
        }
    }

    /// Whether human-readable output should be printed.
    pub const fn human(&self) -> bool {
        !self.quiet && !self.json
    }
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Upload a local image file into a disk
    Upload(TransferArgs),

    /// Download a disk or snapshot into a local file
    Download(TransferArgs),

    /// Print the SHA-256 checksum of a local file
    Checksum(ChecksumArgs),

    /// Manage configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Arguments for the upload and download commands
#[derive(Parser, Debug)]
pub struct TransferArgs {
    /// Local image file
    pub path: PathBuf,

    /// Disk id on the control plane
    #[arg(long)]
    pub disk: String,

    /// Treat the id as a disk snapshot
    #[arg(long)]
    pub snapshot: bool,

    /// Bytes to transfer instead of the file length or backend size
    #[arg(long)]
    pub size: Option<u64>,
}

impl TransferArgs {
    /// The backend image the arguments name.
    pub fn image(&self) -> ImageRef {
        if self.snapshot {
            ImageRef::Snapshot(self.disk.clone())
        } else {
            ImageRef::Disk(self.disk.clone())
        }
    }
}

/// Arguments for the checksum command
#[derive(Parser, Debug)]
pub struct ChecksumArgs {
    /// File to hash
    pub path: PathBuf,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Arguments for the completions command
#[derive(Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: ShellType,
}

/// Supported shell types for completions
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum ShellType {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    #[value(name = "powershell")]
    PowerShell,
    /// Elvish shell
    Elvish,
}

fn parse_fraction(s: &str) -> std::result::Result<f64, String> {
    let value: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a number"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{value} is outside 0.0-1.0"))
    }
}

//! abflash CLI - flash A/B root partitions of embedded Linux boards.
//!
//! ## Features
//!
//! - Flash an image from an SSH host into the inactive root partition
//! - Inspect the device's A/B state (`status`, with JSON output)
//! - Optional SSH relay on this machine or on a second serial console
//! - Layered configuration (`abflash.toml`, global config, environment)
//! - Shell completion generation

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if spinners and colors should be used.
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// abflash - flash A/B root partitions of embedded Linux boards over a
/// serial console.
///
/// Environment variables:
///   ABFLASH_PORT              - Device serial console
///   ABFLASH_BAUD              - Baud rate (default: 115200)
///   ABFLASH_IMAGE_HOST        - Host serving the images over SSH
///   ABFLASH_IMAGE_USER        - Login on the image host
///   ABFLASH_IMAGE_PASSWORD    - Password on the image host
///   ABFLASH_NON_INTERACTIVE   - Never prompt
#[derive(Parser)]
#[command(name = "abflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    abflash -p /dev/ttyUSB0 status\n  \
    abflash -p /dev/ttyUSB0 flash rpi4.img --host 192.168.1.10 --ask-password")]
pub(crate) struct Cli {
    /// Serial port of the device console.
    #[arg(short, long, global = true, env = "ABFLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the device console [default: 115200].
    #[arg(short, long, global = true, env = "ABFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ABFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash an image into the inactive root partition.
    Flash(FlashArgs),

    /// Show which partition the device boots from and the partition layout.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install the completion script for the shell.
        #[arg(long)]
        install: bool,
    },
}

/// Arguments of `flash`.
#[derive(Args, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct FlashArgs {
    /// Image path on the image host, absolute or relative to --base-path.
    image: String,

    /// Host serving the image over SSH.
    #[arg(long, env = "ABFLASH_IMAGE_HOST")]
    host: Option<String>,

    /// Login on the image host [default: root].
    #[arg(short, long, env = "ABFLASH_IMAGE_USER")]
    user: Option<String>,

    /// Password on the image host.
    #[arg(long, env = "ABFLASH_IMAGE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Prompt for the image host password.
    #[arg(long, conflicts_with = "password")]
    ask_password: bool,

    /// Directory relative image paths are resolved against [default: /tmp].
    #[arg(long, value_name = "DIR")]
    base_path: Option<String>,

    /// Check the image host with `ssh` run on this machine.
    #[arg(long, conflicts_with = "relay_port")]
    relay_local: bool,

    /// Check the image host from a second machine on this serial console.
    #[arg(long, value_name = "PORT")]
    relay_port: Option<String>,

    /// Install the device's SSH key on the image host first.
    #[arg(long)]
    provision_keys: bool,

    /// Timeout of the image transfer in seconds.
    #[arg(long, value_name = "SECS")]
    transfer_timeout: Option<u64>,

    /// Maximum wait for the device after reboot in seconds.
    #[arg(long, value_name = "SECS")]
    reboot_timeout: Option<u64>,
}

/// CLI-level failures with their own exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Missing or contradictory input.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration file.
    #[error("{0}")]
    Config(String),
    /// The user backed out of a prompt.
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
///
/// 2 usage, 3 configuration, 4 device console, 5 flash failure,
/// 130 cancelled, 1 anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<abflash::Error>() {
        Some(e) if matches!(e.root_cause(), abflash::Error::Config(_)) => 3,
        Some(e) if e.step().is_some() => 5,
        Some(abflash::Error::Io(_) | abflash::Error::Serial(_)) => 4,
        Some(_) => 5,
        None => 1,
    }
}

/// One-line message of the whole error chain.
///
/// Library errors already embed their source in the message, so causes
/// whose text is already present are skipped.
fn describe(err: &anyhow::Error) -> String {
    let mut message = err.to_string();
    for cause in err.chain().skip(1) {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
    }
    message
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // clap prints help/version/usage itself and picks 0 or 2.
        Err(e) => e.exit(),
    };

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "abflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", style("Error:").red().bold(), describe(&err));
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Flash(args) => commands::flash::cmd_flash(cli, &config, args),
        Commands::Status { json } => commands::status::cmd_status(cli, &config, *json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g. `abflash completions bash`, \
                         or use `abflash completions --install`"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

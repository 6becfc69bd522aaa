//! Flash command implementation.

use std::time::Duration;

use abflash::{
    AbFlasher, FlashReport, FlashRequest, FlashStep, ImageKind, LocalRunner, NativePort,
    RelayExecutor, SerialConfig, SerialConsole, Shell,
};
use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::config::Config;
use crate::serial::{prompt_password, select_serial_port};
use crate::{Cli, CliError, FlashArgs, use_fancy_output};

/// Baud rate used when neither the CLI nor the config names one.
pub(crate) const DEFAULT_BAUD: u32 = 115200;

/// Device shell on a serial console.
pub(crate) type SerialShell = Shell<SerialConsole<NativePort>>;

/// Open `port` and wrap it in a shell using the configured prompts.
pub(crate) fn open_shell(port: &str, baud: u32, config: &Config) -> Result<SerialShell> {
    let native = NativePort::open(&SerialConfig::new(port, baud))
        .with_context(|| format!("Failed to open serial port {port}"))?;
    let console = SerialConsole::new(native);

    if config.console.prompts.is_empty() {
        Ok(Shell::new(console)?)
    } else {
        let patterns: Vec<&str> = config.console.prompts.iter().map(String::as_str).collect();
        Shell::with_prompt_patterns(console, &patterns).map_err(|e| {
            CliError::Config(format!("Invalid prompt pattern in config: {e}")).into()
        })
    }
}

/// Open the device console named on the command line or in the config.
pub(crate) fn open_device_shell(cli: &Cli, config: &Config) -> Result<SerialShell> {
    let port = select_serial_port(cli.port.as_deref(), config, cli.non_interactive)?;
    let baud = cli.baud.or(config.console.baud).unwrap_or(DEFAULT_BAUD);
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {baud} baud",
            style("🔌").cyan(),
            style(&port).bold()
        );
    }
    open_shell(&port, baud, config)
}

/// Build the request from arguments and config.
fn build_request(cli: &Cli, config: &Config, args: &FlashArgs) -> Result<FlashRequest> {
    let host = args
        .host
        .clone()
        .or_else(|| config.image.host.clone())
        .ok_or_else(|| {
            CliError::Usage(
                "No image host given; pass --host or set ABFLASH_IMAGE_HOST".to_string(),
            )
        })?;

    let mut request = FlashRequest::new(&args.image, host);
    if let Some(user) = args.user.as_ref().or(config.image.user.as_ref()) {
        request = request.with_username(user);
    }
    if let Some(base_path) = args.base_path.as_ref().or(config.image.base_path.as_ref()) {
        request = request.with_base_path(base_path);
    }

    let password = if args.ask_password {
        Some(prompt_password(
            &request.ssh_target().destination(),
            cli.non_interactive,
        )?)
    } else {
        args.password.clone()
    };
    Ok(request.with_password(password))
}

/// Relay selected by arguments or config, if any.
fn build_relay(args: &FlashArgs, config: &Config, baud: u32) -> Result<Option<RelayExecutor>> {
    let relay = if args.relay_local {
        Some(RelayExecutor::new(LocalRunner::new(), "localhost"))
    } else if let Some(port) = args.relay_port.as_ref().or(config.relay.port.as_ref()) {
        let shell = open_shell(port, baud, config)
            .with_context(|| format!("Failed to open relay console {port}"))?;
        Some(RelayExecutor::new(shell, port.clone()))
    } else if config.relay.local {
        Some(RelayExecutor::new(LocalRunner::new(), "localhost"))
    } else {
        None
    };

    Ok(relay.map(|r| match config.relay.connect_timeout {
        Some(secs) => r.with_connect_timeout(secs),
        None => r,
    }))
}

fn step_progress(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(FlashStep::ALL.len() as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, args: &FlashArgs) -> Result<()> {
    let request = build_request(cli, config, args)?;
    debug!("{request:?}");

    let mut options = config.flash_options();
    if let Some(secs) = args.transfer_timeout {
        options.transfer_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.reboot_timeout {
        options.reboot = options.reboot.with_max_wait(Duration::from_secs(secs));
    }
    options.provision_keys |= args.provision_keys;

    let shell = open_device_shell(cli, config)?;
    let baud = cli.baud.or(config.console.baud).unwrap_or(DEFAULT_BAUD);
    let mut flasher = AbFlasher::new(shell).with_options(options);
    if let Some(relay) = build_relay(args, config, baud)? {
        flasher = flasher.with_relay(relay);
    }

    if !cli.quiet {
        eprintln!(
            "{} Flashing {} from {}",
            style("📦").cyan(),
            style(request.image_path()).bold(),
            request.ssh_target().destination()
        );
    }

    let pb = step_progress(cli.quiet);
    let result = flasher.flash_with_progress(&request, |step| {
        pb.set_position(step.number() as u64 - 1);
        pb.set_message(step.description());
    });

    match result {
        Ok(report) => {
            pb.finish_with_message("done");
            if !cli.quiet {
                print_report(&report);
            }
            Ok(())
        },
        Err(e) => {
            pb.abandon();
            Err(anyhow::Error::from(e).context(format!("Flash of {} failed", request.image)))
        },
    }
}

fn print_report(report: &FlashReport) {
    let kind = match report.image.kind {
        ImageKind::Raw => "raw filesystem image".to_string(),
        ImageKind::Partitioned { sector_count, .. } => {
            format!("partitioned image, {sector_count} sectors")
        },
    };
    eprintln!(
        "{} Wrote {} ({kind}) to {} via {}",
        style("✓").green(),
        report.image.path,
        report.flashed.device_node(),
        report.transport
    );
    if let Some(version) = &report.version {
        eprintln!("{} Image version: {}", style("ℹ").blue(), version.trim());
    }
    eprintln!(
        "\n{} Device now boots from {} (was {})",
        style("🎉").green().bold(),
        style(report.flashed).bold(),
        report.previous
    );
}

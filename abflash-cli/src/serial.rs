//! Serial port selection and interactive prompts.
//!
//! The device console is taken from `--port`/`ABFLASH_PORT`, then from the
//! config file. Without either, the ports present on the system are listed:
//! a single USB serial adapter is picked automatically, several candidates are
//! offered in a selection prompt, and non-interactive mode refuses to guess.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Error as DialoguerError, Password, Select, theme::ColorfulTheme};
use log::{debug, info};
use serialport::{SerialPortInfo, SerialPortType};

use crate::CliError;
use crate::config::Config;

/// What to do with the detected ports.
#[derive(Debug, PartialEq, Eq)]
enum Choice {
    /// Use this port without asking.
    Use(String),
    /// Let the user pick from the candidates.
    Ask(Vec<SerialPortInfo>),
}

fn usage_err(message: impl Into<String>) -> anyhow::Error {
    CliError::Usage(message.into()).into()
}

/// Resolve the device console port.
pub(crate) fn select_serial_port(
    explicit: Option<&str>,
    config: &Config,
    non_interactive: bool,
) -> Result<String> {
    if let Some(port) = explicit {
        return Ok(port.to_string());
    }
    if let Some(port) = &config.console.port {
        debug!("Using port from config: {port}");
        return Ok(port.clone());
    }

    let ports = serialport::available_ports().context("Failed to list serial ports")?;
    match choose(ports, non_interactive)? {
        Choice::Use(port) => {
            info!("Auto-selected port: {port}");
            Ok(port)
        },
        Choice::Ask(candidates) => {
            ensure_interactive_terminal()?;
            select_port_interactive(&candidates)
        },
    }
}

/// Decide between auto-selection, a prompt and an error.
fn choose(mut ports: Vec<SerialPortInfo>, non_interactive: bool) -> Result<Choice> {
    if ports.is_empty() {
        return Err(usage_err(
            "No serial ports found; pass --port or set ABFLASH_PORT",
        ));
    }

    // USB adapters first, they are what a board console is usually wired to.
    ports.sort_by_key(|p| !is_usb(p));
    let usb_count = ports.iter().filter(|p| is_usb(p)).count();

    if ports.len() == 1 || usb_count == 1 {
        return Ok(Choice::Use(ports.swap_remove(0).port_name));
    }
    if non_interactive {
        return Err(usage_err(format!(
            "Found multiple serial ports ({}); pass --port in non-interactive mode",
            ports
                .iter()
                .map(|p| p.port_name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    Ok(Choice::Ask(ports))
}

fn is_usb(port: &SerialPortInfo) -> bool {
    matches!(port.port_type, SerialPortType::UsbPort(_))
}

/// One line describing a port in the selection prompt.
fn port_label(port: &SerialPortInfo) -> String {
    match &port.port_type {
        SerialPortType::UsbPort(usb) => {
            let product = usb
                .product
                .as_ref()
                .map(|p| format!(" - {}", style(p).dim()))
                .unwrap_or_default();
            format!(
                "{} ({:04X}:{:04X}){product}",
                style(&port.port_name).bold(),
                usb.vid,
                usb.pid
            )
        },
        _ => port.port_name.clone(),
    }
}

fn select_port_interactive(ports: &[SerialPortInfo]) -> Result<String> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the device console")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    selection
        .and_then(|index| ports.get(index))
        .map(|p| p.port_name.clone())
        .ok_or_else(|| CliError::Cancelled("Port selection cancelled".to_string()).into())
}

/// Ask for the image host password.
pub(crate) fn prompt_password(destination: &str, non_interactive: bool) -> Result<String> {
    if non_interactive {
        return Err(usage_err(
            "--ask-password needs a terminal; use --password or ABFLASH_IMAGE_PASSWORD",
        ));
    }
    ensure_interactive_terminal()?;
    Password::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Password for {destination}"))
        .allow_empty_password(true)
        .interact()
        .map_err(map_prompt_error)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err("Interactive prompt requires a terminal"))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("Prompt cancelled".to_string()).into()
        },
        DialoguerError::IO(io_err) => usage_err(format!("Prompt failed: {io_err}")),
    }
}

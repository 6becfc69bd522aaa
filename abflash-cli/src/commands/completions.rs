//! Shell completion generation and installation.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;

use crate::{Cli, CliError};

const BIN_NAME: &str = "abflash";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    generate(shell, &mut Cli::command(), BIN_NAME, &mut io::stdout());
}

/// Detect the user's current shell from environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var_os("PSModulePath").is_some() {
        return Some(Shell::PowerShell);
    }
    None
}

/// Map a shell binary path such as `/usr/bin/zsh` to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path).file_name()?.to_str()?;
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where the completion script for `shell` goes under `dirs`.
fn install_path(shell: Shell, dirs: &BaseDirs) -> Result<PathBuf> {
    Ok(match shell {
        Shell::Bash => dirs
            .data_dir()
            .join("bash-completion")
            .join("completions")
            .join(BIN_NAME),
        Shell::Zsh => dirs.home_dir().join(".zfunc").join(format!("_{BIN_NAME}")),
        Shell::Fish => dirs
            .config_dir()
            .join("fish")
            .join("completions")
            .join(format!("{BIN_NAME}.fish")),
        Shell::Elvish => dirs
            .config_dir()
            .join("elvish")
            .join("lib")
            .join(format!("{BIN_NAME}.elv")),
        Shell::PowerShell => dirs
            .config_dir()
            .join("powershell")
            .join("completions")
            .join(format!("{BIN_NAME}.ps1")),
        _ => anyhow::bail!(CliError::Usage(format!(
            "Unsupported shell for auto-install: {shell}"
        ))),
    })
}

/// What to tell the user after installing.
fn activation_hint(shell: Shell, path: &Path) -> String {
    match shell {
        Shell::Bash => format!("Run `source {}` or open a new terminal.", path.display()),
        Shell::Zsh => "Add `fpath=(~/.zfunc $fpath)` before `compinit` in ~/.zshrc, then run `exec zsh`."
            .to_string(),
        Shell::PowerShell => format!("Add `. {}` to your PowerShell profile.", path.display()),
        _ => "Completions load automatically in new sessions.".to_string(),
    }
}

/// Install shell completions for the given or detected shell.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().ok_or_else(|| {
            CliError::Usage(
                "Could not detect your shell; name it explicitly, e.g. \
                 `abflash completions --install bash`"
                    .to_string(),
            )
        })?,
    };

    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = install_path(shell, &dirs)?;

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), BIN_NAME, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(shell).cyan(),
        style(path.display()).yellow()
    );
    eprintln!("{}", activation_hint(shell, &path));
    Ok(())
}

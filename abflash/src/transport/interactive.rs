//! Interactive SSH driven over the device console.

use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use regex::Regex;

use crate::console::{Console, clean_console_text};
use crate::error::{Error, Result};
use crate::shell::{Shell, shell_quote, strip_echo};
use crate::transport::SshTarget;

/// Dropbear host key confirmation.
const DROPBEAR_HOST_KEY: &str = r"Do you want to continue connecting\? \(y/n\)";

/// OpenSSH host key confirmation.
const OPENSSH_HOST_KEY: &str = r"Are you sure you want to continue connecting";

const PASSWORD_PROMPT: &str = r"[Pp]assword:";

/// Password prompts tolerated before giving up.
const MAX_PASSWORD_ATTEMPTS: usize = 2;

/// How long to wait for the shell after aborting with Ctrl-C.
const ABORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Prompt recognised while an `ssh` command runs on the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshPrompt {
    /// Unknown host key; confirm with `answer`.
    HostKey {
        /// Text accepted by the client (`y` for Dropbear, `yes` for OpenSSH).
        answer: &'static str,
    },
    /// Password requested.
    Password,
    /// The shell prompt is back; the command finished.
    ShellPrompt,
}

/// Compiled prompt set: SSH prompts first, then the shell prompts.
struct PromptSet {
    patterns: Vec<Regex>,
}

impl PromptSet {
    fn new(shell_prompts: &[Regex]) -> Result<Self> {
        let mut patterns = vec![
            Regex::new(DROPBEAR_HOST_KEY)?,
            Regex::new(OPENSSH_HOST_KEY)?,
            Regex::new(PASSWORD_PROMPT)?,
        ];
        patterns.extend(shell_prompts.iter().cloned());
        Ok(Self { patterns })
    }

    fn classify(index: usize) -> SshPrompt {
        match index {
            0 => SshPrompt::HostKey { answer: "y" },
            1 => SshPrompt::HostKey { answer: "yes" },
            2 => SshPrompt::Password,
            _ => SshPrompt::ShellPrompt,
        }
    }
}

/// Send `line` on the console and answer SSH prompts until the shell prompt
/// returns.
///
/// `timeout` bounds the whole exchange, not each prompt. Returns the output
/// accumulated across all prompts with the terminal echo removed.
pub(crate) fn drive<C: Console>(
    shell: &mut Shell<C>,
    target: &SshTarget,
    line: &str,
    timeout: Duration,
) -> Result<String> {
    let prompts = PromptSet::new(shell.prompts())?;
    let deadline = Instant::now() + timeout;

    shell.drain()?;
    debug!("$ {line}");
    shell.console_mut().send_line(line)?;

    let mut output = String::new();
    let mut last_sent = line.to_string();
    let mut password_attempts = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let index = match shell.console_mut().expect(&prompts.patterns, remaining) {
            Ok(index) => index,
            Err(Error::Timeout(_)) => {
                return Err(Error::CommandTimeout {
                    command: line.to_string(),
                    timeout,
                });
            },
            Err(e) => return Err(e),
        };

        let segment = strip_echo(&clean_console_text(shell.console().before()), &last_sent);
        if !segment.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&segment);
        }

        match PromptSet::classify(index) {
            SshPrompt::HostKey { answer } => {
                info!("Accepting host key of {}", target.host);
                shell.console_mut().send_line(answer)?;
                last_sent = answer.to_string();
            },
            SshPrompt::Password => {
                let Some(password) = target.password.as_deref() else {
                    abort(shell);
                    return Err(Error::CredentialsRequired(target.destination()));
                };
                password_attempts += 1;
                if password_attempts > MAX_PASSWORD_ATTEMPTS {
                    abort(shell);
                    return Err(Error::AuthenticationFailed(target.destination()));
                }
                debug!("Providing password for {}", target.destination());
                shell.console_mut().send_line(password)?;
                last_sent = password.to_string();
            },
            SshPrompt::ShellPrompt => {
                trace!("{output}");
                return Ok(output);
            },
        }
    }
}

/// Interrupt whatever runs on the console and wait for the shell.
pub(crate) fn abort<C: Console>(shell: &mut Shell<C>) {
    let prompts = shell.prompts().to_vec();
    let console = shell.console_mut();
    if let Err(e) = console.send_control('c') {
        warn!("Failed to send Ctrl-C: {e}");
        return;
    }
    if let Err(e) = console.expect(&prompts, ABORT_TIMEOUT) {
        warn!("Shell did not come back after Ctrl-C: {e}");
    }
}

/// `ssh user@host '<remote_command>'` as typed on the console.
///
/// Dropbear's client has no `-o` options, so the line is kept plain.
pub fn ssh_command(target: &SshTarget, remote_command: &str) -> String {
    format!("ssh {} {}", target.destination(), shell_quote(remote_command))
}

/// Runs commands on the image host by typing `ssh` on the device console.
pub struct ConsoleExecutor<'a, C: Console> {
    shell: &'a mut Shell<C>,
}

impl<'a, C: Console> ConsoleExecutor<'a, C> {
    /// Borrow the device shell for remote execution.
    pub fn new(shell: &'a mut Shell<C>) -> Self {
        Self { shell }
    }

    /// Run `remote_command` on `target` and return its output.
    pub fn execute(
        &mut self,
        target: &SshTarget,
        remote_command: &str,
        timeout: Duration,
    ) -> Result<String> {
        let line = ssh_command(target, remote_command);
        drive(self.shell, target, &line, timeout)
    }
}

//! Command executor: one shell command at a time over a [`Console`].

use std::time::Duration;

use log::{debug, trace};
use regex::Regex;

use crate::console::{Console, clean_console_text};
use crate::error::{Error, Result};

/// Default shell prompt, e.g. `root@rpi4:~# ` or `pi@raspberrypi:/tmp$ `.
pub const DEFAULT_PROMPT: &str = r"\w+@[\w\-.]+:[^\r\n]*[#$] ?";

/// Default timeout for short inspection commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of non-blocking reads used to discard stray output.
const DRAIN_ATTEMPTS: usize = 5;

/// Timeout of each drain read.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

const DRAIN_MAX_BYTES: usize = 4096;

/// Something that can run a shell command and return its output.
///
/// Implemented by [`Shell`] (device console) and
/// [`LocalRunner`](crate::transport::LocalRunner) (the machine running this
/// tool), so either can act as the relay host.
pub trait CommandRunner {
    /// Run `command`, waiting at most `timeout` for it to finish.
    fn run(&mut self, command: &str, timeout: Duration) -> Result<String>;
}

/// Shell session on the device console.
pub struct Shell<C: Console> {
    console: C,
    prompts: Vec<Regex>,
}

impl<C: Console> Shell<C> {
    /// Create a shell expecting the [`DEFAULT_PROMPT`].
    pub fn new(console: C) -> Result<Self> {
        Self::with_prompt_patterns(console, &[DEFAULT_PROMPT])
    }

    /// Create a shell with custom prompt regular expressions.
    pub fn with_prompt_patterns(console: C, patterns: &[&str]) -> Result<Self> {
        let prompts = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::with_prompts(console, prompts))
    }

    /// Create a shell with already compiled prompt patterns.
    pub fn with_prompts(console: C, prompts: Vec<Regex>) -> Self {
        Self { console, prompts }
    }

    /// Prompt patterns that mark the end of a command.
    pub fn prompts(&self) -> &[Regex] {
        &self.prompts
    }

    /// Get a reference to the underlying console.
    pub fn console(&self) -> &C {
        &self.console
    }

    /// Get a mutable reference to the underlying console.
    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    /// Consume the shell and return the underlying console.
    pub fn into_console(self) -> C {
        self.console
    }

    /// Discard anything already buffered on the console.
    pub fn drain(&mut self) -> Result<()> {
        for _ in 0..DRAIN_ATTEMPTS {
            let stray = self
                .console
                .read_nonblocking(DRAIN_MAX_BYTES, DRAIN_TIMEOUT)?;
            if stray.is_empty() {
                break;
            }
            trace!("Discarded {} stray bytes: {stray:?}", stray.len());
        }
        Ok(())
    }

    /// Run a command and return the text printed before the next prompt.
    ///
    /// The echoed command line is removed and line endings are normalised.
    /// Raises [`Error::CommandTimeout`] when no prompt appears in time.
    pub fn run(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.drain()?;
        debug!("$ {command}");
        self.console.send_line(command)?;

        match self.console.expect(&self.prompts, timeout) {
            Ok(_) => {},
            Err(Error::Timeout(_)) => {
                return Err(Error::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                });
            },
            Err(e) => return Err(e),
        }

        let output = strip_echo(&clean_console_text(self.console.before()), command);
        trace!("{output}");
        Ok(output)
    }
}

impl<C: Console> CommandRunner for Shell<C> {
    fn run(&mut self, command: &str, timeout: Duration) -> Result<String> {
        Shell::run(self, command, timeout)
    }
}

/// Remove the terminal echo of `sent` from the start of `output`.
///
/// The echo may be broken over several lines when the terminal wraps long
/// commands. If `output` does not start with the echo it is returned as is.
pub(crate) fn strip_echo(output: &str, sent: &str) -> String {
    let text = output.trim_start_matches('\n');
    let rest = skip_wrapped_prefix(text, sent).unwrap_or(text);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.trim_end().to_string()
}

fn skip_wrapped_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let mut expected = prefix.chars().peekable();
    for (index, ch) in text.char_indices() {
        let Some(&want) = expected.peek() else {
            return Some(&text[index..]);
        };
        if ch == want {
            expected.next();
        } else if ch != '\n' {
            return None;
        }
    }
    expected.peek().is_none().then_some("")
}

/// Quote `text` as a single POSIX shell word.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

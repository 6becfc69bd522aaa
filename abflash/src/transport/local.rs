//! Runs commands on the machine running abflash.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;
use wait_timeout::ChildExt;

use crate::error::{Error, Result};
use crate::shell::CommandRunner;

/// Runs commands with `sh -c` locally, so the lab PC can be the relay host.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    shell: String,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl LocalRunner {
    /// Runner using `sh`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another POSIX shell binary.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

fn collect<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<String>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl CommandRunner for LocalRunner {
    fn run(&mut self, command: &str, timeout: Duration) -> Result<String> {
        debug!("[local] $ {command}");
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain both pipes while waiting so a chatty child cannot block.
        let stdout = collect(child.stdout.take());
        let stderr = collect(child.stderr.take());

        if child.wait_timeout(timeout)?.is_none() {
            kill(&mut child);
            return Err(Error::CommandTimeout {
                command: command.to_string(),
                timeout,
            });
        }

        let mut output = join(stdout);
        let errors = join(stderr);
        if !errors.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&errors);
        }
        Ok(output.trim_end().to_string())
    }
}

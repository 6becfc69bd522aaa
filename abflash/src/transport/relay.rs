//! Non-interactive SSH from a relay host.

use std::time::Duration;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::shell::{CommandRunner, shell_quote};
use crate::transport::SshTarget;

/// Default `ConnectTimeout` passed to `ssh`, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Exit status `ssh` uses for its own failures.
const SSH_FAILURE_STATUS: i32 = 255;

/// Marker printed after the remote command with its exit status.
const STATUS_MARKER: &str = "__ABFLASH_RC=";

/// Text echoed by the relay probe.
const PROBE_TOKEN: &str = "ABFLASH_RELAY_OK";

/// Runs `ssh` on a relay host in batch mode.
pub struct RelayExecutor {
    runner: Box<dyn CommandRunner>,
    name: String,
    connect_timeout_secs: u64,
}

impl RelayExecutor {
    /// Create a relay over any command runner; `name` is used in logs.
    pub fn new(runner: impl CommandRunner + 'static, name: impl Into<String>) -> Self {
        Self {
            runner: Box::new(runner),
            name: name.into(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    /// Set the SSH connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Name of the relay host.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full command line run on the relay host.
    pub fn ssh_command(&self, target: &SshTarget, remote_command: &str) -> String {
        format!(
            "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null \
             -o ConnectTimeout={} -o BatchMode=yes {} {}; echo \"{STATUS_MARKER}$?\"",
            self.connect_timeout_secs,
            target.destination(),
            shell_quote(remote_command)
        )
    }

    /// Run `remote_command` on `target` through the relay.
    ///
    /// Any failure of the relay itself, including `ssh` exiting with 255, is
    /// reported as [`Error::Relay`].
    pub fn execute(
        &mut self,
        target: &SshTarget,
        remote_command: &str,
        timeout: Duration,
    ) -> Result<String> {
        let (output, code) = self.execute_with_status(target, remote_command, timeout)?;
        if code != 0 {
            debug!("Remote command exited with status {code}");
        }
        Ok(output)
    }

    /// Like [`execute`](Self::execute), but also return the remote exit status.
    pub fn execute_with_status(
        &mut self,
        target: &SshTarget,
        remote_command: &str,
        timeout: Duration,
    ) -> Result<(String, i32)> {
        let command = self.ssh_command(target, remote_command);
        debug!("[{}] $ {command}", self.name);

        let raw = self
            .runner
            .run(&command, timeout)
            .map_err(|e| Error::Relay(format!("{} could not run ssh: {e}", self.name)))?;

        let (output, status) = split_status(&raw);
        match status {
            None => Err(Error::Relay(format!(
                "{} returned no exit status for ssh to {}",
                self.name,
                target.destination()
            ))),
            Some(SSH_FAILURE_STATUS) => Err(Error::Relay(format!(
                "ssh from {} to {} failed: {}",
                self.name,
                target.destination(),
                output.trim()
            ))),
            Some(code) => Ok((output, code)),
        }
    }

    /// Check that the relay can reach `target` at all.
    pub fn probe(&mut self, target: &SshTarget, timeout: Duration) -> Result<()> {
        let output = self.execute(target, &format!("echo {PROBE_TOKEN}"), timeout)?;
        if output.lines().any(|line| line.trim() == PROBE_TOKEN) {
            Ok(())
        } else {
            warn!("Unexpected relay probe output: {output}");
            Err(Error::Relay(format!(
                "probe through {} did not answer",
                self.name
            )))
        }
    }
}

/// Split the status marker line off the relay output.
fn split_status(raw: &str) -> (String, Option<i32>) {
    let mut status = None;
    let mut lines = Vec::new();
    for line in raw.lines() {
        match line.trim().strip_prefix(STATUS_MARKER) {
            Some(code) => status = code.parse().ok().or(status),
            None => lines.push(line),
        }
    }
    (lines.join("\n").trim_end().to_string(), status)
}

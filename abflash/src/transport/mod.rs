//! Running commands on the image host.
//!
//! Two transports exist:
//!
//! - [`RelayExecutor`]: a relay host (the lab PC, or a second console-attached
//!   machine) runs non-interactive `ssh` to the image host.
//! - [`ConsoleExecutor`]: the device itself runs `ssh` on its console and the
//!   host-key and password prompts are answered interactively.
//!
//! A flash session picks one of them when it starts and keeps it; see
//! [`Transport`].

pub mod interactive;
pub mod keys;
pub mod local;
pub mod relay;

use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::console::Console;
use crate::error::Result;

pub use interactive::{ConsoleExecutor, SshPrompt};
pub use local::LocalRunner;
pub use relay::RelayExecutor;

/// Image host reached over SSH.
#[derive(Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Host name or address.
    pub host: String,
    /// Login user.
    pub username: String,
    /// Password, when the host does not accept key authentication.
    pub password: Option<String>,
}

impl SshTarget {
    /// Create a target using key authentication.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: None,
        }
    }

    /// Set the password answered at password prompts.
    #[must_use]
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// `user@host` as passed to `ssh`.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

// Keep the password out of logs and error reports.
impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Which transport a flash session ended up using.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransportMode {
    /// Commands went through a relay host.
    Relay {
        /// Name of the relay host.
        host: String,
    },
    /// Commands were typed on the device console.
    InteractiveConsole,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay { host } => write!(f, "relay via {host}"),
            Self::InteractiveConsole => write!(f, "device console"),
        }
    }
}

/// Transport selected for one session.
pub enum Transport<'a, C: Console> {
    /// Non-interactive SSH from a relay host.
    Relay(&'a mut RelayExecutor),
    /// Interactive SSH on the device console.
    Console(ConsoleExecutor<'a, C>),
}

impl<C: Console> Transport<'_, C> {
    /// Run `remote_command` on `target` and return its output.
    pub fn execute(
        &mut self,
        target: &SshTarget,
        remote_command: &str,
        timeout: Duration,
    ) -> Result<String> {
        match self {
            Self::Relay(relay) => relay.execute(target, remote_command, timeout),
            Self::Console(console) => console.execute(target, remote_command, timeout),
        }
    }

    /// Run `remote_command` and return its output with the exit status, when
    /// the transport can report one.
    ///
    /// Only the relay sees the status; the interactive console yields `None`.
    pub fn execute_with_status(
        &mut self,
        target: &SshTarget,
        remote_command: &str,
        timeout: Duration,
    ) -> Result<(String, Option<i32>)> {
        match self {
            Self::Relay(relay) => relay
                .execute_with_status(target, remote_command, timeout)
                .map(|(output, code)| (output, Some(code))),
            Self::Console(console) => console
                .execute(target, remote_command, timeout)
                .map(|output| (output, None)),
        }
    }

    /// The mode this transport represents.
    pub fn mode(&self) -> TransportMode {
        match self {
            Self::Relay(relay) => TransportMode::Relay {
                host: relay.name().to_string(),
            },
            Self::Console(_) => TransportMode::InteractiveConsole,
        }
    }
}

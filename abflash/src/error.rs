//! Error types for abflash.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::flasher::FlashStep;
use crate::partition::PartitionId;

/// Result type for abflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for abflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, local processes).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Invalid console pattern.
    #[error("Invalid console pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// No expected pattern appeared on the console in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A shell command did not return to the prompt in time.
    #[error("Command `{command}` did not complete within {}s", .timeout.as_secs())]
    CommandTimeout {
        /// The command that was sent.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// One of the A/B partition device nodes is missing.
    #[error("A/B partition {0} not found on the device")]
    PartitionMissing(PartitionId),

    /// A candidate partition does not have the expected size.
    #[error(
        "Partition layout invalid: {partition} has {} sectors, expected {expected}",
        .actual.map_or_else(|| "no readable".to_string(), |n| n.to_string())
    )]
    LayoutInvalid {
        /// The offending partition.
        partition: PartitionId,
        /// Sector count read from the partition table, if any.
        actual: Option<u64>,
        /// Sector count every A/B partition must have.
        expected: u64,
    },

    /// The boot configuration names neither A/B partition.
    #[error("Unable to determine current boot partition from {path}: {content}")]
    BootConfigUnreadable {
        /// Path of the boot configuration file.
        path: String,
        /// What was read from it.
        content: String,
    },

    /// The target partition is mounted and could not be unmounted.
    #[error("Target partition {0} is mounted and could not be unmounted; reboot the device first")]
    TargetBusy(PartitionId),

    /// SSH asked for a password but none was configured.
    #[error("SSH to {0} requested a password but none was provided")]
    CredentialsRequired(String),

    /// SSH kept asking for a password after it was sent.
    #[error("SSH authentication to {0} was rejected")]
    AuthenticationFailed(String),

    /// The image host is not reachable from the device.
    #[error("Cannot reach image host {host}: {reason}")]
    HostUnreachable {
        /// Image host address.
        host: String,
        /// What went wrong.
        reason: String,
    },

    /// The image file does not exist on the image host.
    #[error("Image file not found on host: {0}")]
    ImageNotFound(String),

    /// The partition table listing of the image could not be interpreted.
    #[error("Unable to parse image {path}: {reason}")]
    UnparseableImage {
        /// Remote image path.
        path: String,
        /// What could not be parsed.
        reason: String,
    },

    /// The image payload does not fit into the target partition.
    #[error("Image partition too large: {sectors} sectors exceeds target capacity of {capacity} sectors")]
    ImageTooLarge {
        /// Payload size in sectors.
        sectors: u64,
        /// Target partition capacity in sectors.
        capacity: u64,
    },

    /// The transfer pipeline reported an error.
    #[error("Image transfer failed: {0}")]
    TransferFailed(String),

    /// The transfer pipeline did not finish in time.
    #[error("Image transfer timed out after {}s", .0.as_secs())]
    TransferTimedOut(Duration),

    /// The written partition does not contain a usable root filesystem.
    #[error("Flash verification failed: {0}")]
    VerificationFailed(String),

    /// The boot configuration does not reference the target after rewriting.
    #[error("Boot partition switch failed: {0}")]
    BootSwitchFailed(String),

    /// The device did not answer after reboot.
    #[error("Device did not become responsive within {}s after reboot", .0.as_secs())]
    RebootTimedOut(Duration),

    /// The relay host could not run the SSH command.
    #[error("Relay error: {0}")]
    Relay(String),

    /// SSH key provisioning on the device failed.
    #[error("SSH key provisioning failed: {0}")]
    KeyProvisioning(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A flash workflow step failed.
    #[error("Flash failed at step '{step}': {source}")]
    Step {
        /// The step that failed.
        step: FlashStep,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with the workflow step it occurred in.
    #[must_use]
    pub fn at_step(self, step: FlashStep) -> Self {
        Self::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through step wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// The step a wrapped error occurred in.
    pub fn step(&self) -> Option<FlashStep> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

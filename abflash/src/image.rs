//! Remote image detection and transfer.
//!
//! An image on the image host is either a raw filesystem image, copied as is,
//! or a full disk image with a partition table, from which only the Linux
//! root partition is extracted. The transfer is a single pipeline typed on
//! the device console:
//!
//! ```text
//! ssh user@host 'cat <image>'                                   | dd of=<node> bs=4M
//! ssh user@host 'dd if=<image> bs=512 skip=<start> count=<n>'   | dd of=<node> bs=4M
//! ```

use std::time::Duration;

use log::{debug, info};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::console::Console;
use crate::error::{Error, Result};
use crate::partition::{PartitionId, SECTOR_SIZE, numeric_tokens};
use crate::shell::{Shell, shell_quote};
use crate::transport::{SshTarget, Transport, interactive};

/// Default timeout of the transfer pipeline.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

/// Marker fdisk prints for images carrying a partition table.
const DISKLABEL_MARKER: &str = "Disklabel type:";

/// Output fragments that mean the pipeline failed.
const ERROR_MARKERS: [&str; 10] = [
    "error",
    "failed",
    "cannot",
    "no such file",
    "permission denied",
    "connection refused",
    "no route to host",
    "connection timed out",
    "could not resolve hostname",
    "connection closed",
];

/// Output fragments that mean fdisk could not read the image.
const FDISK_ERROR_MARKERS: [&str; 4] = ["error", "not found", "cannot open", "no such file"];

/// What dd prints when its input was empty.
const EMPTY_INPUT: &str = "0+0 records in";

/// Layout of an image on the image host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ImageKind {
    /// Raw root filesystem image.
    Raw,
    /// Disk image; the root filesystem occupies the given sector range.
    Partitioned {
        /// First sector of the Linux partition.
        start_sector: u64,
        /// Last sector of the Linux partition.
        end_sector: u64,
        /// Number of sectors to copy.
        sector_count: u64,
    },
}

/// Image to flash.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ImageDescriptor {
    /// Absolute path on the image host.
    pub path: String,
    /// Detected layout.
    pub kind: ImageKind,
}

impl ImageDescriptor {
    /// Interpret `fdisk -l <image>` output.
    ///
    /// `capacity` is the target partition size in sectors; a partitioned
    /// image whose Linux partition exceeds it is rejected.
    pub fn from_fdisk(path: &str, listing: &str, capacity: u64) -> Result<Self> {
        let unparseable = |reason: String| Error::UnparseableImage {
            path: path.to_string(),
            reason,
        };

        if listing.trim().is_empty() {
            return Err(unparseable("fdisk printed nothing".to_string()));
        }
        // The path itself may contain a marker word.
        let lower = listing.replace(path, "").to_lowercase();
        if FDISK_ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
            return Err(unparseable(listing.trim().to_string()));
        }

        if !listing.contains(DISKLABEL_MARKER) {
            let header = format!("Disk {path}:");
            if !listing.lines().any(|line| line.trim_start().starts_with(&header)) {
                return Err(unparseable(format!(
                    "no disk header in fdisk output: {}",
                    listing.trim()
                )));
            }
            return Ok(Self {
                path: path.to_string(),
                kind: ImageKind::Raw,
            });
        }

        let line = listing
            .lines()
            .find(|line| is_linux_partition(line))
            .ok_or_else(|| Error::UnparseableImage {
                path: path.to_string(),
                reason: "no Linux partition in partition table".to_string(),
            })?;

        let numbers: Vec<u64> = numeric_tokens(line).take(3).collect();
        let [start_sector, end_sector, sector_count] = numbers[..] else {
            return Err(Error::UnparseableImage {
                path: path.to_string(),
                reason: format!("cannot read sector range from '{}'", line.trim()),
            });
        };

        let image = Self {
            path: path.to_string(),
            kind: ImageKind::Partitioned {
                start_sector,
                end_sector,
                sector_count,
            },
        };
        image.check_capacity(capacity)?;
        Ok(image)
    }

    /// Sectors written to the target, when known before the transfer.
    pub fn payload_sectors(&self) -> Option<u64> {
        match self.kind {
            ImageKind::Raw => None,
            ImageKind::Partitioned { sector_count, .. } => Some(sector_count),
        }
    }

    /// Reject payloads larger than `capacity` sectors.
    pub fn check_capacity(&self, capacity: u64) -> Result<()> {
        match self.payload_sectors() {
            Some(sectors) if sectors > capacity => Err(Error::ImageTooLarge { sectors, capacity }),
            _ => Ok(()),
        }
    }

    /// Pipeline that streams the payload into `node`.
    pub fn transfer_command(&self, target: &SshTarget, node: &str) -> String {
        let path = quote_path(&self.path);
        let remote = match self.kind {
            ImageKind::Raw => format!("cat {path}"),
            ImageKind::Partitioned {
                start_sector,
                sector_count,
                ..
            } => format!(
                "dd if={path} bs={SECTOR_SIZE} skip={start_sector} count={sector_count}"
            ),
        };
        format!(
            "ssh {} {} | dd of={node} bs=4M",
            target.destination(),
            shell_quote(&remote)
        )
    }
}

fn is_linux_partition(line: &str) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    tokens.windows(2).any(|pair| pair == ["83", "Linux"]) || line.contains("Linux filesystem")
}

/// Quote a path for a remote shell only when it needs it.
pub(crate) fn quote_path(path: &str) -> String {
    let plain = !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:@%,=".contains(c));
    if plain {
        path.to_string()
    } else {
        shell_quote(path)
    }
}

/// Detect whether `path` on the image host is raw or partitioned.
pub fn detect_type<C: Console>(
    transport: &mut Transport<'_, C>,
    target: &SshTarget,
    path: &str,
    capacity: u64,
    timeout: Duration,
) -> Result<ImageDescriptor> {
    let (listing, status) = transport.execute_with_status(
        target,
        &format!("fdisk -l {} 2>&1", quote_path(path)),
        timeout,
    )?;
    if let Some(code) = status.filter(|&code| code != 0) {
        return Err(Error::UnparseableImage {
            path: path.to_string(),
            reason: format!("fdisk exited with status {code}: {}", listing.trim()),
        });
    }
    let image = ImageDescriptor::from_fdisk(path, &listing, capacity)?;
    match image.kind {
        ImageKind::Raw => info!("Image type: raw filesystem"),
        ImageKind::Partitioned {
            start_sector,
            end_sector,
            sector_count,
        } => info!(
            "Image type: partitioned, root filesystem at sectors {start_sector}-{end_sector} ({sector_count} sectors)"
        ),
    }
    Ok(image)
}

/// Describe why the pipeline failed, if it did.
///
/// Error lines win over dd statistics; an empty input to dd is a failure
/// even without one, since nothing reached the target.
fn find_error(output: &str) -> Option<String> {
    let error = output.lines().find(|line| {
        let lower = line.to_lowercase();
        let statistics = lower.contains("records in")
            || lower.contains("records out")
            || (lower.contains("bytes") && lower.contains("copied"));
        !statistics && ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
    });
    if let Some(line) = error {
        return Some(line.trim().to_string());
    }
    output
        .lines()
        .any(|line| line.trim_start().starts_with(EMPTY_INPUT))
        .then(|| format!("no data received from the image host ({EMPTY_INPUT})"))
}

/// Stream `image` from the image host into `partition`.
///
/// The pipeline runs on the device console. `capacity` is checked again
/// before anything is written. When `timeout` elapses the pipeline is
/// interrupted with Ctrl-C and [`Error::TransferTimedOut`] is returned.
pub fn transfer<C: Console>(
    shell: &mut Shell<C>,
    target: &SshTarget,
    image: &ImageDescriptor,
    partition: PartitionId,
    capacity: u64,
    timeout: Duration,
) -> Result<()> {
    image.check_capacity(capacity)?;

    let command = image.transfer_command(target, partition.device_node());
    info!(
        "Writing {} to {partition} (timeout {}s)",
        image.path,
        timeout.as_secs()
    );

    let output = match interactive::drive(shell, target, &command, timeout) {
        Ok(output) => output,
        Err(Error::CommandTimeout { .. }) => {
            interactive::abort(shell);
            return Err(Error::TransferTimedOut(timeout));
        },
        Err(e @ (Error::CredentialsRequired(_) | Error::AuthenticationFailed(_))) => {
            return Err(Error::TransferFailed(e.to_string()));
        },
        Err(e) => return Err(e),
    };
    debug!("Transfer output: {output}");

    if let Some(reason) = find_error(&output) {
        return Err(Error::TransferFailed(reason));
    }
    info!("Transfer to {partition} complete");
    Ok(())
}

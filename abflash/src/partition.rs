//! A/B partition discovery and checks.
//!
//! The device boots from either `/dev/mmcblk0p2` or `/dev/mmcblk0p3`; the
//! root named in `/boot/cmdline.txt` is the active one and the other is the
//! flash target. Both must be exactly 1 GiB.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::shell::CommandRunner;

/// Kernel command line holding the root partition.
pub const BOOT_CONFIG_PATH: &str = "/boot/cmdline.txt";

/// Block device carrying both partitions.
pub const STORAGE_DEVICE: &str = "/dev/mmcblk0";

/// Size every A/B partition must have, in sectors (1 GiB).
pub const EXPECTED_SECTORS: u64 = 2_097_152;

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// One of the two alternating root partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PartitionId {
    /// `/dev/mmcblk0p2`
    P2,
    /// `/dev/mmcblk0p3`
    P3,
}

impl PartitionId {
    /// Both partitions, in lookup order.
    pub const ALL: [PartitionId; 2] = [PartitionId::P2, PartitionId::P3];

    /// Kernel name, e.g. `mmcblk0p2`.
    pub fn device_name(self) -> &'static str {
        match self {
            Self::P2 => "mmcblk0p2",
            Self::P3 => "mmcblk0p3",
        }
    }

    /// Device node, e.g. `/dev/mmcblk0p2`.
    pub fn device_node(self) -> &'static str {
        match self {
            Self::P2 => "/dev/mmcblk0p2",
            Self::P3 => "/dev/mmcblk0p3",
        }
    }

    /// The other member of the pair.
    pub fn other(self) -> Self {
        match self {
            Self::P2 => Self::P3,
            Self::P3 => Self::P2,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.device_name())
    }
}

/// Sector counts of both partitions as read from the partition table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PartitionLayout {
    /// Sectors of `mmcblk0p2`, if listed.
    pub p2_sectors: Option<u64>,
    /// Sectors of `mmcblk0p3`, if listed.
    pub p3_sectors: Option<u64>,
}

impl PartitionLayout {
    /// Parse `fdisk -l /dev/mmcblk0` output.
    ///
    /// For each partition the line starting with its device node is used and
    /// the third purely numeric token is the sector count (start, end, count).
    pub fn parse(fdisk_output: &str) -> Self {
        Self {
            p2_sectors: sector_count(fdisk_output, PartitionId::P2),
            p3_sectors: sector_count(fdisk_output, PartitionId::P3),
        }
    }

    /// Sector count of `partition`.
    pub fn sectors(&self, partition: PartitionId) -> Option<u64> {
        match partition {
            PartitionId::P2 => self.p2_sectors,
            PartitionId::P3 => self.p3_sectors,
        }
    }

    /// Require both partitions to have [`EXPECTED_SECTORS`].
    pub fn validate(&self) -> Result<()> {
        for partition in PartitionId::ALL {
            let actual = self.sectors(partition);
            if actual != Some(EXPECTED_SECTORS) {
                return Err(Error::LayoutInvalid {
                    partition,
                    actual,
                    expected: EXPECTED_SECTORS,
                });
            }
        }
        Ok(())
    }
}

fn sector_count(fdisk_output: &str, partition: PartitionId) -> Option<u64> {
    fdisk_output
        .lines()
        .find(|line| line.split_whitespace().next() == Some(partition.device_node()))
        .and_then(|line| numeric_tokens(line).nth(2))
}

/// Purely numeric whitespace-separated tokens of `line`.
pub(crate) fn numeric_tokens(line: &str) -> impl Iterator<Item = u64> + '_ {
    line.split_whitespace()
        .filter(|token| token.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|token| token.parse().ok())
}

/// Decide `(current, target)` from the boot configuration text.
///
/// `mmcblk0p2` is checked first, so the result is deterministic even for a
/// line naming both.
pub fn select_from_boot_config(content: &str) -> Option<(PartitionId, PartitionId)> {
    PartitionId::ALL
        .into_iter()
        .find(|p| content.contains(p.device_name()))
        .map(|current| (current, current.other()))
}

/// Whether `partition` appears as a mounted source in `mount` output.
pub fn is_mounted(mount_output: &str, partition: PartitionId) -> bool {
    mount_output
        .lines()
        .any(|line| line.split_whitespace().next() == Some(partition.device_node()))
}

/// Inspects the partitions over the device shell.
pub struct PartitionInspector<'a, R: CommandRunner> {
    runner: &'a mut R,
    timeout: Duration,
}

impl<'a, R: CommandRunner> PartitionInspector<'a, R> {
    /// Inspect through `runner`, allowing `timeout` per command.
    pub fn new(runner: &'a mut R, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Require both A/B device nodes to exist.
    pub fn verify_ab_partitions(&mut self) -> Result<()> {
        let listing = self
            .runner
            .run(&format!("ls -l {STORAGE_DEVICE}p* 2>&1"), self.timeout)?;

        for partition in PartitionId::ALL {
            let present = listing
                .split_whitespace()
                .any(|token| token == partition.device_node());
            if !present {
                return Err(Error::PartitionMissing(partition));
            }
        }
        debug!("Found {} and {}", PartitionId::P2, PartitionId::P3);
        Ok(())
    }

    /// Read the partition table without validating it.
    pub fn read_layout(&mut self) -> Result<PartitionLayout> {
        let output = self
            .runner
            .run(&format!("fdisk -l {STORAGE_DEVICE}"), self.timeout)?;
        Ok(PartitionLayout::parse(&output))
    }

    /// Read the partition table and require the expected sizes.
    pub fn verify_layout(&mut self) -> Result<PartitionLayout> {
        let layout = self.read_layout()?;
        layout.validate()?;
        info!("Partition layout OK: both partitions have {EXPECTED_SECTORS} sectors");
        Ok(layout)
    }

    /// Determine `(current, target)` from the boot configuration.
    pub fn current_and_target(&mut self) -> Result<(PartitionId, PartitionId)> {
        let content = self
            .runner
            .run(&format!("cat {BOOT_CONFIG_PATH}"), self.timeout)?;

        let (current, target) =
            select_from_boot_config(&content).ok_or_else(|| Error::BootConfigUnreadable {
                path: BOOT_CONFIG_PATH.to_string(),
                content: content.trim().to_string(),
            })?;
        info!("Current boot partition: {current}, target: {target}");
        Ok((current, target))
    }

    /// Whether `partition` is currently mounted.
    pub fn is_mounted(&mut self, partition: PartitionId) -> Result<bool> {
        let mounts = self.runner.run("mount", self.timeout)?;
        Ok(is_mounted(&mounts, partition))
    }

    /// Make sure `target` is not mounted, unmounting it once if needed.
    pub fn verify_target_not_mounted(&mut self, target: PartitionId) -> Result<()> {
        if !self.is_mounted(target)? {
            return Ok(());
        }

        warn!("{target} is mounted, trying to unmount it");
        let out = self
            .runner
            .run(&format!("umount {} 2>&1", target.device_node()), self.timeout)?;
        if !out.is_empty() {
            debug!("umount: {out}");
        }

        if self.is_mounted(target)? {
            return Err(Error::TargetBusy(target));
        }
        info!("Unmounted {target}");
        Ok(())
    }
}

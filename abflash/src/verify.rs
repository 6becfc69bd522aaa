//! Post-write check of the flashed partition.

use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::partition::PartitionId;
use crate::shell::CommandRunner;

/// Scratch mount point for the check.
pub const VERIFY_MOUNT_POINT: &str = "/mnt/flash_verify";

/// Directories a usable root filesystem must contain.
const REQUIRED_DIRS: [&str; 2] = ["bin", "etc"];

/// Mount `partition` and make sure it holds a root filesystem.
///
/// Returns the content of `version.txt` on the new filesystem, if any. The
/// scratch mount point is unmounted and removed whatever the outcome.
pub fn verify_flash<R: CommandRunner>(
    runner: &mut R,
    partition: PartitionId,
    timeout: Duration,
) -> Result<Option<String>> {
    info!("Verifying {partition}...");
    runner.run(&format!("mkdir -p {VERIFY_MOUNT_POINT}"), timeout)?;

    let result = check(runner, partition, timeout);
    cleanup(runner, timeout);

    if let Ok(version) = &result {
        match version {
            Some(v) => info!("Flash verified, image version: {v}"),
            None => info!("Flash verified"),
        }
    }
    result
}

fn check<R: CommandRunner>(
    runner: &mut R,
    partition: PartitionId,
    timeout: Duration,
) -> Result<Option<String>> {
    let node = partition.device_node();
    let out = runner.run(&format!("mount {node} {VERIFY_MOUNT_POINT} 2>&1"), timeout)?;
    if !out.trim().is_empty() {
        return Err(Error::VerificationFailed(format!(
            "cannot mount {node}: {}",
            out.trim()
        )));
    }

    let paths: Vec<String> = REQUIRED_DIRS
        .iter()
        .map(|dir| format!("{VERIFY_MOUNT_POINT}/{dir}"))
        .collect();
    let listing = runner.run(&format!("ls -d {} 2>&1", paths.join(" ")), timeout)?;

    let missing: Vec<&str> = REQUIRED_DIRS
        .iter()
        .zip(&paths)
        .filter(|(_, path)| !listing.lines().any(|line| line.trim() == path.as_str()))
        .map(|(dir, _)| *dir)
        .collect();
    if !missing.is_empty() {
        return Err(Error::VerificationFailed(format!(
            "{node} has no root filesystem (missing /{})",
            missing.join(", /")
        )));
    }

    let version = runner.run(
        &format!("cat {VERIFY_MOUNT_POINT}/version.txt 2>/dev/null"),
        timeout,
    )?;
    let version = version.trim();
    Ok((!version.is_empty()).then(|| version.to_string()))
}

fn cleanup<R: CommandRunner>(runner: &mut R, timeout: Duration) {
    for command in [
        format!("umount {VERIFY_MOUNT_POINT} 2>&1"),
        format!("rmdir {VERIFY_MOUNT_POINT} 2>&1"),
    ] {
        match runner.run(&command, timeout) {
            Ok(out) if out.trim().is_empty() => {},
            Ok(out) => debug!("{command}: {}", out.trim()),
            Err(e) => warn!("Cleanup `{command}` failed: {e}"),
        }
    }
}

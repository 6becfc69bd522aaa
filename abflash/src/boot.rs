//! Boot partition switch: the commit point of a flash.

use std::time::Duration;

use log::info;

use crate::error::{Error, Result};
use crate::partition::{BOOT_CONFIG_PATH, PartitionId};
use crate::shell::CommandRunner;

/// Point the boot configuration at `target` instead of `current`.
///
/// Must only be called once the target has been verified.
pub fn switch_boot<R: CommandRunner>(
    runner: &mut R,
    current: PartitionId,
    target: PartitionId,
    timeout: Duration,
) -> Result<()> {
    info!("Switching boot partition from {current} to {target}");

    let out = runner.run(
        &format!(
            "sed -i 's/{}/{}/g' {BOOT_CONFIG_PATH} 2>&1",
            current.device_name(),
            target.device_name()
        ),
        timeout,
    )?;
    if !out.trim().is_empty() {
        return Err(Error::BootSwitchFailed(out.trim().to_string()));
    }

    let content = runner.run(&format!("cat {BOOT_CONFIG_PATH}"), timeout)?;
    if !content.contains(target.device_name()) {
        return Err(Error::BootSwitchFailed(format!(
            "{BOOT_CONFIG_PATH} does not reference {target}: {}",
            content.trim()
        )));
    }

    info!("Boot configuration now points at {target}");
    Ok(())
}

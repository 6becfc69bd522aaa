//! Device status command implementation.

use abflash::{AbFlasher, DeviceStatus, EXPECTED_SECTORS, PartitionId, SECTOR_SIZE};
use anyhow::Result;
use console::style;

use crate::Cli;
use crate::commands::flash::open_device_shell;
use crate::config::Config;

/// Status command implementation.
pub(crate) fn cmd_status(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let shell = open_device_shell(cli, config)?;
    let mut flasher = AbFlasher::new(shell).with_options(config.flash_options());
    let status = flasher.status()?;

    if json {
        println!("{}", status_json(&status)?);
    } else {
        print!("{}", render_status(&status));
    }
    Ok(())
}

fn status_json(status: &DeviceStatus) -> Result<String> {
    let output = serde_json::json!({
        "ok": true,
        "data": status,
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

fn format_size(sectors: Option<u64>) -> String {
    match sectors {
        Some(n) => {
            let mib = n * SECTOR_SIZE / (1024 * 1024);
            let mark = if n == EXPECTED_SECTORS {
                style("✓").green()
            } else {
                style("✗").red()
            };
            format!("{n} sectors ({mib} MiB) {mark}")
        },
        None => style("not listed").red().to_string(),
    }
}

fn render_status(status: &DeviceStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", style("A/B partitions").bold().underlined()));
    for partition in PartitionId::ALL {
        let role = if partition == status.current {
            style("booted").green().to_string()
        } else {
            let mounted = if status.target_mounted {
                style(" (mounted)").yellow().to_string()
            } else {
                String::new()
            };
            format!("{}{mounted}", style("next flash").cyan())
        };
        out.push_str(&format!(
            "  {:<16} {:<12} {}\n",
            partition.device_node(),
            role,
            format_size(status.layout.sectors(partition))
        ));
    }
    if !status.layout_valid {
        out.push_str(&format!(
            "{} Partition layout is not usable for A/B flashing (expected {EXPECTED_SECTORS} sectors each)\n",
            style("⚠").yellow()
        ));
    }
    out
}

//! # abflash
//!
//! A library for flashing embedded Linux devices that boot from one of two
//! alternating root partitions (A/B scheme).
//!
//! The device keeps running from its active partition while the inactive one
//! is overwritten, verified and only then made the boot partition, so a
//! failed or partial update never leaves the device unbootable. Everything
//! happens over the device's serial console:
//!
//! - Partition discovery and layout checks (`/dev/mmcblk0p2`, `/dev/mmcblk0p3`)
//! - Image host access by interactive SSH on the device, or through a relay
//! - Raw and partitioned image detection and streamed transfer
//! - Post-write verification, boot switch and reboot supervision
//!
//! ## Features
//!
//! - `native` (default): serial console support via the `serialport` crate
//! - `serde`: Serialization support for reports and status types
//!
//! ## Example
//!
//! ```rust,no_run
//! use abflash::{AbFlasher, FlashRequest, LocalRunner, NativePort, RelayExecutor, SerialConsole, Shell};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!     let shell = Shell::new(SerialConsole::new(port))?;
//!
//!     // Check the image host from this machine; the device console is the
//!     // fallback when that does not work.
//!     let relay = RelayExecutor::new(LocalRunner::new(), "localhost");
//!     let mut flasher = AbFlasher::new(shell).with_relay(relay);
//!
//!     let status = flasher.status()?;
//!     println!("Booting from {}, next flash goes to {}", status.current, status.target);
//!
//!     flasher.flash_with_progress(&FlashRequest::new("rpi4.img", "192.168.1.10"), |step| {
//!         println!("{step}...");
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod boot;
pub mod console;
pub mod error;
pub mod flasher;
pub mod image;
pub mod partition;
pub mod port;
pub mod reboot;
pub mod shell;
pub mod transport;
pub mod verify;

#[cfg(test)]
mod testing;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    console::{Console, SerialConsole, clean_console_text, drain_utf8_lossy},
    error::{Error, Result},
    flasher::{AbFlasher, DeviceStatus, FlashOptions, FlashReport, FlashRequest, FlashStep},
    image::{ImageDescriptor, ImageKind},
    partition::{
        BOOT_CONFIG_PATH, EXPECTED_SECTORS, PartitionId, PartitionInspector, PartitionLayout,
        SECTOR_SIZE, STORAGE_DEVICE,
    },
    port::{Port, SerialConfig},
    reboot::{RebootPolicy, RebootState, RebootSupervisor},
    shell::{CommandRunner, DEFAULT_PROMPT, Shell},
    transport::{
        ConsoleExecutor, LocalRunner, RelayExecutor, SshPrompt, SshTarget, Transport,
        TransportMode,
    },
    verify::VERIFY_MOUNT_POINT,
};

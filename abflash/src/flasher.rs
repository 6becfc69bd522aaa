//! A/B flash orchestration.
//!
//! [`AbFlasher`] runs the whole update as one linear sequence of
//! [`FlashStep`]s over the device shell. The first failing step aborts the
//! rest and its error is wrapped in [`Error::Step`]. The boot configuration
//! is only touched after the written partition has been verified, so a
//! failed update leaves the device booting the old image.
//!
//! ## Example
//!
//! ```rust,no_run
//! use abflash::{AbFlasher, FlashRequest, NativePort, SerialConsole, Shell};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!     let shell = Shell::new(SerialConsole::new(port))?;
//!
//!     let mut flasher = AbFlasher::new(shell);
//!     let request = FlashRequest::new("rpi4-rootfs.img", "192.168.1.10")
//!         .with_password(Some("secret".to_string()));
//!     flasher.flash(&request)?;
//!
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::boot::switch_boot;
use crate::console::Console;
use crate::error::{Error, Result};
use crate::image::{self, DEFAULT_TRANSFER_TIMEOUT, ImageDescriptor, quote_path};
use crate::partition::{EXPECTED_SECTORS, PartitionId, PartitionInspector, PartitionLayout};
use crate::reboot::{RebootPolicy, RebootSupervisor};
use crate::shell::{DEFAULT_COMMAND_TIMEOUT, Shell};
use crate::transport::{
    ConsoleExecutor, RelayExecutor, SshTarget, Transport, TransportMode, keys,
};
use crate::verify::verify_flash;

/// Token echoed to prove SSH access to the image host.
const SSH_OK_TOKEN: &str = "ABFLASH_SSH_OK";

/// Steps of a flash, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FlashStep {
    /// Both A/B device nodes exist.
    VerifyPartitions,
    /// Both partitions have the expected size.
    VerifyLayout,
    /// Current and target partition read from the boot configuration.
    SelectTarget,
    /// The target is not mounted.
    CheckTargetUnmounted,
    /// Transport chosen, image host and image reachable.
    EstablishTransport,
    /// Raw or partitioned image.
    DetectImage,
    /// Image streamed into the target.
    TransferImage,
    /// Target mounted and checked.
    VerifyFlash,
    /// Boot configuration points at the target.
    SwitchBoot,
    /// Device rebooted into the new image.
    Reboot,
}

impl FlashStep {
    /// All steps in execution order.
    pub const ALL: [FlashStep; 10] = [
        FlashStep::VerifyPartitions,
        FlashStep::VerifyLayout,
        FlashStep::SelectTarget,
        FlashStep::CheckTargetUnmounted,
        FlashStep::EstablishTransport,
        FlashStep::DetectImage,
        FlashStep::TransferImage,
        FlashStep::VerifyFlash,
        FlashStep::SwitchBoot,
        FlashStep::Reboot,
    ];

    /// Human readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::VerifyPartitions => "verify A/B partitions",
            Self::VerifyLayout => "verify partition layout",
            Self::SelectTarget => "select target partition",
            Self::CheckTargetUnmounted => "check target is unmounted",
            Self::EstablishTransport => "establish transport",
            Self::DetectImage => "detect image type",
            Self::TransferImage => "transfer image",
            Self::VerifyFlash => "verify flash",
            Self::SwitchBoot => "switch boot partition",
            Self::Reboot => "reboot",
        }
    }

    /// 1-based position in [`FlashStep::ALL`].
    pub fn number(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).map_or(0, |i| i + 1)
    }
}

impl fmt::Display for FlashStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// What to flash and where to get it from.
#[derive(Clone)]
pub struct FlashRequest {
    /// Image path, absolute or relative to `base_path`.
    pub image: String,
    /// Image host.
    pub host: String,
    /// Login on the image host.
    pub username: String,
    /// Password on the image host.
    pub password: Option<String>,
    /// Directory relative image paths are resolved against.
    pub base_path: String,
}

impl FlashRequest {
    /// Request `image` from `host` as `root`, relative to `/tmp`.
    pub fn new(image: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            host: host.into(),
            username: "root".to_string(),
            password: None,
            base_path: "/tmp".to_string(),
        }
    }

    /// Set the login user.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the password.
    #[must_use]
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Set the base directory for relative image paths.
    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Absolute image path on the image host.
    pub fn image_path(&self) -> String {
        if self.image.starts_with('/') {
            self.image.clone()
        } else {
            format!("{}/{}", self.base_path.trim_end_matches('/'), self.image)
        }
    }

    /// SSH target of the image host.
    pub fn ssh_target(&self) -> SshTarget {
        SshTarget::new(&self.host, &self.username).with_password(self.password.clone())
    }
}

impl fmt::Debug for FlashRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashRequest")
            .field("image", &self.image)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("base_path", &self.base_path)
            .finish()
    }
}

/// Tunables of a flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashOptions {
    /// Timeout of inspection commands on the device.
    pub command_timeout: Duration,
    /// Timeout of commands run on the image host.
    pub ssh_timeout: Duration,
    /// Timeout of the whole transfer pipeline.
    pub transfer_timeout: Duration,
    /// Install the device's SSH key on the image host first.
    pub provision_keys: bool,
    /// Reboot wait.
    pub reboot: RebootPolicy,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            ssh_timeout: Duration::from_secs(30),
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            provision_keys: false,
            reboot: RebootPolicy::default(),
        }
    }
}

/// Outcome of a successful flash.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlashReport {
    /// Partition the device booted from before.
    pub previous: PartitionId,
    /// Partition now holding the new image.
    pub flashed: PartitionId,
    /// The image that was written.
    pub image: ImageDescriptor,
    /// How the image host was reached.
    pub transport: TransportMode,
    /// Content of `version.txt` in the new image.
    pub version: Option<String>,
}

/// Read-only view of the device's A/B state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceStatus {
    /// Partition the device boots from.
    pub current: PartitionId,
    /// Partition the next flash would write.
    pub target: PartitionId,
    /// Partition sizes.
    pub layout: PartitionLayout,
    /// Whether the layout is usable for A/B flashing.
    pub layout_valid: bool,
    /// Whether the target is mounted.
    pub target_mounted: bool,
}

/// State of one `flash()` call: the shell, the transport and the image host.
struct FlashSession<'a, C: Console> {
    shell: &'a mut Shell<C>,
    relay: Option<&'a mut RelayExecutor>,
    target: SshTarget,
    options: &'a FlashOptions,
}

impl<C: Console> FlashSession<'_, C> {
    fn transport(&mut self) -> Transport<'_, C> {
        match self.relay.as_deref_mut() {
            Some(relay) => Transport::Relay(relay),
            None => Transport::Console(ConsoleExecutor::new(self.shell)),
        }
    }

    fn mode(&mut self) -> TransportMode {
        self.transport().mode()
    }

    fn remote(&mut self, command: &str) -> Result<String> {
        let target = self.target.clone();
        let timeout = self.options.ssh_timeout;
        self.transport().execute(&target, command, timeout)
    }

    /// Pick the transport and make sure the image is reachable.
    fn establish(&mut self, image_path: &str) -> Result<TransportMode> {
        if let Some(relay) = self.relay.as_deref_mut() {
            match relay.probe(&self.target, self.options.ssh_timeout) {
                Ok(()) => info!("Using relay {}", relay.name()),
                Err(e) => {
                    warn!("Relay unavailable ({e}), falling back to the device console");
                    self.relay = None;
                },
            }
        }
        let mode = self.mode();
        info!("Transport: {mode}");

        if self.options.provision_keys {
            keys::provision_keys(self.shell, &self.target, self.options.ssh_timeout)?;
        }

        self.check_ping()?;
        self.check_ssh()?;
        self.check_image(image_path)?;
        Ok(mode)
    }

    /// The device must reach the image host, since the transfer runs there.
    fn check_ping(&mut self) -> Result<()> {
        let host = self.target.host.clone();
        let unreachable = |reason: String| Error::HostUnreachable {
            host: host.clone(),
            reason,
        };

        let out = match self.shell.run(
            &format!("ping -c 3 -W 2 {} 2>&1", quote_path(&host)),
            self.options.command_timeout,
        ) {
            Ok(out) => out,
            Err(Error::CommandTimeout { .. }) => return Err(unreachable("ping timed out".into())),
            Err(e) => return Err(e),
        };

        let lower = out.to_lowercase();
        let failed = [
            " 0 received",
            " 0 packets received",
            "100% packet loss",
            "bad address",
            "unknown host",
        ]
        .iter()
        .any(|marker| lower.contains(marker));
        if failed {
            let summary = out.lines().last().unwrap_or_default().trim().to_string();
            return Err(unreachable(summary));
        }
        info!("Image host {host} is reachable");
        Ok(())
    }

    /// SSH must work from wherever commands run and from the device, which
    /// always runs the transfer.
    fn check_ssh(&mut self) -> Result<()> {
        let target = self.target.clone();
        let timeout = self.options.ssh_timeout;
        let relayed = self.relay.is_some();

        ssh_echo(&mut self.transport(), &target, timeout)?;
        if relayed {
            debug!("Checking SSH from the device console as well");
            ssh_echo(
                &mut Transport::Console(ConsoleExecutor::new(self.shell)),
                &target,
                timeout,
            )?;
        }
        info!("SSH access to {} OK", target.destination());
        Ok(())
    }

    fn check_image(&mut self, image_path: &str) -> Result<()> {
        let path = quote_path(image_path);
        let out = self.remote(&format!(
            "test -f {path} && echo FILE_EXISTS || echo FILE_NOT_FOUND"
        ))?;
        if !out.lines().any(|l| l.trim() == "FILE_EXISTS") {
            return Err(Error::ImageNotFound(image_path.to_string()));
        }

        match self.remote(&format!("ls -lh {path}")) {
            Ok(listing) => info!("Image found: {}", listing.trim()),
            Err(e) => warn!("Could not list image: {e}"),
        }
        Ok(())
    }

    fn detect_image(&mut self, image_path: &str, capacity: u64) -> Result<ImageDescriptor> {
        let target = self.target.clone();
        let timeout = self.options.ssh_timeout;
        image::detect_type(&mut self.transport(), &target, image_path, capacity, timeout)
    }

    fn transfer(
        &mut self,
        image: &ImageDescriptor,
        partition: PartitionId,
        capacity: u64,
    ) -> Result<()> {
        image::transfer(
            self.shell,
            &self.target,
            image,
            partition,
            capacity,
            self.options.transfer_timeout,
        )
    }
}

/// Run a trivial remote command and require its answer.
fn ssh_echo<C: Console>(
    transport: &mut Transport<'_, C>,
    target: &SshTarget,
    timeout: Duration,
) -> Result<()> {
    let unreachable = |reason: String| Error::HostUnreachable {
        host: target.host.clone(),
        reason,
    };
    let out = match transport.execute(target, &format!("echo {SSH_OK_TOKEN}"), timeout) {
        Ok(out) => out,
        Err(Error::CommandTimeout { .. }) => return Err(unreachable("SSH did not answer".into())),
        Err(Error::Relay(reason)) => return Err(unreachable(reason)),
        Err(e) => return Err(e),
    };

    if out.lines().any(|l| l.trim() == SSH_OK_TOKEN) {
        Ok(())
    } else {
        Err(unreachable(
            out.lines().last().unwrap_or_default().trim().to_string(),
        ))
    }
}

/// Run `f` as `step`: report it, then wrap any error with the step.
fn run_step<T>(
    step: FlashStep,
    progress: &mut impl FnMut(FlashStep),
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    progress(step);
    info!("[{}/{}] {step}", step.number(), FlashStep::ALL.len());
    f().map_err(|e| e.at_step(step))
}

/// A/B flasher driving a device over its shell.
pub struct AbFlasher<C: Console> {
    shell: Shell<C>,
    relay: Option<RelayExecutor>,
    options: FlashOptions,
}

impl<C: Console> AbFlasher<C> {
    /// Create a flasher on the device shell.
    pub fn new(shell: Shell<C>) -> Self {
        Self {
            shell,
            relay: None,
            options: FlashOptions::default(),
        }
    }

    /// Reach the image host through `relay` when possible.
    #[must_use]
    pub fn with_relay(mut self, relay: RelayExecutor) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Set the flash options.
    #[must_use]
    pub fn with_options(mut self, options: FlashOptions) -> Self {
        self.options = options;
        self
    }

    /// Current options.
    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    /// Get a reference to the device shell.
    pub fn shell(&self) -> &Shell<C> {
        &self.shell
    }

    /// Get a mutable reference to the device shell.
    pub fn shell_mut(&mut self) -> &mut Shell<C> {
        &mut self.shell
    }

    /// Consume the flasher and return the device shell.
    pub fn into_shell(self) -> Shell<C> {
        self.shell
    }

    /// Flash the image described by `request` into the inactive partition.
    pub fn flash(&mut self, request: &FlashRequest) -> Result<()> {
        self.flash_with_progress(request, |_| {}).map(|_| ())
    }

    /// Like [`AbFlasher::flash`], calling `progress` before every step.
    pub fn flash_with_progress(
        &mut self,
        request: &FlashRequest,
        mut progress: impl FnMut(FlashStep),
    ) -> Result<FlashReport> {
        let image_path = request.image_path();
        let timeout = self.options.command_timeout;
        info!(
            "Flashing {image_path} from {}",
            request.ssh_target().destination()
        );

        run_step(FlashStep::VerifyPartitions, &mut progress, || {
            PartitionInspector::new(&mut self.shell, timeout).verify_ab_partitions()
        })?;
        let layout = run_step(FlashStep::VerifyLayout, &mut progress, || {
            PartitionInspector::new(&mut self.shell, timeout).verify_layout()
        })?;
        let (current, target) = run_step(FlashStep::SelectTarget, &mut progress, || {
            PartitionInspector::new(&mut self.shell, timeout).current_and_target()
        })?;
        run_step(FlashStep::CheckTargetUnmounted, &mut progress, || {
            PartitionInspector::new(&mut self.shell, timeout).verify_target_not_mounted(target)
        })?;

        let capacity = layout.sectors(target).unwrap_or(EXPECTED_SECTORS);
        let mut session = FlashSession {
            shell: &mut self.shell,
            relay: self.relay.as_mut(),
            target: request.ssh_target(),
            options: &self.options,
        };

        let transport = run_step(FlashStep::EstablishTransport, &mut progress, || {
            session.establish(&image_path)
        })?;
        let image = run_step(FlashStep::DetectImage, &mut progress, || {
            session.detect_image(&image_path, capacity)
        })?;
        run_step(FlashStep::TransferImage, &mut progress, || {
            session.transfer(&image, target, capacity)
        })?;

        let version = run_step(FlashStep::VerifyFlash, &mut progress, || {
            verify_flash(&mut self.shell, target, timeout)
        })?;
        run_step(FlashStep::SwitchBoot, &mut progress, || {
            switch_boot(&mut self.shell, current, target, timeout)
        })?;
        let policy = self.options.reboot;
        run_step(FlashStep::Reboot, &mut progress, || {
            RebootSupervisor::new(&mut self.shell, policy).run()
        })?;

        info!("Flashed {target}, device now boots from it");
        Ok(FlashReport {
            previous: current,
            flashed: target,
            image,
            transport,
            version,
        })
    }

    /// Inspect the device without changing anything.
    pub fn status(&mut self) -> Result<DeviceStatus> {
        let mut inspector = PartitionInspector::new(&mut self.shell, self.options.command_timeout);
        inspector.verify_ab_partitions()?;
        let layout = inspector.read_layout()?;
        let (current, target) = inspector.current_and_target()?;
        let target_mounted = inspector.is_mounted(target)?;

        Ok(DeviceStatus {
            current,
            target,
            layout,
            layout_valid: layout.validate().is_ok(),
            target_mounted,
        })
    }
}

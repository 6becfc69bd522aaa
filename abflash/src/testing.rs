//! Scripted console and simulated A/B device shared by the unit tests.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;

use crate::console::{Console, earliest_match};
use crate::error::{Error, Result};
use crate::partition::EXPECTED_SECTORS;
use crate::shell::CommandRunner;

/// Shell prompt printed by the simulated device.
pub const PROMPT: &str = "root@rpi4:~# ";

const IMAGE_HOST: &str = "10.0.0.1";

const AUTH_PROMPT: &str = "root@10.0.0.1's password: ";

const DEFAULT_IMAGE: &str = "/tmp/rpi.img";

/// What the device prints in response to a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Output followed by a fresh prompt.
    Output(String),
    /// Text without a trailing prompt, e.g. a password prompt.
    Raw(String),
    /// Nothing at all.
    Silent,
}

impl Reply {
    pub fn output(text: impl Into<String>) -> Self {
        Self::Output(text.into())
    }
}

/// Something answering lines typed on the console.
pub trait Device {
    fn handle(&mut self, line: &str) -> Reply;

    fn control(&mut self, ch: char) -> Reply {
        if ch == 'c' {
            Reply::Raw(format!("^C\r\n{PROMPT}"))
        } else {
            Reply::Silent
        }
    }
}

impl<F: FnMut(&str) -> Reply> Device for F {
    fn handle(&mut self, line: &str) -> Reply {
        self(line)
    }
}

/// Console that echoes each line and appends the device's reply.
///
/// `expect` never blocks: if nothing matches the buffered text it times out
/// immediately.
pub struct ScriptedConsole<D: Device> {
    pub device: D,
    pub sent: Vec<String>,
    pub controls: Vec<char>,
    pending: String,
    before: String,
}

impl<D: Device> ScriptedConsole<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            sent: Vec::new(),
            controls: Vec::new(),
            pending: String::new(),
            before: String::new(),
        }
    }

    /// Queue unsolicited output, e.g. kernel messages.
    pub fn push_noise(&mut self, text: &str) {
        self.pending.push_str(text);
    }

    fn push_reply(&mut self, reply: Reply) {
        match reply {
            Reply::Output(text) => {
                if !text.is_empty() {
                    self.pending.push_str(&text.replace('\n', "\r\n"));
                    self.pending.push_str("\r\n");
                }
                self.pending.push_str(PROMPT);
            },
            Reply::Raw(text) => self.pending.push_str(&text),
            Reply::Silent => {},
        }
    }
}

impl<D: Device> Console for ScriptedConsole<D> {
    fn send_line(&mut self, line: &str) -> Result<()> {
        self.sent.push(line.to_string());
        self.pending.push_str(line);
        self.pending.push_str("\r\n");
        let reply = self.device.handle(line);
        self.push_reply(reply);
        Ok(())
    }

    fn send_control(&mut self, ch: char) -> Result<()> {
        self.controls.push(ch);
        let reply = self.device.control(ch);
        self.push_reply(reply);
        Ok(())
    }

    fn expect(&mut self, patterns: &[Regex], _timeout: Duration) -> Result<usize> {
        match earliest_match(&self.pending, patterns) {
            Some((index, start, end)) => {
                self.before = self.pending[..start].to_string();
                self.pending.drain(..end);
                Ok(index)
            },
            None => Err(Error::Timeout("scripted console: nothing matched".into())),
        }
    }

    fn before(&self) -> &str {
        &self.before
    }

    fn read_nonblocking(&mut self, _max_bytes: usize, _timeout: Duration) -> Result<String> {
        Ok(std::mem::take(&mut self.pending))
    }
}

/// `fdisk -l /dev/mmcblk0` of a card with the given A/B sizes.
pub fn fdisk_listing(p2_sectors: u64, p3_sectors: u64) -> String {
    let p2_start = 532_480;
    let p2_end = p2_start + p2_sectors - 1;
    let p3_start = p2_end + 1;
    let p3_end = p3_start + p3_sectors - 1;
    format!(
        "Disk /dev/mmcblk0: 29.72 GiB, 31914983424 bytes, 62333952 sectors
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
I/O size (minimum/optimal): 512 bytes / 512 bytes
Disklabel type: dos
Disk identifier: 0x6c586e13

Device         Boot   Start      End  Sectors  Size Id Type
/dev/mmcblk0p1 *       8192   532479   524288  256M  c W95 FAT32 (LBA)
/dev/mmcblk0p2       {p2_start} {p2_end} {p2_sectors}    1G 83 Linux
/dev/mmcblk0p3       {p3_start} {p3_end} {p3_sectors}    1G 83 Linux"
    )
}

/// `fdisk -l` of a raw filesystem image.
pub fn raw_listing(path: &str) -> String {
    format!(
        "Disk {path}: 926.1 MiB, 971038720 bytes, 1896560 sectors
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
I/O size (minimum/optimal): 512 bytes / 512 bytes"
    )
}

/// `fdisk -l` of a disk image whose Linux partition spans the given sectors.
pub fn partitioned_listing(path: &str, start: u64, end: u64, count: u64) -> String {
    format!(
        "Disk {path}: 512 MiB, 536870912 bytes, 1048576 sectors
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
I/O size (minimum/optimal): 512 bytes / 512 bytes
Disklabel type: dos
Disk identifier: 0x3e247b30

Device        Boot  Start     End Sectors   Size Id Type
{path}1        8192  122879  114688    56M  c W95 FAT32 (LBA)
{path}2      {start} {end} {count} 452.4M 83 Linux"
    )
}

fn default_images() -> HashMap<String, String> {
    HashMap::from([(DEFAULT_IMAGE.to_string(), raw_listing(DEFAULT_IMAGE))])
}

/// Command run by `ssh ... '<command>'`, unquoted.
pub fn remote_command(line: &str) -> String {
    match (line.find('\''), line.rfind('\'')) {
        (Some(start), Some(end)) if end > start => line[start + 1..end].replace(r"'\''", "'"),
        _ => String::new(),
    }
}

/// What the image host prints for `command`.
pub fn remote_reply(images: &HashMap<String, String>, command: &str) -> String {
    if let Some(text) = command.strip_prefix("echo ") {
        return text.to_string();
    }
    if let Some(rest) = command.strip_prefix("test -f ") {
        let path = rest.split_whitespace().next().unwrap_or_default();
        let found = if images.contains_key(path) {
            "FILE_EXISTS"
        } else {
            "FILE_NOT_FOUND"
        };
        return found.to_string();
    }
    if let Some(path) = command.strip_prefix("ls -lh ") {
        return format!("-rw-r--r--    1 root     root      926.1M Jun  1 12:00 {path}");
    }
    if let Some(rest) = command.strip_prefix("fdisk -l ") {
        let path = rest.trim_end_matches(" 2>&1");
        return images
            .get(path)
            .cloned()
            .unwrap_or_else(|| format!("fdisk: cannot open {path}: No such file or directory"));
    }
    format!("sh: {command}: not found")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SshState {
    Idle,
    HostKey(String),
    Password(String),
}

/// Simulated Raspberry Pi style A/B device with an image host behind it.
#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub partition_nodes: Vec<String>,
    pub p2_sectors: u64,
    pub p3_sectors: u64,
    pub boot_config: String,
    pub boot_config_writable: bool,
    pub sed_works: bool,
    pub mounted: Vec<String>,
    pub umount_works: bool,
    pub host_reachable: bool,
    pub known_host: bool,
    pub password: Option<String>,
    pub has_key: bool,
    pub key_authorized: bool,
    pub images: HashMap<String, String>,
    /// `(device node, command line)` of every pipeline that wrote.
    pub written: Vec<(String, String)>,
    pub transfer_output: String,
    pub transfer_hangs: bool,
    pub rootfs_valid: bool,
    pub mount_fails: bool,
    pub verify_mounted: bool,
    pub version: Option<String>,
    pub rebooted: bool,
    pub down: bool,
    pub probes_before_up: usize,
    /// Commands that never return to the prompt.
    pub silent_commands: Vec<String>,
    ssh: SshState,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            partition_nodes: vec![
                "/dev/mmcblk0p1".into(),
                "/dev/mmcblk0p2".into(),
                "/dev/mmcblk0p3".into(),
            ],
            p2_sectors: EXPECTED_SECTORS,
            p3_sectors: EXPECTED_SECTORS,
            boot_config: "console=serial0,115200 console=tty1 root=/dev/mmcblk0p2 \
                          rootfstype=ext4 fsck.repair=yes rootwait"
                .into(),
            boot_config_writable: true,
            sed_works: true,
            mounted: vec!["/dev/mmcblk0p2".into(), "/dev/mmcblk0p1".into()],
            umount_works: true,
            host_reachable: true,
            known_host: true,
            password: None,
            has_key: false,
            key_authorized: false,
            images: default_images(),
            written: Vec::new(),
            transfer_output: "231+1 records in\n231+1 records out\n\
                              971038720 bytes (926.1MB) copied, 61.2 seconds, 15.1MB/s"
                .into(),
            transfer_hangs: false,
            rootfs_valid: true,
            mount_fails: false,
            verify_mounted: false,
            version: None,
            rebooted: false,
            down: false,
            probes_before_up: 0,
            silent_commands: Vec::new(),
            ssh: SshState::Idle,
        }
    }
}

impl FakeDevice {
    fn command(&mut self, cmd: &str) -> Reply {
        if cmd.starts_with("ssh ") || cmd.contains("| ssh ") {
            return self.start_ssh(cmd);
        }

        if cmd.starts_with("ls -l /dev/mmcblk0p*") {
            let listing: Vec<String> = self
                .partition_nodes
                .iter()
                .enumerate()
                .map(|(i, node)| {
                    format!("brw-rw----    1 root     disk      179,   {} Jan  1 00:00 {node}", i + 1)
                })
                .collect();
            return Reply::output(listing.join("\n"));
        }
        if cmd == "fdisk -l /dev/mmcblk0" {
            return Reply::output(fdisk_listing(self.p2_sectors, self.p3_sectors));
        }
        if cmd == "cat /boot/cmdline.txt" {
            return Reply::output(self.boot_config.clone());
        }
        if cmd == "mount" {
            let mut lines: Vec<String> = self
                .mounted
                .iter()
                .map(|node| {
                    let point = if node.ends_with("p1") {
                        "/boot"
                    } else if self.boot_config.contains(node.as_str()) {
                        "/"
                    } else {
                        "/mnt/data"
                    };
                    format!("{node} on {point} type ext4 (rw,relatime)")
                })
                .collect();
            lines.push("proc on /proc type proc (rw,relatime)".into());
            return Reply::output(lines.join("\n"));
        }
        if let Some(rest) = cmd.strip_prefix("umount ") {
            let target = rest.trim_end_matches(" 2>&1");
            if target == "/mnt/flash_verify" {
                if self.verify_mounted {
                    self.verify_mounted = false;
                    return Reply::output("");
                }
                return Reply::output("umount: can't unmount /mnt/flash_verify: Invalid argument");
            }
            if self.umount_works {
                self.mounted.retain(|m| m != target);
                return Reply::output("");
            }
            return Reply::output(format!(
                "umount: can't unmount {target}: Device or resource busy"
            ));
        }
        if cmd.starts_with("ping ") {
            let stats = if self.host_reachable {
                "3 packets transmitted, 3 packets received, 0% packet loss"
            } else {
                "3 packets transmitted, 0 packets received, 100% packet loss"
            };
            return Reply::output(format!(
                "PING {IMAGE_HOST} ({IMAGE_HOST}): 56 data bytes\n\n--- {IMAGE_HOST} ping statistics ---\n{stats}"
            ));
        }
        if cmd == "mkdir -p /mnt/flash_verify" || cmd == "mkdir -p ~/.ssh" {
            return Reply::output("");
        }
        if let Some(rest) = cmd.strip_prefix("mount /dev/") {
            if self.mount_fails {
                let node = rest.split_whitespace().next().unwrap_or_default();
                return Reply::output(format!(
                    "mount: mounting /dev/{node} on /mnt/flash_verify failed: Invalid argument"
                ));
            }
            self.verify_mounted = true;
            return Reply::output("");
        }
        if cmd.starts_with("ls -d /mnt/flash_verify/bin") {
            let listing = if self.rootfs_valid {
                "/mnt/flash_verify/bin\n/mnt/flash_verify/etc"
            } else {
                "ls: /mnt/flash_verify/bin: No such file or directory\n\
                 ls: /mnt/flash_verify/etc: No such file or directory"
            };
            return Reply::output(listing);
        }
        if cmd.starts_with("cat /mnt/flash_verify/version.txt") {
            return Reply::output(self.version.clone().unwrap_or_default());
        }
        if cmd.starts_with("rmdir /mnt/flash_verify") {
            return Reply::output("");
        }
        if let Some(rest) = cmd.strip_prefix("sed -i 's/") {
            if !self.boot_config_writable {
                return Reply::output(
                    "sed: can't create temp file '/boot/cmdline.txtXXXXXX': Read-only file system",
                );
            }
            let mut parts = rest.splitn(3, '/');
            if let (Some(from), Some(to), true) = (parts.next(), parts.next(), self.sed_works) {
                self.boot_config = self.boot_config.replace(from, to);
            }
            return Reply::output("");
        }
        if cmd == "reboot" {
            self.rebooted = true;
            self.down = true;
            self.verify_mounted = false;
            return Reply::Silent;
        }
        if let Some(tag) = probe_tag(cmd) {
            return Reply::output(tag);
        }
        if cmd == "dmesg -n 1" || cmd == "stty columns 200" {
            return Reply::output("");
        }
        if cmd.starts_with("test -f ~/.ssh/id_dropbear") {
            return Reply::output(if self.has_key { "KEY_EXISTS" } else { "KEY_MISSING" });
        }
        if cmd.starts_with("dropbearkey -t rsa") {
            self.has_key = true;
            return Reply::output(
                "Generating 2048 bit rsa key, this may take a while...\n\
                 Public key portion is:\n\
                 ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7 root@rpi4\n\
                 Fingerprint: sha1!! 3b:7e:21:0a:9c:55",
            );
        }
        if cmd.starts_with("dropbearkey -y") {
            return Reply::output("");
        }
        if cmd == "cat ~/.ssh/id_dropbear.pub" {
            if self.has_key {
                return Reply::output("ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7 root@rpi4");
            }
            return Reply::output("cat: can't open '/root/.ssh/id_dropbear.pub': No such file or directory");
        }

        let program = cmd.split_whitespace().next().unwrap_or_default();
        Reply::output(format!("-sh: {program}: not found"))
    }

    fn start_ssh(&mut self, cmd: &str) -> Reply {
        if !self.host_reachable {
            return Reply::output(format!(
                "ssh: Exited: Error connecting to {IMAGE_HOST} port 22: No route to host"
            ));
        }
        if !self.known_host {
            self.ssh = SshState::HostKey(cmd.to_string());
            return Reply::Raw(format!(
                "\r\nHost '{IMAGE_HOST}' is not in the trusted hosts file.\r\n\
                 (ssh-ed25519 fingerprint sha1!! 6f:1a:9c:02:44)\r\n\
                 Do you want to continue connecting? (y/n) "
            ));
        }
        self.authenticate(cmd.to_string())
    }

    fn authenticate(&mut self, cmd: String) -> Reply {
        if self.password.is_some() && !self.key_authorized {
            self.ssh = SshState::Password(cmd);
            return Reply::Raw(AUTH_PROMPT.to_string());
        }
        self.run_ssh(&cmd)
    }

    fn run_ssh(&mut self, cmd: &str) -> Reply {
        if let Some((_, sink)) = cmd.split_once("| dd of=") {
            if self.transfer_hangs {
                return Reply::Silent;
            }
            let node = sink.split_whitespace().next().unwrap_or_default();
            self.written.push((node.to_string(), cmd.to_string()));
            return Reply::output(self.transfer_output.clone());
        }
        if cmd.starts_with("cat ~/.ssh/id_dropbear.pub |") {
            self.key_authorized = true;
            return Reply::output("");
        }
        Reply::output(remote_reply(&self.images, &remote_command(cmd)))
    }
}

fn probe_tag(cmd: &str) -> Option<String> {
    cmd.strip_prefix("echo \"ABFLASH\"")
        .map(|rest| format!("ABFLASH{}", rest.replace('"', "")))
}

impl Device for FakeDevice {
    fn handle(&mut self, line: &str) -> Reply {
        match std::mem::replace(&mut self.ssh, SshState::Idle) {
            SshState::HostKey(cmd) => {
                if line == "y" || line == "yes" {
                    self.known_host = true;
                    self.authenticate(cmd)
                } else {
                    Reply::output("Host key verification failed.")
                }
            },
            SshState::Password(cmd) => {
                if self.password.as_deref() == Some(line) {
                    self.run_ssh(&cmd)
                } else {
                    self.ssh = SshState::Password(cmd);
                    Reply::Raw(format!("Permission denied, please try again.\r\n{AUTH_PROMPT}"))
                }
            },
            SshState::Idle => {
                let cmd = line.trim();
                if self.down {
                    // Only the liveness probe gets through while booting.
                    if probe_tag(cmd).is_none() {
                        return Reply::Silent;
                    }
                    if self.probes_before_up > 0 {
                        self.probes_before_up -= 1;
                        return Reply::Silent;
                    }
                    self.down = false;
                }
                if self.silent_commands.iter().any(|c| c == cmd) {
                    return Reply::Silent;
                }
                self.command(cmd)
            },
        }
    }

    fn control(&mut self, ch: char) -> Reply {
        self.ssh = SshState::Idle;
        if ch == 'c' && !self.down {
            Reply::Raw(format!("^C\r\n{PROMPT}"))
        } else {
            Reply::Silent
        }
    }
}

/// Relay host answering for the image host.
#[derive(Debug, Clone)]
pub struct FakeRelay {
    pub host_reachable: bool,
    /// The relay cannot run commands at all.
    pub broken: bool,
    /// Exit status reported for remote commands.
    pub exit_status: i32,
    pub images: HashMap<String, String>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl Default for FakeRelay {
    fn default() -> Self {
        Self {
            host_reachable: true,
            broken: false,
            exit_status: 0,
            images: default_images(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl CommandRunner for FakeRelay {
    fn run(&mut self, command: &str, _timeout: Duration) -> Result<String> {
        self.log.lock().unwrap().push(command.to_string());
        if self.broken {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "ssh: command not found",
            )));
        }
        if !self.host_reachable {
            return Ok(format!(
                "ssh: connect to host {IMAGE_HOST} port 22: No route to host\n__ABFLASH_RC=255"
            ));
        }
        Ok(format!(
            "{}\n__ABFLASH_RC={}",
            remote_reply(&self.images, &remote_command(command)),
            self.exit_status
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_command_unquotes() {
        assert_eq!(
            remote_command(r"ssh root@h 'echo it'\''s' | dd of=/dev/x"),
            "echo it's"
        );
        assert_eq!(remote_command("ls"), "");
    }

    #[test]
    fn test_probe_tag() {
        assert_eq!(
            probe_tag("echo \"ABFLASH\"\"_UP_3_42\"").as_deref(),
            Some("ABFLASH_UP_3_42")
        );
        assert_eq!(probe_tag("echo hi"), None);
    }
}

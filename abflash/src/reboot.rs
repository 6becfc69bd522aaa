//! Reboot the device and wait until its shell answers again.

use std::process;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use regex::Regex;

use crate::console::Console;
use crate::error::{Error, Result};
use crate::shell::Shell;

/// Prefix of the tag echoed by the liveness probe.
const PROBE_PREFIX: &str = "ABFLASH";

/// Timeout of the post-boot console setup commands.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing of the reboot wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootPolicy {
    /// Wait after sending `reboot` before the first probe.
    pub settle: Duration,
    /// Time between the starts of two probes.
    pub poll_interval: Duration,
    /// How long a single probe waits for an answer, capped at `poll_interval`.
    pub probe_timeout: Duration,
    /// Give up once this much polling time has elapsed.
    pub max_wait: Duration,
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            max_wait: Duration::from_secs(300),
        }
    }
}

impl RebootPolicy {
    /// Set the maximum wait.
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Upper bound of probes sent before timing out.
    pub fn max_probes(&self) -> u64 {
        let poll = self.poll_interval.as_nanos().max(1);
        (self.max_wait.as_nanos() / poll) as u64 + 1
    }

    /// Time a single probe may take.
    fn probe_window(&self) -> Duration {
        self.probe_timeout.min(self.poll_interval)
    }
}

/// Where the supervisor is in the reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootState {
    /// `reboot` sent, settling.
    Rebooting,
    /// Probing the console.
    Polling,
    /// The shell answered.
    Responsive,
    /// No answer within the maximum wait.
    TimedOut,
}

/// Drives a reboot over the device shell.
pub struct RebootSupervisor<'a, C: Console> {
    shell: &'a mut Shell<C>,
    policy: RebootPolicy,
    state: RebootState,
    probes: u64,
}

impl<'a, C: Console> RebootSupervisor<'a, C> {
    /// Supervise a reboot of the device behind `shell`.
    pub fn new(shell: &'a mut Shell<C>, policy: RebootPolicy) -> Self {
        Self {
            shell,
            policy,
            state: RebootState::Rebooting,
            probes: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> RebootState {
        self.state
    }

    /// Number of probes sent so far.
    pub fn probes(&self) -> u64 {
        self.probes
    }

    /// Reboot and block until the device answers or the wait is exhausted.
    pub fn run(&mut self) -> Result<()> {
        info!("Rebooting device...");
        self.state = RebootState::Rebooting;
        self.shell.drain()?;
        self.shell.console_mut().send_line("reboot")?;
        thread::sleep(self.policy.settle);

        self.state = RebootState::Polling;
        let polling_since = Instant::now();
        let deadline = polling_since + self.policy.max_wait;
        loop {
            let started = Instant::now();
            if self.probe(started + self.policy.probe_window()) {
                self.state = RebootState::Responsive;
                break;
            }

            let now = Instant::now();
            if now >= deadline || self.probes >= self.policy.max_probes() {
                self.state = RebootState::TimedOut;
                return Err(Error::RebootTimedOut(self.policy.max_wait));
            }
            debug!(
                "Device not responsive yet ({}s of {}s)",
                (now - polling_since).as_secs(),
                self.policy.max_wait.as_secs()
            );

            // Pad to the poll interval, but never sleep past the deadline.
            let next = (started + self.policy.poll_interval).min(deadline);
            thread::sleep(next.saturating_duration_since(now));
        }

        info!("Device is back after reboot");
        self.setup_console();
        Ok(())
    }

    /// Send one tagged echo and wait for it or a prompt until `until`.
    fn probe(&mut self, until: Instant) -> bool {
        self.probes += 1;
        let suffix = format!("_UP_{}_{}", self.probes, process::id());
        let tag = format!("{PROBE_PREFIX}{suffix}");
        // Split the tag with quotes so the echoed command line cannot match.
        let command = format!("echo \"{PROBE_PREFIX}\"\"{suffix}\"");

        let Ok(tag_pattern) = Regex::new(&regex::escape(&tag)) else {
            return false;
        };
        let mut patterns = vec![tag_pattern];
        patterns.extend(self.shell.prompts().iter().cloned());

        let result = self
            .shell
            .drain()
            .and_then(|()| self.shell.console_mut().send_line(&command))
            .and_then(|()| {
                let remaining = until.saturating_duration_since(Instant::now());
                self.shell.console_mut().expect(&patterns, remaining)
            });
        match result {
            Ok(_) => true,
            Err(Error::Timeout(_)) => false,
            Err(e) => {
                debug!("Probe {} failed: {e}", self.probes);
                false
            },
        }
    }

    fn setup_console(&mut self) {
        for command in ["dmesg -n 1", "stty columns 200"] {
            if let Err(e) = self.shell.run(command, SETUP_TIMEOUT) {
                warn!("`{command}` failed after reboot: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, ScriptedConsole};

    fn fast_policy() -> RebootPolicy {
        RebootPolicy {
            settle: Duration::ZERO,
            poll_interval: Duration::from_millis(2),
            probe_timeout: Duration::from_millis(1),
            max_wait: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RebootPolicy::default();
        assert_eq!(policy.max_wait, Duration::from_secs(300));
        assert_eq!(policy.max_probes(), 61);
    }

    #[test]
    fn test_device_comes_back() {
        let mut device = FakeDevice::default();
        device.probes_before_up = 3;
        let mut shell = Shell::new(ScriptedConsole::new(device)).unwrap();

        let mut supervisor = RebootSupervisor::new(&mut shell, fast_policy());
        supervisor.run().unwrap();
        assert_eq!(supervisor.state(), RebootState::Responsive);
        assert_eq!(supervisor.probes(), 4);

        let sent = &shell.console().sent;
        assert_eq!(sent[0], "reboot");
        assert!(sent.contains(&"dmesg -n 1".to_string()));
        assert!(sent.contains(&"stty columns 200".to_string()));
    }

    #[test]
    fn test_probe_echo_does_not_match_tag() {
        let mut device = FakeDevice::default();
        device.probes_before_up = 1;
        let mut shell = Shell::new(ScriptedConsole::new(device)).unwrap();

        let mut supervisor = RebootSupervisor::new(&mut shell, fast_policy());
        supervisor.run().unwrap();
        // The first probe was echoed but not answered, so it must not count.
        assert_eq!(supervisor.probes(), 2);
    }

    #[test]
    fn test_timeout_bounds_probes() {
        let mut device = FakeDevice::default();
        device.probes_before_up = usize::MAX;
        let mut shell = Shell::new(ScriptedConsole::new(device)).unwrap();
        let policy = fast_policy();

        let started = Instant::now();
        let mut supervisor = RebootSupervisor::new(&mut shell, policy);
        let err = supervisor.run().unwrap_err();
        assert!(matches!(err, Error::RebootTimedOut(t) if t == policy.max_wait));
        assert_eq!(supervisor.state(), RebootState::TimedOut);
        assert!(supervisor.probes() <= policy.max_probes());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    /// Console that stays silent and blocks for the whole expect timeout.
    #[derive(Default)]
    struct SilentConsole {
        sent: Vec<String>,
    }

    impl Console for SilentConsole {
        fn send_line(&mut self, line: &str) -> Result<()> {
            self.sent.push(line.to_string());
            Ok(())
        }

        fn send_control(&mut self, _ch: char) -> Result<()> {
            Ok(())
        }

        fn expect(&mut self, _patterns: &[Regex], timeout: Duration) -> Result<usize> {
            thread::sleep(timeout);
            Err(Error::Timeout("silent".into()))
        }

        fn before(&self) -> &str {
            ""
        }

        fn read_nonblocking(&mut self, _max_bytes: usize, _timeout: Duration) -> Result<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn test_slow_probes_stay_within_max_wait() {
        let mut shell = Shell::new(SilentConsole::default()).unwrap();
        let policy = RebootPolicy {
            settle: Duration::ZERO,
            poll_interval: Duration::from_millis(20),
            probe_timeout: Duration::from_secs(1),
            max_wait: Duration::from_millis(60),
        };

        let started = Instant::now();
        let mut supervisor = RebootSupervisor::new(&mut shell, policy);
        let err = supervisor.run().unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, Error::RebootTimedOut(_)));
        assert!(supervisor.probes() <= policy.max_probes());
        // Bound is max_wait + poll_interval; leave room for a loaded machine.
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    }

    #[test]
    fn test_setup_failures_are_not_fatal() {
        let mut device = FakeDevice::default();
        device.silent_commands.push("stty columns 200".into());
        let mut shell = Shell::new(ScriptedConsole::new(device)).unwrap();

        RebootSupervisor::new(&mut shell, fast_policy()).run().unwrap();
    }
}

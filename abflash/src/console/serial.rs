//! Console session over a serial [`Port`].

use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

use log::trace;
use regex::Regex;

use crate::console::{Console, control_byte, drain_utf8_lossy, earliest_match};
use crate::error::{Error, Result};
use crate::port::Port;

/// Size of a single read from the port.
const READ_CHUNK: usize = 4096;

/// Back-off when a port returns immediately without data.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Expect-style console on top of any [`Port`].
pub struct SerialConsole<P: Port> {
    port: P,
    /// Incomplete UTF-8 tail of the last read.
    pending: Vec<u8>,
    /// Decoded text not yet consumed by a match.
    buffer: String,
    before: String,
}

impl<P: Port> SerialConsole<P> {
    /// Wrap an opened port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            pending: Vec::new(),
            buffer: String::new(),
            before: String::new(),
        }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the console and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Read once from the port (bounded by its timeout) into the text buffer.
    fn fill(&mut self, max_bytes: usize) -> Result<usize> {
        let mut buf = vec![0u8; max_bytes.clamp(1, READ_CHUNK)];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(0),
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                let text = drain_utf8_lossy(&mut self.pending);
                trace!("console <- {text:?}");
                self.buffer.push_str(&text);
                Ok(n)
            },
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Like [`fill`](Self::fill), but never block longer than `remaining`.
    fn fill_within(&mut self, remaining: Duration) -> Result<usize> {
        let previous = self.port.timeout();
        if remaining >= previous {
            return self.fill(READ_CHUNK);
        }
        self.port.set_timeout(remaining)?;
        let read = self.fill(READ_CHUNK);
        self.port.set_timeout(previous)?;
        read
    }
}

impl<P: Port> Console for SerialConsole<P> {
    fn send_line(&mut self, line: &str) -> Result<()> {
        trace!("console -> {line:?}");
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.port.write_all_bytes(&data)
    }

    fn send_control(&mut self, ch: char) -> Result<()> {
        trace!("console -> ^{}", ch.to_ascii_uppercase());
        self.port.write_all_bytes(&[control_byte(ch)])
    }

    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some((index, start, end)) = earliest_match(&self.buffer, patterns) {
                self.before = self.buffer[..start].to_string();
                self.buffer.drain(..end);
                return Ok(index);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!(
                    "none of {} pattern(s) seen on {} within {:.1}s",
                    patterns.len(),
                    self.port.name(),
                    timeout.as_secs_f64()
                )));
            }

            if self.fill_within(remaining)? == 0 {
                thread::sleep(IDLE_BACKOFF.min(remaining));
            }
        }
    }

    fn before(&self) -> &str {
        &self.before
    }

    fn read_nonblocking(&mut self, max_bytes: usize, timeout: Duration) -> Result<String> {
        let previous = self.port.timeout();
        self.port.set_timeout(timeout)?;
        let read = self.fill(max_bytes);
        self.port.set_timeout(previous)?;
        read?;

        Ok(std::mem::take(&mut self.buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Mock port with separate read/write buffers.
    struct MockPort {
        read_buf: VecDeque<u8>,
        write_buf: Vec<u8>,
        timeout: Duration,
        /// Sleep for the read timeout when there is nothing to read.
        blocking: bool,
    }

    impl MockPort {
        fn new(response: &[u8]) -> Self {
            Self {
                read_buf: response.iter().copied().collect(),
                write_buf: Vec::new(),
                timeout: Duration::from_millis(10),
                blocking: false,
            }
        }
    }

    impl std::io::Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.read_buf.is_empty() {
                if self.blocking {
                    thread::sleep(self.timeout);
                }
                return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.read_buf.len());
            for b in buf.iter_mut().take(n) {
                *b = self.read_buf.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl std::io::Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write_buf.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockPort {
        fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    fn prompt() -> Regex {
        Regex::new(r"root@\w+:[^\n]*# ").unwrap()
    }

    #[test]
    fn test_expect_returns_text_before_prompt() {
        let port = MockPort::new(b"uname -r\r\n6.1.0\r\nroot@rpi4:~# ");
        let mut console = SerialConsole::new(port);

        let index = console
            .expect(&[prompt()], Duration::from_millis(200))
            .unwrap();
        assert_eq!(index, 0);
        assert_eq!(console.before(), "uname -r\r\n6.1.0\r\n");
    }

    #[test]
    fn test_expect_picks_earliest_pattern() {
        let port = MockPort::new(b"password: root@rpi4:~# ");
        let mut console = SerialConsole::new(port);
        let patterns = [prompt(), Regex::new("[Pp]assword:").unwrap()];

        let index = console
            .expect(&patterns, Duration::from_millis(200))
            .unwrap();
        assert_eq!(index, 1);

        // The prompt is still buffered for the next expect.
        let index = console
            .expect(&patterns, Duration::from_millis(200))
            .unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn test_expect_times_out() {
        let port = MockPort::new(b"booting...");
        let mut console = SerialConsole::new(port);

        let err = console
            .expect(&[prompt()], Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_read_nonblocking_returns_buffered_text() {
        let port = MockPort::new(b"1000+0 records in\r\n");
        let mut console = SerialConsole::new(port);

        let text = console
            .read_nonblocking(1024, Duration::from_millis(5))
            .unwrap();
        assert_eq!(text, "1000+0 records in\r\n");
        assert!(
            console
                .read_nonblocking(1024, Duration::from_millis(5))
                .unwrap()
                .is_empty()
        );
        assert_eq!(console.port().timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_expect_does_not_overrun_deadline_on_slow_port() {
        let mut port = MockPort::new(b"");
        port.blocking = true;
        port.timeout = Duration::from_secs(2);
        let mut console = SerialConsole::new(port);

        let started = Instant::now();
        let err = console
            .expect(&[prompt()], Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(console.port().timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_send_line_and_control() {
        let mut console = SerialConsole::new(MockPort::new(b""));
        console.send_line("mount").unwrap();
        console.send_control('c').unwrap();
        assert_eq!(console.port().write_buf, b"mount\n\x03");
    }
}

//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        error::Result,
        port::{Port, SerialConfig},
    },
    log::debug,
    serialport::{DataBits, FlowControl, Parity, StopBits},
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Native serial port attached to a board's debug UART.
pub struct NativePort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open a serial port with the given configuration (8N1, no flow control).
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening console {} at {} baud",
            config.port_name, config.baud_rate
        );
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;

        Ok(Self {
            port,
            name: config.port_name.clone(),
            timeout: config.timeout,
        })
    }

    /// Open a serial port with default settings.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open(&SerialConfig::new(port_name, baud_rate))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

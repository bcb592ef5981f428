//! `serialport`-backed transport for an attached TKey.

use {
    crate::{
        error::Result,
        port::{Port, SerialConfig},
    },
    log::trace,
    serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// Serial connection to a TKey.
///
/// The OS handle is released on [`Port::close`]; later I/O fails with
/// `NotConnected` instead of touching a port the device may have re-enumerated.
pub struct NativePort {
    handle: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open `config.port_name` as 8N1 without flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        trace!("Opening {} at {} baud", config.port_name, config.baud_rate);
        let handle = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;

        Ok(Self {
            handle: Some(handle),
            name: config.port_name.clone(),
            timeout: config.timeout,
        })
    }

    /// Whether the OS handle is still held.
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn handle(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            handle.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            handle.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            trace!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }
}

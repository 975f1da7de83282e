use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use serialport::{SerialPort, SerialPortType};

use super::{Result, SerialError, SerialDeviceInfo};

pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Receiving half of an open endpoint. Only the reader pump holds one.
pub trait StreamReader: Send {
    /// Read whatever arrived within the endpoint's read timeout.
    /// `Ok(0)` means nothing arrived; an error means the stream is dead.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Transmitting half of an open endpoint. Only the session's caller thread writes.
pub trait StreamWriter: Send {
    /// Write the whole buffer and flush it to the line.
    fn write(&mut self, data: &[u8]) -> Result<usize>;
}

/// A byte stream device that can be opened into a reader/writer pair.
pub trait Endpoint: Send {
    /// Human readable name used in logs and errors.
    fn name(&self) -> String;

    fn open(&mut self) -> Result<(Box<dyn StreamReader>, Box<dyn StreamWriter>)>;

    /// Mark the endpoint closed. The device itself is released once both
    /// halves returned by `open` are dropped. Calling this twice is harmless.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Serial port endpoint backed by the `serialport` crate.
pub struct SerialInterface {
    port_name: String,
    baud_rate: u32,
    read_timeout: Duration,
    open: bool,
}

impl SerialInterface {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            read_timeout: DEFAULT_READ_TIMEOUT,
            open: false,
        }
    }

    /// Bounded latency for every read; the pump notices a stop request within
    /// one of these intervals.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// List serial devices visible to the OS
    pub fn discover_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::with_capacity(ports.len());

        for port in ports {
            let device = match port.port_type {
                SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                    port_name: port.port_name,
                    port_type: format!("usb {:04x}:{:04x}", usb_info.vid, usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                },
                SerialPortType::PciPort => SerialDeviceInfo::bare(port.port_name, "pci"),
                SerialPortType::BluetoothPort => SerialDeviceInfo::bare(port.port_name, "bluetooth"),
                SerialPortType::Unknown => SerialDeviceInfo::bare(port.port_name, "unknown"),
            };
            devices.push(device);
        }

        Ok(devices)
    }
}

impl SerialDeviceInfo {
    fn bare(port_name: String, port_type: &str) -> Self {
        Self {
            port_name,
            port_type: port_type.to_string(),
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl Endpoint for SerialInterface {
    fn name(&self) -> String {
        format!("{}@{}", self.port_name, self.baud_rate)
    }

    fn open(&mut self) -> Result<(Box<dyn StreamReader>, Box<dyn StreamWriter>)> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| SerialError::Device(format!("{}: {}", self.port_name, e)))?;
        let writer = port
            .try_clone()
            .map_err(|e| SerialError::Device(format!("{}: {}", self.port_name, e)))?;

        self.open = true;
        log::info!("Opened serial port {} at {} baud", self.port_name, self.baud_rate);
        Ok((
            Box::new(SerialReader { port }),
            Box::new(SerialWriter { port: writer }),
        ))
    }

    fn close(&mut self) {
        if self.open {
            log::info!("Closing serial port {}", self.port_name);
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct SerialReader {
    port: Box<dyn SerialPort>,
}

impl StreamReader for SerialReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(SerialError::Device(format!("read failed: {}", e))),
        }
    }
}

struct SerialWriter {
    port: Box<dyn SerialPort>,
}

impl StreamWriter for SerialWriter {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.port
            .write_all(data)
            .and_then(|_| self.port.flush())
            .map_err(|e| SerialError::Device(format!("write failed: {}", e)))?;
        Ok(data.len())
    }
}

//! Serial Devices
//!
//! The bridge talks to a [`SerialDevice`] obtained from a [`SerialOpener`].
//! [`SystemSerialOpener`] opens real ports through the `serialport` crate;
//! [`ChannelOpener`] hands out in-memory [`ChannelDevice`]s for tests and
//! embedders without hardware.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use serde::Serialize;
use tracing::debug;

use crate::Result;

/// Timeouts applied to an opened device
#[derive(Debug, Clone, Copy)]
pub struct SerialTimeouts {
    /// Upper bound on a read that finds no data
    pub read: Duration,
    pub write: Duration,
}

/// An open serial device.
///
/// Reads must return within the read timeout, either with data or with an
/// [`io::ErrorKind::TimedOut`] error, so callers can poll for cancellation.
pub trait SerialDevice: Read + Write + Send {
    /// Another handle to the same device, for concurrent read and write
    fn try_clone_device(&self) -> io::Result<Box<dyn SerialDevice>>;

    /// Change the I/O timeout of this handle
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}

/// Opens serial devices by name
pub trait SerialOpener: Send + Sync {
    fn open(
        &self,
        device: &str,
        baud_rate: u32,
        timeouts: SerialTimeouts,
    ) -> Result<Box<dyn SerialDevice>>;
}

/// Opens hardware ports via the `serialport` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerialOpener;

impl SerialOpener for SystemSerialOpener {
    fn open(
        &self,
        device: &str,
        baud_rate: u32,
        timeouts: SerialTimeouts,
    ) -> Result<Box<dyn SerialDevice>> {
        let port = serialport::new(device, baud_rate)
            .timeout(timeouts.read)
            .open()
            .with_context(|| format!("Failed to open {} at {} baud", device, baud_rate))?;

        debug!("Opened serial port {} at {} baud", device, baud_rate);
        Ok(Box::new(SystemSerialPort { port }))
    }
}

struct SystemSerialPort {
    port: Box<dyn serialport::SerialPort>,
}

impl Read for SystemSerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SystemSerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialDevice for SystemSerialPort {
    fn try_clone_device(&self) -> io::Result<Box<dyn SerialDevice>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SystemSerialPort { port }))
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::from)
    }
}

/// A serial port found on this machine
#[derive(Debug, Clone, Serialize)]
pub struct SerialPortInfo {
    pub name: String,
    pub kind: String,
}

/// Enumerate the serial ports available on this machine
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let kind = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => match info.product {
                    Some(product) => format!("USB ({})", product),
                    None => format!("USB {:04x}:{:04x}", info.vid, info.pid),
                },
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::Unknown => "Unknown".to_string(),
            };
            SerialPortInfo {
                name: p.port_name,
                kind,
            }
        })
        .collect())
}

struct Inbound {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

/// In-memory serial device backed by channels.
///
/// Bytes sent through the paired [`DeviceEnd`] become readable from the
/// device, and bytes written to the device arrive at the [`DeviceEnd`].
#[derive(Clone)]
pub struct ChannelDevice {
    inbound: Arc<Mutex<Inbound>>,
    outbound: Sender<Vec<u8>>,
    read_timeout: Duration,
}

/// The far side of a [`ChannelDevice`], i.e. the attached equipment
pub struct DeviceEnd {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl ChannelDevice {
    pub fn pair() -> (ChannelDevice, DeviceEnd) {
        let (to_device, device_rx) = mpsc::channel();
        let (device_tx, from_device) = mpsc::channel();

        let device = ChannelDevice {
            inbound: Arc::new(Mutex::new(Inbound {
                rx: device_rx,
                pending: VecDeque::new(),
            })),
            outbound: device_tx,
            read_timeout: Duration::from_millis(100),
        };
        let end = DeviceEnd {
            tx: to_device,
            rx: from_device,
        };
        (device, end)
    }

    /// Number of live handles sharing this device
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inbound)
    }
}

impl Read for ChannelDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self
            .inbound
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "device lock poisoned"))?;

        if inbound.pending.is_empty() {
            match inbound.rx.recv_timeout(self.read_timeout) {
                Ok(chunk) => inbound.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device detached"))
                }
            }
        }

        let n = buf.len().min(inbound.pending.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for ChannelDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device detached"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialDevice for ChannelDevice {
    fn try_clone_device(&self) -> io::Result<Box<dyn SerialDevice>> {
        Ok(Box::new(self.clone()))
    }
}

impl DeviceEnd {
    /// Make bytes readable from the device. False once the device is gone.
    pub fn send(&self, bytes: &[u8]) -> bool {
        self.tx.send(bytes.to_vec()).is_ok()
    }

    /// Collect bytes written to the device until `len` arrived or `timeout`
    /// elapsed
    pub fn recv_bytes(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(chunk) => out.extend(chunk),
                Err(_) => break,
            }
        }
        out
    }
}

/// Hands out registered [`ChannelDevice`]s by name
#[derive(Default)]
pub struct ChannelOpener {
    devices: Mutex<HashMap<String, ChannelDevice>>,
}

impl ChannelOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return its far end
    pub fn attach(&self, name: &str) -> DeviceEnd {
        let (device, end) = ChannelDevice::pair();
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(name.to_string(), device);
        }
        end
    }

    /// Live handles to the named device, including the opener's own
    pub fn handle_count(&self, name: &str) -> usize {
        self.devices
            .lock()
            .ok()
            .and_then(|devices| devices.get(name).map(ChannelDevice::handle_count))
            .unwrap_or(0)
    }
}

impl SerialOpener for ChannelOpener {
    fn open(
        &self,
        device: &str,
        _baud_rate: u32,
        timeouts: SerialTimeouts,
    ) -> Result<Box<dyn SerialDevice>> {
        let devices = self
            .devices
            .lock()
            .map_err(|_| anyhow!("device registry poisoned"))?;
        let mut handle = devices
            .get(device)
            .cloned()
            .ok_or_else(|| anyhow!("No such device: {}", device))?;
        handle.read_timeout = timeouts.read;
        Ok(Box::new(handle))
    }
}

//! Serial Bridge Module
//!
//! Turns a serial device into a TCP endpoint.

pub mod device;
pub mod serial;
pub mod session;

pub use device::{
    list_serial_ports, ChannelDevice, ChannelOpener, DeviceEnd, SerialDevice, SerialOpener,
    SerialPortInfo, SerialTimeouts, SystemSerialOpener,
};
pub use serial::{BridgeSettings, SerialBridge};
pub use session::{BridgeSession, SessionOptions, SessionStats};

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;

pub(crate) mod mock;
pub(crate) mod serial;

/// A serial device which may be connected to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceDescriptor {
    /// The path to the device.
    /// Likely "/dev/ttyACMx" or "COMx".
    pub path: String,

    /// Something a human can recognize the device by.
    pub label: String,

    /// USB vendor id, if the device is a USB device.
    pub vid: Option<u16>,

    /// USB product id, if the device is a USB device.
    pub pid: Option<u16>,

    /// USB serial number, if reported.
    pub serial_number: Option<String>,

    /// USB manufacturer string, if reported.
    pub manufacturer: Option<String>,

    /// USB product string, if reported.
    pub product: Option<String>,
}

impl DeviceDescriptor {
    /// A device with only a path and a label.
    pub fn new(path: &str, label: &str) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.label)?;

        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " [{vid:04x}:{pid:04x}]")?;
        }

        Ok(())
    }
}

/// What to connect to, and how fast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionConfig {
    /// The path of the device, see [`DeviceDescriptor::path`].
    pub port: String,

    /// The baud rate to open the port with.
    pub baud_rate: u32,
}

impl ConnectionConfig {
    /// Create a connection config.
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

impl Display for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {} baud", self.port, self.baud_rate)
    }
}

/// An open port.
///
/// Bytes are read and written through the async io traits.
/// Dropping a port releases it, [`Port::close`] does the same but reports problems.
pub trait Port: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Release the port.
    ///
    /// The port is gone after this call even if an error is returned.
    fn close(self: Box<Self>) -> Result<(), Error>;
}

/// Something which can list and open serial devices.
///
/// Implemented by native serial ports and by the in-memory mock.
pub trait Transport: Send + Sync {
    /// A short name, for logs.
    fn name(&self) -> &'static str;

    /// List the devices currently attachable.
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, Error>;

    /// Open a port.
    /// Should fail with [`Error::TransportOpen`].
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Port>, Error>;
}

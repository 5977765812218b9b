//! A mock transport.
//! Devices live in memory and loop back whatever is written to them,
//! line by line, the way a device echoing its console would.
//!
//! Useful for testing implementations which would use
//! regular serial ports- but faster and more reliable.

use super::{ConnectionConfig, DeviceDescriptor, Port, Transport};
use crate::{error::Error, mock::MockTransport};

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, Error> {
        self.devices()
    }

    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Port>, Error> {
        let port = self.open_port(config)?;

        Ok(Box::new(port))
    }
}

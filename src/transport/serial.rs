//! Native serial ports.

use super::{ConnectionConfig, DeviceDescriptor, Port, Transport};
use crate::{
    error::Error,
    serial::serial_port::{available_devices, try_open_serial_port, NativeTransport},
};

impl Transport for NativeTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, Error> {
        available_devices()
    }

    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Port>, Error> {
        let stream = try_open_serial_port(config, self.flow_control())?;

        Ok(Box::new(stream))
    }
}

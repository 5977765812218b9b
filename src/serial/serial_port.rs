use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use crate::{
    error::Error,
    transport::{ConnectionConfig, DeviceDescriptor, Port},
};

/// Flow control used when opening native ports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,

    /// XON/XOFF.
    Software,

    /// RTS/CTS.
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow_control: FlowControl) -> Self {
        match flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Serial ports as provided by the operating system.
#[derive(Debug, Clone, Default)]
pub struct NativeTransport {
    flow_control: FlowControl,
}

impl NativeTransport {
    /// Native ports without flow control.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flow control used for ports opened from now on.
    pub fn set_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    pub(crate) fn flow_control(&self) -> FlowControl {
        self.flow_control
    }
}

fn describe(name: String, port_type: SerialPortType) -> DeviceDescriptor {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let label = usb
                .product
                .clone()
                .or_else(|| usb.manufacturer.clone())
                .unwrap_or_else(|| "USB serial device".into());

            DeviceDescriptor {
                path: name,
                label,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
            }
        }
        SerialPortType::PciPort => DeviceDescriptor::new(&name, "PCI serial device"),
        SerialPortType::BluetoothPort => DeviceDescriptor::new(&name, "Bluetooth serial device"),
        SerialPortType::Unknown => DeviceDescriptor::new(&name, "Serial device"),
    }
}

/// List the serial ports the operating system knows about, ordered by path.
pub(crate) fn available_devices() -> Result<Vec<DeviceDescriptor>, Error> {
    let ports =
        tokio_serial::available_ports().map_err(|e| Error::Enumeration(e.to_string()))?;

    let mut devices = ports
        .into_iter()
        .map(|info| describe(info.port_name, info.port_type))
        .collect::<Vec<_>>();
    devices.sort();

    if devices.is_empty() {
        info!("No serial ports available");
    } else {
        debug!("Found {} serial port(s)", devices.len());
    }

    Ok(devices)
}

pub(crate) fn try_open_serial_port(
    config: &ConnectionConfig,
    flow_control: FlowControl,
) -> Result<SerialStream, Error> {
    if config.baud_rate == 0 {
        return Err(Error::TransportOpen(format!(
            "{}: a baud rate of zero is not usable",
            config.port
        )));
    }

    debug!(%config, ?flow_control, "Opening port");

    tokio_serial::new(&config.port, config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(flow_control.into())
        .open_native_async()
        .map_err(|e| Error::TransportOpen(format!("{}: {e}", config.port)))
}

impl Port for SerialStream {
    fn close(self: Box<Self>) -> Result<(), Error> {
        // Whatever is still buffered belongs to the session we are ending.
        self.clear(tokio_serial::ClearBuffer::All)
            .map_err(|e| Error::TransportClose(e.to_string()))
    }
}

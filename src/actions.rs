use std::fmt::Display;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error, events,
    serial::{SerialMessage, SerialMessageBytes},
    transport::{ConnectionConfig, DeviceDescriptor},
    validation::{self, UserDefine, UserDefineKey, ValidationFailure},
};

/// Actions user can ask of the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    /// List the serial devices which may be connected to.
    ListDevices,

    /// Connect to a device.
    ///
    /// There is a single session shared by every user,
    /// so this fails if someone is already connected.
    Connect(ConnectionConfig),

    /// Disconnect from the device, if connected.
    Disconnect,

    /// Put this message on the wire.
    Write(SerialMessage),

    /// Put these bytes on the wire.
    WriteBytes(SerialMessageBytes),

    /// Start receiving the device's output, line by line.
    ObserveLogs,

    /// Start receiving lifecycle events:
    /// connects, disconnects, and errors.
    ObserveEvents,

    /// Check build options against the server's rules.
    Validate(Vec<UserDefine>),
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::ListDevices => write!(f, "list devices"),
            Action::Connect(config) => write!(f, "connect: {config}"),
            Action::Disconnect => write!(f, "disconnect"),
            Action::Write(msg) => write!(f, "write: {msg}"),
            Action::WriteBytes(bytes) => {
                write!(f, "write: [{:?}]..", &bytes[0..bytes.len().min(16)])
            }
            Action::ObserveLogs => write!(f, "observe logs"),
            Action::ObserveEvents => write!(f, "observe events"),
            Action::Validate(options) => write!(f, "validate {} option(s)", options.len()),
        }
    }
}

impl Action {
    /// Create a connect action.
    pub fn connect(port: &str, baud_rate: u32) -> Self {
        Self::Connect(ConnectionConfig::new(port, baud_rate))
    }

    /// An example of connecting to a device.
    pub fn example_connect() -> Self {
        Self::connect("/dev/ttyUSB0", 420_000)
    }

    /// Create a write action.
    pub fn write(message: &str) -> Self {
        Self::Write(message.into())
    }

    /// An example of writing a message.
    pub fn example_write() -> Self {
        Self::write("This is a message")
    }

    /// Create a write bytes action.
    pub fn write_bytes(bytes: &[u8]) -> Self {
        Self::WriteBytes(bytes.to_vec())
    }

    /// An example of validating options.
    pub fn example_validate() -> Self {
        Self::Validate(validation::example_options())
    }

    /// Turn an action into serialized json.
    pub fn serialize(&self) -> Result<String, error::Error> {
        serde_json::to_string(self)
            .map_err(|e| error::Error::Internal(format!("Could not serialize action: {e}")))
    }
}

/// A response type of "sync nature"- a direct response to a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Sync {
    /// The devices available, ordered by path.
    Devices(Vec<DeviceDescriptor>),

    /// Now connected.
    Connected(ConnectionConfig),

    /// Now disconnected.
    Disconnected,

    /// The write action was successful.
    WriteOk,

    /// Now receiving device output.
    ObservingLogs,

    /// Now receiving lifecycle events.
    ObservingEvents,

    /// The outcome of validating options.
    /// Empty means valid.
    Validated(Vec<ValidationFailure>),
}

/// An async response type- might originate on the server side at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Async {
    /// The device said something.
    Log(SerialMessage),

    /// An event.
    Event(events::TimestampedEvent),
}

/// Responses the server will send to connected users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Response {
    /// A synchronous response in the sense that it's sent directly after a user
    /// request.
    Sync(Sync),

    /// An async message- the server might send this at any time and not in response to any
    /// particular request.
    Async(Async),
}

impl Response {
    pub(crate) fn devices(devices: Vec<DeviceDescriptor>) -> Self {
        Self::Sync(Sync::Devices(devices))
    }

    /// An example of a device listing.
    pub fn example_devices() -> Self {
        Self::devices(vec![
            DeviceDescriptor {
                path: "/dev/ttyUSB0".into(),
                label: "CP2102 USB to UART Bridge Controller".into(),
                vid: Some(0x10c4),
                pid: Some(0xea60),
                serial_number: Some("0001".into()),
                manufacturer: Some("Silicon Labs".into()),
                product: Some("CP2102 USB to UART Bridge Controller".into()),
            },
            DeviceDescriptor::new("/dev/ttyS0", "Serial device"),
        ])
    }

    pub(crate) fn connected(config: ConnectionConfig) -> Self {
        Self::Sync(Sync::Connected(config))
    }

    pub(crate) fn disconnected() -> Self {
        Self::Sync(Sync::Disconnected)
    }

    pub(crate) fn write_ok() -> Self {
        Self::Sync(Sync::WriteOk)
    }

    pub(crate) fn observing_logs() -> Self {
        Self::Sync(Sync::ObservingLogs)
    }

    pub(crate) fn observing_events() -> Self {
        Self::Sync(Sync::ObservingEvents)
    }

    pub(crate) fn validated(failures: Vec<ValidationFailure>) -> Self {
        Self::Sync(Sync::Validated(failures))
    }

    /// An example of validation finding problems.
    pub fn example_validated() -> Self {
        Self::validated(vec![
            ValidationFailure::NoneEnabledInCategory {
                category: "900 MHz".into(),
            },
            ValidationFailure::TooShort {
                key: UserDefineKey::BindingPhrase,
                description: "Custom binding phrase".into(),
                min_length: 6,
                length: 3,
            },
        ])
    }

    pub(crate) fn log(message: SerialMessage) -> Self {
        Self::Async(Async::Log(message))
    }

    /// An example of device output. These are async and might appear at any time after a user has
    /// started observing logs.
    pub fn example_log() -> Self {
        Self::log("ExpressLRS v3.3.0, booting".into())
    }

    pub(crate) fn event(event: events::TimestampedEvent) -> Self {
        Self::Async(Async::Event(event))
    }

    /// An example of a lifecycle event.
    pub fn example_event() -> Self {
        Self::event(events::TimestampedEvent::new(
            events::LifecycleEvent::Connected,
        ))
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Sync(Sync::Devices(devices)) => {
                write!(f, "Devices: {}", devices.iter().map(|d| &d.path).join(", "))
            }
            Response::Sync(Sync::Connected(config)) => write!(f, "Connected to {config}"),
            Response::Sync(Sync::Disconnected) => write!(f, "Disconnected"),
            Response::Sync(Sync::WriteOk) => write!(f, "Write ok"),
            Response::Sync(Sync::ObservingLogs) => write!(f, "Log subscription ok"),
            Response::Sync(Sync::ObservingEvents) => write!(f, "Event subscription ok"),
            Response::Sync(Sync::Validated(failures)) => {
                write!(f, "Validated, {} problem(s)", failures.len())
            }
            Response::Async(Async::Log(message)) => write!(f, "Log: `{message}`"),
            Response::Async(Async::Event(event)) => write!(f, "Event: `{event}`"),
        }
    }
}

/// A fallible response.
pub type ResponseResult = Result<Response, error::Error>;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn action_json_shape() {
        assert_eq!(
            Action::example_connect().serialize().unwrap(),
            r#"{"Connect":{"port":"/dev/ttyUSB0","baud_rate":420000}}"#
        );
        assert_eq!(Action::Disconnect.serialize().unwrap(), r#""Disconnect""#);
        assert_eq!(
            Action::write("hi").serialize().unwrap(),
            r#"{"Write":"hi"}"#
        );
    }

    #[test]
    fn validate_action_from_json() {
        let request = r#"{"Validate":[{"key":"BINDING_PHRASE","enabled":true,"value":"abc"}]}"#;

        let action: Action = serde_json::from_str(request).unwrap();

        assert_eq!(
            action,
            Action::Validate(vec![UserDefine::with_value(
                UserDefineKey::BindingPhrase,
                true,
                "abc"
            )])
        );
    }

    #[test]
    fn error_response_json() {
        let response: ResponseResult = Err(error::Error::AlreadyBusy);

        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"Err":"AlreadyBusy"}"#
        );
    }

    #[test]
    fn examples_display() {
        for response in [
            Response::example_devices(),
            Response::example_validated(),
            Response::example_log(),
            Response::example_event(),
        ] {
            assert!(!response.to_string().is_empty());
        }
    }
}

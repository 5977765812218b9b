//! In-memory serial devices, useful to exercise sessions without the actual serial ports.

use std::{
    collections::BTreeMap,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    sync::mpsc,
};
use tracing::{debug, info, info_span, trace, Instrument};

use crate::{
    error::Error,
    serial::SerialMessageBytes,
    transport::{ConnectionConfig, DeviceDescriptor, Port},
};

/// How many bytes may be in flight in each direction of a mock connection.
const MOCK_BUFFER_SIZE: usize = 8 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
enum DeviceInput {
    Output(SerialMessageBytes),
    Stall,
    Unplug,
}

/// I/O errors an open port runs into, set from the device side.
#[derive(Debug, Default)]
struct PortFailures {
    read: Option<String>,
    write: Option<String>,
}

#[derive(Debug)]
struct MockDeviceState {
    // Feeds the task emulating the device for the current connection
    input: Option<mpsc::UnboundedSender<DeviceInput>>,

    // Shared with the port of the current connection
    port_failures: Arc<Mutex<PortFailures>>,

    open_failure: Option<String>,
    close_failure: Option<String>,
    loopback: bool,
}

/// A device living in a [`MockTransport`].
///
/// Clones refer to the same device.
#[derive(Debug, Clone)]
pub struct MockDevice {
    path: String,
    label: String,
    open: Arc<AtomicBool>,
    state: Arc<Mutex<MockDeviceState>>,
}

impl MockDevice {
    fn new(path: &str, label: &str) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
            open: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(MockDeviceState {
                input: None,
                port_failures: Default::default(),
                open_failure: None,
                close_failure: None,
                loopback: true,
            })),
        }
    }

    /// The path the device is found at.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether a port to this device is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Make the device print something.
    /// Returns `false` if nobody is connected to see it.
    pub fn emit<B: AsRef<[u8]>>(&self, bytes: B) -> bool {
        let state = lock(&self.state);

        match &state.input {
            Some(input) => input
                .send(DeviceInput::Output(bytes.as_ref().to_vec()))
                .is_ok(),
            None => false,
        }
    }

    /// Make the device print a line.
    pub fn emit_line(&self, line: &str) -> bool {
        self.emit(format!("{line}\n"))
    }

    /// Pull the plug.
    /// An open port will see the device go away.
    pub fn unplug(&self) {
        let mut state = lock(&self.state);

        if let Some(input) = state.input.take() {
            debug!(path = %self.path, "Unplugging");
            let _ = input.send(DeviceInput::Unplug);
        }
    }

    /// Stop taking bytes, the way a device holding CTS low would.
    /// Writes to the port then wait until the connection ends.
    pub fn stall(&self) {
        if let Some(input) = &lock(&self.state).input {
            let _ = input.send(DeviceInput::Stall);
        }
    }

    /// Break the current connection: reading from the port fails with an I/O error.
    pub fn fail_reads(&self, reason: &str) {
        let mut state = lock(&self.state);
        lock(&state.port_failures).read = Some(reason.into());

        // Wakes up a pending read.
        if let Some(input) = state.input.take() {
            let _ = input.send(DeviceInput::Unplug);
        }
    }

    /// Writing to the port of the current connection fails with an I/O error.
    pub fn fail_writes(&self, reason: &str) {
        lock(&lock(&self.state).port_failures).write = Some(reason.into());
    }

    /// While set, opening the device fails with the given reason.
    pub fn set_open_failure(&self, reason: Option<&str>) {
        lock(&self.state).open_failure = reason.map(Into::into);
    }

    /// While set, ports opened from now on fail to close with the given reason.
    pub fn set_close_failure(&self, reason: Option<&str>) {
        lock(&self.state).close_failure = reason.map(Into::into);
    }

    /// Whether bytes written to the device are sent back (the default).
    /// Applies to connections made from now on.
    pub fn set_loopback(&self, loopback: bool) {
        lock(&self.state).loopback = loopback;
    }

    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(&self.path, &self.label)
    }
}

/// A transport whose devices are [`MockDevice`]s.
///
/// Clones refer to the same set of devices.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    devices: Arc<Mutex<BTreeMap<String, MockDevice>>>,
    enumeration_failure: Arc<Mutex<Option<String>>>,
    open_handles: Arc<AtomicUsize>,
}

impl MockTransport {
    /// A transport without devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device at the given path.
    /// Replaces any device previously at that path.
    pub fn add_device(&self, path: &str, label: &str) -> MockDevice {
        let device = MockDevice::new(path, label);
        info!(%path, "Adding mock device");

        lock(&self.devices).insert(path.into(), device.clone());
        device
    }

    /// Remove the device at the given path from listings, unplugging it.
    pub fn remove_device(&self, path: &str) {
        if let Some(device) = lock(&self.devices).remove(path) {
            device.unplug();
        }
    }

    /// While set, listing devices fails with the given reason.
    pub fn set_enumeration_failure(&self, reason: Option<&str>) {
        *lock(&self.enumeration_failure) = reason.map(Into::into);
    }

    /// How many ports from this transport are open right now.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub(crate) fn devices(&self) -> Result<Vec<DeviceDescriptor>, Error> {
        if let Some(reason) = lock(&self.enumeration_failure).as_ref() {
            return Err(Error::Enumeration(reason.clone()));
        }

        Ok(lock(&self.devices)
            .values()
            .map(MockDevice::descriptor)
            .collect())
    }

    pub(crate) fn open_port(&self, config: &ConnectionConfig) -> Result<MockPort, Error> {
        let device = lock(&self.devices)
            .get(&config.port)
            .cloned()
            .ok_or_else(|| Error::TransportOpen(format!("{}: no such device", config.port)))?;

        if config.baud_rate == 0 {
            return Err(Error::TransportOpen(format!(
                "{}: a baud rate of zero is not usable",
                config.port
            )));
        }

        let mut state = lock(&device.state);

        if let Some(reason) = &state.open_failure {
            return Err(Error::TransportOpen(format!("{}: {reason}", config.port)));
        }

        if device.open.swap(true, Ordering::SeqCst) {
            return Err(Error::TransportOpen(format!("{}: device busy", config.port)));
        }

        let (port_side, device_side) = tokio::io::duplex(MOCK_BUFFER_SIZE);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        state.input = Some(input_tx);
        state.port_failures = Default::default();

        tokio::spawn(
            run_device(device_side, input_rx, state.loopback)
                .instrument(info_span!("mock", path = %config.port)),
        );

        self.open_handles.fetch_add(1, Ordering::SeqCst);

        Ok(MockPort {
            stream: port_side,
            device_open: device.open.clone(),
            open_handles: self.open_handles.clone(),
            close_failure: state.close_failure.clone(),
            failures: state.port_failures.clone(),
        })
    }
}

async fn run_device(
    device_side: DuplexStream,
    mut input: mpsc::UnboundedReceiver<DeviceInput>,
    loopback: bool,
) {
    let (mut reader, mut writer) = tokio::io::split(device_side);
    let mut buffer = vec![0; 1024];
    let mut stalled = false;

    loop {
        tokio::select! {
            input = input.recv() => match input {
                Some(DeviceInput::Output(bytes)) => {
                    trace!("Device output: `{:?}`", &bytes[..bytes.len().min(32)]);
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(DeviceInput::Stall) => {
                    debug!("Stalling");
                    stalled = true;
                }
                Some(DeviceInput::Unplug) | None => break,
            },
            read = reader.read(&mut buffer), if !stalled => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if loopback && writer.write_all(&buffer[..n]).await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    // Dropping our side makes the port read end of file.
    debug!("Mock device stopped");
}

/// The port side of a mock connection.
#[derive(Debug)]
pub(crate) struct MockPort {
    stream: DuplexStream,
    device_open: Arc<AtomicBool>,
    open_handles: Arc<AtomicUsize>,
    close_failure: Option<String>,
    failures: Arc<Mutex<PortFailures>>,
}

impl MockPort {
    fn read_failure(&self) -> Option<io::Error> {
        let reason = lock(&self.failures).read.clone()?;
        Some(io::Error::new(io::ErrorKind::Other, reason))
    }

    fn write_failure(&self) -> Option<io::Error> {
        let reason = lock(&self.failures).write.clone()?;
        Some(io::Error::new(io::ErrorKind::Other, reason))
    }
}

impl Drop for MockPort {
    fn drop(&mut self) {
        self.device_open.store(false, Ordering::SeqCst);
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Port for MockPort {
    fn close(self: Box<Self>) -> Result<(), Error> {
        match &self.close_failure {
            Some(reason) => Err(Error::TransportClose(reason.clone())),
            None => Ok(()),
        }
    }
}

impl AsyncRead for MockPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(e) = self.read_failure() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(e) = self.write_failure() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

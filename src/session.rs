//! The session manager owns the one connection to a serial device.
//!
//! It runs as a task, and is talked to via a [`SessionHandle`].
//! Requests are handled one at a time, so only one connect or disconnect is ever in flight.
//! While connected a read loop task owns the port, publishing lines as they arrive
//! and putting writes on the wire. Reading, writing, and cancellation make progress independently,
//! so a device which stops taking bytes can still be disconnected from.

use std::fmt::{Debug, Display};

use futures::{
    channel::{mpsc, oneshot},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::WriteHalf,
    sync::watch,
    task::{JoinError, JoinHandle},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    config::Config,
    error::Error,
    events::{EventBus, LifecycleEvent, Subscription, TimestampedEvent, Topic},
    serial::{
        codecs::lines::LinesCodec, error::SerialPortError, SerialMessage, SerialMessageBytes,
    },
    transport::{ConnectionConfig, DeviceDescriptor, Port, Transport},
};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No port is open.
    Disconnected,

    /// A port is being opened.
    Connecting,

    /// A port is open and being read from.
    Connected,

    /// The port is being closed.
    Disconnecting,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

#[derive(Debug)]
enum Action {
    ListDevices,
    Connect(ConnectionConfig),
    Disconnect,
    Write(SerialMessageBytes),
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::ListDevices => write!(f, "list devices"),
            Action::Connect(config) => write!(f, "connect: {config}"),
            Action::Disconnect => write!(f, "disconnect"),
            Action::Write(bytes) => write!(f, "write {} byte(s)", bytes.len()),
        }
    }
}

#[derive(Debug)]
enum SessionResponse {
    Devices(Vec<DeviceDescriptor>),
    Done,
}

impl SessionResponse {
    fn try_into_devices(self) -> Result<Vec<DeviceDescriptor>, Self> {
        if let Self::Devices(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

struct Request {
    action: Action,
    response: oneshot::Sender<Result<SessionResponse, Error>>,
}

impl Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("action", &self.action)
            .finish()
    }
}

#[derive(Debug)]
enum ReadLoopExit {
    /// Asked to stop.
    Cancelled,

    /// The port failed, or the device went away.
    Failed(String),
}

type ReadLoopOutcome = (Box<dyn Port>, ReadLoopExit);

struct ActiveConnection {
    config: ConnectionConfig,
    outgoing: mpsc::UnboundedSender<SerialMessageBytes>,
    cancel: CancellationToken,
    read_loop: JoinHandle<ReadLoopOutcome>,
}

struct Session {
    transport: Box<dyn Transport>,
    codec: LinesCodec,
    skip_ports: Vec<String>,

    /// Requests from handles.
    requests: mpsc::UnboundedReceiver<Request>,

    state: watch::Sender<SessionState>,
    bus: EventBus,

    /// Present while not [`SessionState::Disconnected`].
    active: Option<ActiveConnection>,
}

/// A handle to a running session.
///
/// Clones talk to the same session.
/// The session stops (disconnecting if needed) when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<SessionState>,
    bus: EventBus,
}

impl SessionHandle {
    /// Start a session over the given transport.
    ///
    /// Fails if the configuration is not valid.
    pub fn new(transport: Box<dyn Transport>, config: &Config) -> Result<Self, Error> {
        config.validate()?;

        let (requests_tx, requests_rx) = mpsc::unbounded();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let bus = EventBus::new(config.event_capacity);

        info!(transport = transport.name(), "Starting session");

        let session = Session {
            transport,
            codec: config.lines_codec()?,
            skip_ports: config.skip_ports.clone(),
            requests: requests_rx,
            state: state_tx,
            bus: bus.clone(),
            active: None,
        };

        tokio::spawn(session.run().instrument(info_span!("Session")));

        Ok(Self {
            requests: requests_tx,
            state: state_rx,
            bus,
        })
    }

    async fn perform_action(&self, action: Action) -> Result<SessionResponse, Error> {
        let (tx, rx) = oneshot::channel();

        self.requests
            .unbounded_send(Request {
                action,
                response: tx,
            })
            .map_err(|_| Error::Internal("The session is no longer running".into()))?;

        rx.await
            .map_err(|_| Error::Internal("The session dropped the request".into()))?
    }

    /// List the devices which may be connected to, ordered by path.
    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, Error> {
        self.perform_action(Action::ListDevices)
            .await?
            .try_into_devices()
            .map_err(|response| Error::Internal(format!("Unexpected response: {response:?}")))
    }

    /// Open a port and start publishing what the device says.
    ///
    /// Fails with [`Error::AlreadyBusy`] unless disconnected.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<(), Error> {
        self.perform_action(Action::Connect(config)).await?;
        Ok(())
    }

    /// Stop reading and close the port.
    ///
    /// Succeeds without doing anything if already disconnected.
    /// The session ends up disconnected even if closing the port fails.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.perform_action(Action::Disconnect).await?;
        Ok(())
    }

    /// Put bytes on the wire.
    /// The configured write delimiter is appended.
    pub async fn write(&self, bytes: SerialMessageBytes) -> Result<(), Error> {
        self.perform_action(Action::Write(bytes)).await?;
        Ok(())
    }

    /// The current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A receiver which is notified when the state changes.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Receive device output from now on.
    pub fn subscribe_logs(&self) -> Subscription<SerialMessage> {
        self.bus.subscribe_logs()
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe_events(&self) -> Subscription<TimestampedEvent> {
        self.bus.subscribe_events()
    }
}

/// Put queued writes on the wire, one after the other.
/// Returns when nobody can queue writes anymore, or the port fails.
async fn write_outgoing(
    wire: &mut FramedWrite<WriteHalf<Box<dyn Port>>, LinesCodec>,
    outgoing: &mut mpsc::UnboundedReceiver<SerialMessageBytes>,
) -> Result<(), SerialPortError> {
    while let Some(bytes) = outgoing.next().await {
        trace!("Putting {} byte(s) on the wire", bytes.len());
        wire.send(bytes).await?;
    }

    Ok(())
}

async fn read_loop(
    port: Box<dyn Port>,
    codec: LinesCodec,
    mut outgoing: mpsc::UnboundedReceiver<SerialMessageBytes>,
    cancel: CancellationToken,
    logs: Topic<SerialMessage>,
) -> ReadLoopOutcome {
    let (reader, writer) = tokio::io::split(port);
    let mut lines = FramedRead::new(reader, codec.clone());
    let mut wire = FramedWrite::new(writer, codec);

    let exit = {
        // A write waiting on the device must neither hold up reading nor cancellation.
        let writes = write_outgoing(&mut wire, &mut outgoing);
        tokio::pin!(writes);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break ReadLoopExit::Cancelled,

                frame = lines.next() => match frame {
                    Some(Ok(line)) => {
                        let message = SerialMessage::new_lossy(line);
                        trace!(%message, "Received");
                        logs.publish(message);
                    }
                    Some(Err(e)) => break ReadLoopExit::Failed(e.to_string()),
                    None => break ReadLoopExit::Failed("The device closed the connection".into()),
                },

                written = &mut writes => match written {
                    Ok(()) => break ReadLoopExit::Cancelled,
                    Err(e) => break ReadLoopExit::Failed(e.to_string()),
                },
            }
        }
    };

    debug!(?exit, "Read loop done");

    (lines.into_inner().unsplit(wire.into_inner()), exit)
}

impl Session {
    fn set_state(&self, state: SessionState) {
        debug!(%state, "State change");
        self.state.send_replace(state);
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, Error> {
        let devices = self
            .transport
            .list_devices()?
            .into_iter()
            .filter(|device| {
                let skip = self
                    .skip_ports
                    .iter()
                    .any(|pattern| device.path.contains(pattern.as_str()));
                if skip {
                    debug!(%device, "Skipping");
                }
                !skip
            })
            .collect();

        Ok(devices)
    }

    fn connect(&mut self, config: ConnectionConfig) -> Result<(), Error> {
        let state = self.current_state();
        if state != SessionState::Disconnected {
            debug!(%state, "Refusing to connect");
            return Err(Error::AlreadyBusy);
        }

        let _span = info_span!("connect", %config).entered();
        self.set_state(SessionState::Connecting);

        let port = match self.transport.open(&config) {
            Ok(port) => port,
            Err(e) => {
                warn!(%e, "Could not open");
                self.set_state(SessionState::Disconnected);
                self.bus
                    .publish_event(LifecycleEvent::ErrorOccurred(e.to_string()));
                return Err(e);
            }
        };

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();

        let read_loop = tokio::spawn(
            read_loop(
                port,
                self.codec.clone(),
                outgoing_rx,
                cancel.clone(),
                self.bus.logs().clone(),
            )
            .instrument(info_span!("read loop", port = %config.port)),
        );

        info!("Connected");
        self.active = Some(ActiveConnection {
            config,
            outgoing: outgoing_tx,
            cancel,
            read_loop,
        });
        self.set_state(SessionState::Connected);
        self.bus.publish_event(LifecycleEvent::Connected);

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Error> {
        let Some(active) = self.active.take() else {
            debug!("Already disconnected");
            return Ok(());
        };

        self.set_state(SessionState::Disconnecting);

        active.cancel.cancel();
        let outcome = active.read_loop.await;

        self.finish(active.config, outcome)
    }

    /// The read loop stopped by itself.
    fn read_loop_ended(&mut self, outcome: Result<ReadLoopOutcome, JoinError>) {
        let Some(active) = self.active.take() else {
            return;
        };

        self.set_state(SessionState::Disconnecting);

        // Closing problems are published as events, nobody is waiting for a reply here.
        let _ = self.finish(active.config, outcome);
    }

    /// Close the port the read loop gave back, then report being disconnected.
    fn finish(
        &mut self,
        config: ConnectionConfig,
        outcome: Result<ReadLoopOutcome, JoinError>,
    ) -> Result<(), Error> {
        let _span = info_span!("disconnect", %config).entered();

        let (closed, failure) = match outcome {
            Ok((port, exit)) => {
                let failure = match exit {
                    ReadLoopExit::Cancelled => None,
                    ReadLoopExit::Failed(reason) => Some(Error::TransportRead(reason)),
                };
                (port.close(), failure)
            }
            // The port went down with the task.
            Err(e) => (Ok(()), Some(Error::Internal(format!("Read loop died: {e}")))),
        };

        if let Some(failure) = failure {
            warn!(%failure, "Session failed");
            self.bus
                .publish_event(LifecycleEvent::ErrorOccurred(failure.to_string()));
        }

        if let Err(e) = &closed {
            warn!(%e, "Problem closing port");
            self.bus
                .publish_event(LifecycleEvent::ErrorOccurred(e.to_string()));
        }

        info!("Disconnected");
        self.set_state(SessionState::Disconnected);
        self.bus.publish_event(LifecycleEvent::Disconnected);

        closed
    }

    fn write(&self, bytes: SerialMessageBytes) -> Result<(), Error> {
        let active = self.active.as_ref().ok_or(Error::NotConnected)?;

        active
            .outgoing
            .unbounded_send(bytes)
            .map_err(|_| Error::NotConnected)
    }

    async fn handle_request(&mut self, Request { action, response }: Request) {
        debug!("Got action request: `{action}`");

        let reply = match action {
            Action::ListDevices => self.list_devices().map(SessionResponse::Devices),
            Action::Connect(config) => self.connect(config).map(|_| SessionResponse::Done),
            Action::Disconnect => self.disconnect().await.map(|_| SessionResponse::Done),
            Action::Write(bytes) => self.write(bytes).map(|_| SessionResponse::Done),
        };

        if response.send(reply).is_err() {
            debug!("Requester went away before the reply");
        }
    }

    async fn run(mut self) {
        loop {
            let requests = &mut self.requests;
            let active = &mut self.active;

            let read_loop_ended = async move {
                match active {
                    Some(active) => (&mut active.read_loop).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                request = requests.next() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                outcome = read_loop_ended => self.read_loop_ended(outcome),
            }
        }

        info!("No more handles, stopping");
        if let Err(e) = self.disconnect().await {
            warn!(%e, "Problem disconnecting on the way out");
        }
    }
}

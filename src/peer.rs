use std::{net::SocketAddr, sync::Arc};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, info_span, Instrument};

use crate::{
    actions::{self, ResponseResult},
    error,
    events::Subscription,
    session::SessionHandle,
    validation::RuleSet,
};

/// Forward whatever a subscription yields to the user, wrapped as a response.
async fn forward<T, F>(
    mut subscription: Subscription<T>,
    user_sender: mpsc::UnboundedSender<ResponseResult>,
    into_response: F,
) where
    T: Clone + Send + 'static,
    F: Fn(T) -> actions::Response,
{
    info!("Starting forwarder");

    while let Some(item) = subscription.recv().await {
        if user_sender.send(Ok(into_response(item))).is_err() {
            debug!("Send error");
            break;
        }
    }

    debug!("Forwarder closed")
}

pub(crate) struct Peer {
    // Who is on the other end, for logs
    addr: SocketAddr,

    // Where to put responses to this peer's requests
    sender: mpsc::UnboundedSender<ResponseResult>,

    // For reading requests to us
    requests: mpsc::UnboundedReceiver<PeerRequest>,

    // The session shared by every peer
    session: SessionHandle,

    rules: Arc<RuleSet>,

    // Feeds this peer observes
    log_forwarder: Option<JoinHandle<()>>,
    event_forwarder: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub(crate) enum PeerRequest {
    UserAction(actions::Action),

    /// Shut down the peer, cleaning up as necessary.
    Shutdown,
}

pub(crate) struct PeerHandle {
    requests: mpsc::UnboundedSender<PeerRequest>,
    join_handle: JoinHandle<()>,
}

impl PeerHandle {
    pub(crate) fn new(
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<ResponseResult>,
        session: SessionHandle,
        rules: Arc<RuleSet>,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let peer = Peer {
            addr,
            sender,
            requests: requests_rx,
            session,
            rules,
            log_forwarder: None,
            event_forwarder: None,
        };

        let join_handle = tokio::spawn(peer.run().instrument(info_span!("Peer", %addr)));

        Self {
            requests: requests_tx,
            join_handle,
        }
    }

    pub(crate) fn send(&self, request: actions::Action) {
        if self.requests.send(PeerRequest::UserAction(request)).is_err() {
            debug!("Peer is gone, dropping request");
        }
    }

    pub(crate) async fn shutdown(self) {
        debug!("Shutting down");
        // If the peer already stopped, joining is all there is left to do.
        let _ = self.requests.send(PeerRequest::Shutdown);

        if let Err(e) = self.join_handle.await {
            debug!(?e, "Peer join error");
        }
        debug!("Shutdown complete");
    }
}

impl Peer {
    async fn run(mut self) {
        info!(addr = %self.addr, "Peer started");

        while let Some(request) = self.requests.recv().await {
            match request {
                PeerRequest::UserAction(action) => {
                    let span = info_span!("Action", %action);
                    let response = self.do_user_action(action).instrument(span).await;

                    if self.sender.send(response).is_err() {
                        debug!("Websocket writer gone");
                        break;
                    }
                }
                PeerRequest::Shutdown => {
                    debug!("Shutting down peer");
                    break;
                }
            }
        }

        for forwarder in [self.log_forwarder.take(), self.event_forwarder.take()]
            .into_iter()
            .flatten()
        {
            forwarder.abort();
        }
    }

    fn observe_logs(&mut self) -> ResponseResult {
        if self.log_forwarder.is_some() {
            return Err(error::Error::BadUsage(
                "Already observing logs".to_string(),
            ));
        }

        let forwarder = tokio::spawn(
            forward(
                self.session.subscribe_logs(),
                self.sender.clone(),
                actions::Response::log,
            )
            .instrument(info_span!("Log forwarder")),
        );
        self.log_forwarder = Some(forwarder);

        Ok(actions::Response::observing_logs())
    }

    fn observe_events(&mut self) -> ResponseResult {
        if self.event_forwarder.is_some() {
            return Err(error::Error::BadUsage(
                "Already observing events".to_string(),
            ));
        }

        let forwarder = tokio::spawn(
            forward(
                self.session.subscribe_events(),
                self.sender.clone(),
                actions::Response::event,
            )
            .instrument(info_span!("Event forwarder")),
        );
        self.event_forwarder = Some(forwarder);

        Ok(actions::Response::observing_events())
    }

    async fn do_user_action(&mut self, action: actions::Action) -> ResponseResult {
        info!("client requested action: {action}");

        match action {
            actions::Action::ListDevices => {
                let devices = self.session.list_devices().await?;
                Ok(actions::Response::devices(devices))
            }
            actions::Action::Connect(config) => {
                self.session.connect(config.clone()).await?;
                Ok(actions::Response::connected(config))
            }
            actions::Action::Disconnect => {
                self.session.disconnect().await?;
                Ok(actions::Response::disconnected())
            }
            actions::Action::Write(message) => {
                self.session.write(message.into_bytes()).await?;
                Ok(actions::Response::write_ok())
            }
            actions::Action::WriteBytes(bytes) => {
                self.session.write(bytes).await?;
                Ok(actions::Response::write_ok())
            }
            actions::Action::ObserveLogs => self.observe_logs(),
            actions::Action::ObserveEvents => self.observe_events(),
            actions::Action::Validate(options) => {
                Ok(actions::Response::validated(self.rules.validate(&options)))
            }
        }
    }
}

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};
use futures::{sink::Sink, stream::Stream, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    actions::{Action, ResponseResult},
    error::Error,
    peer::PeerHandle,
    session::SessionHandle,
    validation::RuleSet,
};

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(session): Extension<SessionHandle>,
    Extension(rules): Extension<Arc<RuleSet>>,
) -> impl IntoResponse {
    match user_agent {
        Some(TypedHeader(user_agent)) => info!(%addr, user_agent = user_agent.as_str(), "User connected"),
        None => info!(%addr, "User connected"),
    }

    ws.on_upgrade(move |socket| {
        handle_websocket(socket, addr, session, rules).instrument(info_span!("User", %addr))
    })
}

/// Turn the contents of a frame into an action.
/// Binary frames are accepted as long as they hold UTF-8 JSON.
fn decode_request(message: Message) -> Option<Result<Action, Error>> {
    let request = match message {
        Message::Text(text) => text,
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                return Some(Err(Error::BadJson {
                    request: String::from_utf8_lossy(e.as_bytes()).into_owned(),
                    problem: e.to_string(),
                }))
            }
        },
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => return None,
    };
    trace!(%request, "Request");

    let action: Result<Action, _> = serde_json::from_str(&request);

    Some(action.map_err(|e| Error::BadJson {
        problem: e.to_string(),
        request,
    }))
}

async fn read<S>(mut frames: S, responses: mpsc::UnboundedSender<ResponseResult>, peer: PeerHandle)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let message = match frames.next().await {
            Some(Ok(Message::Close(_))) | None => {
                debug!("User left");
                break;
            }
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(%e, "Socket error");
                break;
            }
        };

        match decode_request(message) {
            Some(Ok(action)) => peer.send(action),
            Some(Err(problem)) => {
                if responses.send(Err(problem)).is_err() {
                    break;
                }
            }
            None => trace!("Control frame"),
        }
    }

    peer.shutdown().await;
}

async fn write(
    mut frames: impl Sink<Message> + Unpin,
    mut responses: mpsc::UnboundedReceiver<ResponseResult>,
) {
    while let Some(response) = responses.recv().await {
        match &response {
            Ok(response) => debug!(%response, "Responding"),
            Err(e) => info!(%e, "Responding with error"),
        }

        let text = match serde_json::to_string(&response) {
            Ok(text) => text,
            Err(e) => {
                warn!(%e, "Could not serialize response");
                continue;
            }
        };

        if frames.send(Message::Text(text)).await.is_err() {
            debug!("Socket closed while responding");
            return;
        }
    }
}

async fn handle_websocket(
    websocket: WebSocket,
    addr: SocketAddr,
    session: SessionHandle,
    rules: Arc<RuleSet>,
) {
    let (sink, stream) = websocket.split();
    let (responses_tx, responses_rx) = mpsc::unbounded_channel();

    let peer = PeerHandle::new(addr, responses_tx.clone(), session, rules);

    let writer = tokio::spawn(write(sink, responses_rx).instrument(info_span!("Write")));

    read(stream, responses_tx, peer)
        .instrument(info_span!("Read"))
        .await;

    // Dropping the sink closes the TCP connection.
    writer.abort();
}

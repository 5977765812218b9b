#![allow(dead_code)]

use std::time::Duration;

use axum::http::StatusCode;
use color_eyre::Result;
use futures::SinkExt;
use futures::StreamExt;
use serial_monitor::{
    actions::{self, Action, Response},
    config::Config,
    events::LifecycleEvent,
    mock::{MockDevice, MockTransport},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const MOCK_PORT: &str = "/dev/ttyMOCK0";

#[macro_export]
macro_rules! assert_result_error {
    ($response:ident, $e:pat) => {
        assert!(matches!($response, Result::Err($e)));
    };
}

#[macro_export]
macro_rules! assert_sync {
    ($response:ident, $sync:pat) => {
        assert!(matches!(
            $response,
            Ok(serial_monitor::actions::Response::Sync($sync))
        ));
    };
}

/// A server over a mock transport with a single device.
pub struct MockServer {
    pub port: u16,
    pub mock: MockTransport,
    pub device: MockDevice,
}

pub async fn start_server_with_config(config: Config) -> MockServer {
    let mock = MockTransport::new();
    let device = mock.add_device(MOCK_PORT, "mock");

    let (port_tx, port_rx) = oneshot::channel();

    let transport = Box::new(mock.clone());
    tokio::spawn(async move {
        serial_monitor::server::run_any_port(config, transport, port_tx).await
    });

    let port = port_rx
        .await
        .expect("Server should reply with allocated port");

    MockServer { port, mock, device }
}

pub async fn start_server() -> MockServer {
    start_server_with_config(Config::default()).await
}

pub async fn connect(port: u16) -> Result<Client> {
    info!("Connecting to server on port {port}");
    let (stream, http_response) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/client")).await?;

    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

pub async fn start_server_and_connect() -> Result<(MockServer, Client)> {
    let server = start_server().await;
    let client = connect(server.port).await?;

    Ok((server, client))
}

pub async fn receive(client: &mut Client) -> Result<actions::ResponseResult> {
    let response = timeout(Duration::from_secs(5), client.next())
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

    let response = response.to_text()?;
    let response = serde_json::from_str(response)?;

    Ok(response)
}

pub async fn send_receive(client: &mut Client, to_send: String) -> Result<actions::ResponseResult> {
    client.send(tungstenite::Message::Text(to_send)).await?;
    receive(client).await
}

pub async fn perform(client: &mut Client, action: Action) -> Result<actions::ResponseResult> {
    send_receive(client, action.serialize()?).await
}

/// Wait for the next lifecycle event on a client which observes events (and nothing else).
pub async fn next_event(client: &mut Client) -> Result<LifecycleEvent> {
    match receive(client).await?? {
        Response::Async(actions::Async::Event(event)) => Ok(event.inner),
        other => Err(color_eyre::eyre::eyre!("Expected an event, got {other:?}")),
    }
}

/// Wait for the next line of device output on a client which observes logs (and nothing else).
pub async fn next_log(client: &mut Client) -> Result<String> {
    match receive(client).await?? {
        Response::Async(actions::Async::Log(line)) => Ok(line.as_str().to_owned()),
        other => Err(color_eyre::eyre::eyre!("Expected a log line, got {other:?}")),
    }
}

/// A client observing lifecycle events.
pub async fn event_observer(port: u16) -> Result<Client> {
    let mut client = connect(port).await?;
    let response = perform(&mut client, Action::ObserveEvents).await??;
    assert_eq!(response, Response::Sync(actions::Sync::ObservingEvents));

    Ok(client)
}

/// A client observing device output.
pub async fn log_observer(port: u16) -> Result<Client> {
    let mut client = connect(port).await?;
    let response = perform(&mut client, Action::ObserveLogs).await??;
    assert_eq!(response, Response::Sync(actions::Sync::ObservingLogs));

    Ok(client)
}

/// A plain HTTP GET, returning the body.
pub async fn http_get(port: u16, path: &str) -> Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

    stream
        .write_all(
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await?;

    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response)).await??;

    let (head, body) = response
        .split_once("\r\n\r\n")
        .ok_or_else(|| color_eyre::eyre::eyre!("Malformed response: {response}"))?;
    assert!(head.starts_with("HTTP/1.1 200"), "Unexpected response: {head}");

    Ok(body.to_owned())
}

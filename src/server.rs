use std::{net::SocketAddr, sync::Arc};

use axum::{extract::Extension, response::IntoResponse, routing::get, Router};
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::Config, error::Error, session::SessionHandle, transport::Transport, websocket,
};

async fn run(
    config: Config,
    transport: Box<dyn Transport>,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
) -> Result<(), Error> {
    config.validate()?;

    let rules = Arc::new(config.rule_set()?);
    let session = SessionHandle::new(transport, &config)?;

    let app = Router::new()
        .route("/client", get(websocket::ws_handler))
        .route("/config", get(show_config))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Each websocket needs to be able to reach the session
                .layer(Extension(session))
                .layer(Extension(rules))
                .layer(Extension(config)),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0)));
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Could not bind to {addr}: {e}")))?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        if port_reply.send(addr.port()).is_err() {
            warn!("Nobody wanted to know which port was allocated");
        }
    }

    info!("listening on {}", addr);

    server
        .await
        .map_err(|e| Error::Internal(format!("Server stopped: {e}")))
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(
    config: Config,
    transport: Box<dyn Transport>,
    allocated_port: oneshot::Sender<u16>,
) -> Result<(), Error> {
    run(config, transport, None, Some(allocated_port)).await
}

/// Start the server on the configured port.
pub async fn run_on_port(config: Config, transport: Box<dyn Transport>) -> Result<(), Error> {
    let port = config.server_port;
    run(config, transport, Some(port), None).await
}

async fn show_config(Extension(config): Extension<Config>) -> impl IntoResponse {
    match config.serialize_pretty() {
        Ok(config) => config,
        Err(e) => e.to_string(),
    }
}

async fn show_version() -> impl IntoResponse {
    format!("Serial Monitor v{}\n", env!("CARGO_PKG_VERSION"))
}

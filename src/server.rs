//! HTTP server for device connections and health endpoints

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::health::{self, HealthMonitor};
use crate::relay::{DeviceRouter, DeviceSnapshot, Relay};
use crate::transport::{Connection, DEFAULT_QUEUE, Frame};
use crate::{Error, Result};

/// Device listing response
#[derive(Debug, Serialize)]
pub struct DeviceList {
    pub count: usize,
    pub devices: Vec<DeviceSnapshot>,
}

/// Bridge HTTP server
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    relay: Relay,
    monitor: HealthMonitor,
}

impl Server {
    #[must_use]
    pub const fn new(config: ServerConfig, relay: Relay, monitor: HealthMonitor) -> Self {
        Self {
            config,
            relay,
            monitor,
        }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route(&self.config.ws_path, get(ws_upgrade).with_state(self.relay.clone()))
            .merge(device_router(self.relay.router().clone()))
            .merge(health::api::router(self.monitor.clone()))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run until `shutdown` flips to true, then close every device
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot bind or the server fails
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(addr = %addr, ws_path = %self.config.ws_path, "bridge listening");

        let relay = self.relay.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                tracing::info!("shutting down, closing device connections");
                relay.shutdown();
            })
            .await
            .map_err(|e| Error::Transport(format!("server error: {e}")))?;

        Ok(())
    }
}

fn device_router(router: DeviceRouter) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/{device_id}", get(get_device))
        .with_state(router)
}

async fn list_devices(State(router): State<DeviceRouter>) -> Json<DeviceList> {
    let devices = router.devices().await;
    Json(DeviceList {
        count: devices.len(),
        devices,
    })
}

async fn get_device(
    State(router): State<DeviceRouter>,
    Path(device_id): Path<String>,
) -> std::result::Result<Json<DeviceSnapshot>, StatusCode> {
    router
        .device(&device_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn ws_upgrade(State(relay): State<Relay>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        // The session task owns the connection from here
        let _ = relay.accept(into_connection(socket));
    })
}

/// Bridge an upgraded socket onto a channel pair
///
/// The read pump ends on close or error, which drops the inbound sender and
/// lets the session see end of stream; it also ends once the session drops
/// its receiver. The write pump ends once the session drops its outbound
/// sender. The socket closes when both pumps have finished.
#[must_use]
pub fn into_connection(socket: WebSocket) -> Connection {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(DEFAULT_QUEUE);
    let (in_tx, in_rx) = mpsc::channel::<Frame>(DEFAULT_QUEUE);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let msg = match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(data) => Message::Binary(data),
            };
            if let Err(e) = sink.send(msg).await {
                tracing::debug!(error = %e, "device socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                // Session gone (closed, evicted, replaced): stop reading even
                // if the peer stays silent, so the socket is released
                () = in_tx.closed() => break,
            };
            let frame = match msg {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
                Some(Ok(Message::Binary(data))) => Frame::Binary(data),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "device socket read failed");
                    break;
                }
            };
            if in_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    Connection::new(out_tx, in_rx)
}

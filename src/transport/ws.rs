//! WebSocket client connector

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::{Connection, Connector, DEFAULT_QUEUE, Frame};
use crate::Result;

/// Connects to a `ws://` or `wss://` URL
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(DEFAULT_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(DEFAULT_QUEUE);

        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let msg = match frame {
                    Frame::Text(text) => Message::text(text),
                    Frame::Binary(data) => Message::binary(data),
                };
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(url = %url, error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let url = self.url.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = stream.next() => msg,
                    () = in_tx.closed() => break,
                };
                let frame = match msg {
                    None | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(data))) => Frame::Binary(data),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(url = %url, error = %e, "websocket read failed");
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(Connection::new(out_tx, in_rx))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

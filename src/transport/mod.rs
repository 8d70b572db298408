//! Message-oriented connections
//!
//! A [`Connection`] is an ordered, persistent pair of channels carrying
//! text and binary frames. Protocol code only ever sees this shape; the
//! WebSocket plumbing lives behind a [`Connector`] (client side) or the
//! axum upgrade handler (relay side).

pub mod memory;
mod ws;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

pub use ws::WsConnector;

/// Default channel depth for a connection's outbound queue
pub const DEFAULT_QUEUE: usize = 256;

/// A single transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// An open connection
///
/// Dropping `sender` closes the outgoing direction; `receiver` yields
/// `None` once the peer has gone away.
#[derive(Debug)]
pub struct Connection {
    pub sender: mpsc::Sender<Frame>,
    pub receiver: mpsc::Receiver<Frame>,
}

impl Connection {
    /// Build a connection from raw channel halves
    #[must_use]
    pub const fn new(sender: mpsc::Sender<Frame>, receiver: mpsc::Receiver<Frame>) -> Self {
        Self { sender, receiver }
    }
}

/// Opens outbound connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection
    ///
    /// # Errors
    ///
    /// Returns a transport error if the peer cannot be reached
    async fn connect(&self) -> Result<Connection>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

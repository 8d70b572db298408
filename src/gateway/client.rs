//! Persistent, correlated connection to the AI gateway

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use super::GatewayConfig;
use super::message::{GatewayMessage, error_text};
use super::pending::{Outcome, PendingTable};
use crate::error::RequestError;
use crate::reconnect::{ConnectionState, LinkState, Retry};
use crate::transport::{Connection, Connector, Frame};
use crate::{Error, Result};

/// Gateway connection notifications
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Connected,
    /// Connection lost; `rejected` pending requests were failed
    Disconnected { rejected: usize },
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts exhausted
    Unreachable,
    /// Unsolicited `event` from the gateway
    Notification(Value),
}

struct Inner {
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    conn: Mutex<ConnectionState>,
    state_tx: watch::Sender<LinkState>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    pending: Mutex<PendingTable>,
    events: broadcast::Sender<GatewayEvent>,
    shutdown: watch::Sender<bool>,
    supervising: AtomicBool,
}

/// Shared client for the upstream gateway
///
/// One connection carries every device's requests; responses are matched
/// to callers by request id.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("endpoint", &self.inner.connector.endpoint())
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

enum Step {
    Run(mpsc::Receiver<Frame>),
    Wait(Retry),
}

impl GatewayClient {
    #[must_use]
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                conn: Mutex::new(ConnectionState::new()),
                state_tx,
                outbound: Mutex::new(None),
                pending: Mutex::new(PendingTable::new()),
                events,
                shutdown,
                supervising: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    /// Requests awaiting a response
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Connect and keep the connection up in the background
    ///
    /// A failed first attempt still schedules retries.
    ///
    /// # Errors
    ///
    /// Returns the error of the first attempt, or `Error::Unavailable` if
    /// the client is already running or closed
    pub async fn connect(&self) -> Result<()> {
        if self.inner.supervising.swap(true, Ordering::SeqCst) {
            return Err(Error::Unavailable("gateway client already started".to_string()));
        }
        self.transition(|c, _| c.restart());

        match self.establish().await {
            Ok(receiver) => {
                self.spawn_supervisor(Step::Run(receiver));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = %self.inner.connector.endpoint(),
                    error = %e,
                    "gateway connect failed"
                );
                let retry = self.transition(|c, client| c.failed(std::time::Instant::now(), &client.config.reconnect, true));
                self.spawn_supervisor(Step::Wait(retry));
                Err(e)
            }
        }
    }

    /// Send a request and wait for its response
    ///
    /// # Errors
    ///
    /// `Timeout` if no response arrives within `timeout`, `ConnectionLost`
    /// if the connection drops first, `NotConnected`/`Closed` if nothing can
    /// be sent, `Remote` if the gateway answered with an error
    pub async fn request(&self, payload: Value, timeout: Duration) -> Outcome {
        let id = Uuid::new_v4().to_string();
        let message = GatewayMessage::Request {
            id: id.clone(),
            payload,
        };
        self.call(id, &message, timeout).await
    }

    /// Round-trip time of a correlated ping, `None` on failure
    pub async fn probe(&self, timeout: Duration) -> Option<Duration> {
        let started = tokio::time::Instant::now();
        let id = Uuid::new_v4().to_string();
        let message = GatewayMessage::Ping { id: id.clone() };
        match self.call(id, &message, timeout).await {
            Ok(_) => Some(started.elapsed()),
            Err(e) => {
                tracing::debug!(error = %e, "gateway probe failed");
                None
            }
        }
    }

    /// Whether the gateway answers a ping within the health timeout
    pub async fn health_check(&self) -> bool {
        self.probe(self.inner.config.health_timeout).await.is_some()
    }

    /// Terminal disconnect; pending requests fail with `Closed`
    pub fn close(&self) {
        lock(&self.inner.conn).close();
        self.inner.state_tx.send_replace(LinkState::Disconnected);
        lock(&self.inner.outbound).take();
        let rejected = lock(&self.inner.pending).reject_all(&RequestError::Closed);
        self.inner.shutdown.send_replace(true);
        tracing::info!(rejected, "gateway client closed");
    }

    async fn call(&self, id: String, message: &GatewayMessage, timeout: Duration) -> Outcome {
        let json = message
            .to_json()
            .map_err(|e| RequestError::Remote(format!("unencodable request: {e}")))?;

        // The slot must exist before the sender is taken, so a drop racing
        // with this call always finds it in `reject_all`
        let now = tokio::time::Instant::now();
        let rx = lock(&self.inner.pending).insert(id.clone(), now, now + timeout);

        let sender = lock(&self.inner.outbound).clone();
        let Some(sender) = sender else {
            lock(&self.inner.pending).remove(&id);
            if lock(&self.inner.conn).is_closed() {
                return Err(RequestError::Closed);
            }
            return Err(RequestError::NotConnected);
        };

        if sender.send(Frame::Text(json)).await.is_err() {
            lock(&self.inner.pending).remove(&id);
            return Err(RequestError::ConnectionLost);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                tracing::debug!(request_id = %id, "gateway request timed out");
                Err(RequestError::Timeout)
            }
        }
    }

    fn transition<T>(&self, f: impl FnOnce(&mut ConnectionState, &Inner) -> T) -> T {
        let mut conn = lock(&self.inner.conn);
        let out = f(&mut conn, &self.inner);
        self.inner.state_tx.send_replace(conn.state());
        out
    }

    fn publish(&self, event: GatewayEvent) {
        let _ = self.inner.events.send(event);
    }

    fn spawn_supervisor(&self, first: Step) {
        let client = self.clone();
        tokio::spawn(async move { client.supervise(first).await });
    }

    async fn establish(&self) -> Result<mpsc::Receiver<Frame>> {
        if !self.transition(|c, _| c.begin_attempt()) {
            return Err(Error::Unavailable("gateway client closed".to_string()));
        }

        let Connection { sender, receiver } = self.inner.connector.connect().await?;

        {
            let mut conn = lock(&self.inner.conn);
            if conn.is_closed() {
                return Err(Error::Unavailable("gateway client closed".to_string()));
            }
            conn.connected();
            *lock(&self.inner.outbound) = Some(sender);
            self.inner.state_tx.send_replace(conn.state());
        }

        tracing::info!(endpoint = %self.inner.connector.endpoint(), "connected to gateway");
        self.publish(GatewayEvent::Connected);
        Ok(receiver)
    }

    async fn supervise(self, mut step: Step) {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            let retry = match step {
                Step::Run(receiver) => {
                    self.pump(receiver, &mut shutdown).await;
                    if !self.connection_lost() {
                        break;
                    }
                    self.transition(|c, client| {
                        c.failed(std::time::Instant::now(), &client.config.reconnect, false)
                    })
                }
                Step::Wait(retry) => retry,
            };

            let (attempt, delay) = match retry {
                Retry::Stop => break,
                Retry::GiveUp => {
                    tracing::error!(
                        endpoint = %self.inner.connector.endpoint(),
                        "gateway unreachable, giving up"
                    );
                    self.inner.supervising.store(false, Ordering::SeqCst);
                    self.publish(GatewayEvent::Unreachable);
                    return;
                }
                Retry::After { attempt, delay, .. } => (attempt + 1, delay),
            };

            tracing::info!(attempt, delay_ms = delay.as_millis(), "reconnecting to gateway");
            self.publish(GatewayEvent::Reconnecting { attempt, delay });

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break,
            }

            step = match self.establish().await {
                Ok(receiver) => Step::Run(receiver),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "gateway reconnect failed");
                    Step::Wait(self.transition(|c, client| {
                        c.failed(std::time::Instant::now(), &client.config.reconnect, false)
                    }))
                }
            };
        }

        self.inner.supervising.store(false, Ordering::SeqCst);
    }

    /// Fail everything in flight after an unexpected drop
    ///
    /// Returns false if the client was closed intentionally.
    fn connection_lost(&self) -> bool {
        lock(&self.inner.outbound).take();
        if lock(&self.inner.conn).is_closed() {
            return false;
        }
        let rejected = lock(&self.inner.pending).reject_all(&RequestError::ConnectionLost);
        tracing::warn!(rejected, "gateway connection lost");
        self.publish(GatewayEvent::Disconnected { rejected });
        true
    }

    async fn pump(&self, mut receiver: mpsc::Receiver<Frame>, shutdown: &mut watch::Receiver<bool>) {
        let period = self.inner.config.sweep_interval.max(Duration::from_millis(10));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = receiver.recv() => match frame {
                    None => return,
                    Some(Frame::Text(text)) => self.handle_text(&text).await,
                    Some(Frame::Binary(_)) => tracing::debug!("ignoring binary frame from gateway"),
                },
                _ = sweep.tick() => {
                    let expired = lock(&self.inner.pending).expire(tokio::time::Instant::now());
                    if expired > 0 {
                        tracing::debug!(expired, "expired abandoned gateway requests");
                    }
                }
                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => return,
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let message = match GatewayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable gateway message");
                return;
            }
        };

        match message {
            GatewayMessage::Response { id, payload, error } => {
                let outcome = match error {
                    Some(error) => Err(RequestError::Remote(error_text(&error))),
                    None => Ok(payload.unwrap_or(Value::Null)),
                };
                if !lock(&self.inner.pending).resolve(&id, outcome) {
                    tracing::warn!(request_id = %id, "response for unknown or expired request dropped");
                }
            }
            GatewayMessage::Pong { id } => {
                if !lock(&self.inner.pending).resolve(&id, Ok(Value::Null)) {
                    tracing::debug!(probe_id = %id, "late pong dropped");
                }
            }
            GatewayMessage::Ping { id } => {
                let sender = lock(&self.inner.outbound).clone();
                if let (Some(sender), Ok(json)) = (sender, GatewayMessage::Pong { id }.to_json()) {
                    let _ = sender.send(Frame::Text(json)).await;
                }
            }
            GatewayMessage::Event { payload } => {
                self.publish(GatewayEvent::Notification(payload));
            }
            GatewayMessage::Request { id, .. } => {
                tracing::debug!(request_id = %id, "gateway-initiated requests are not supported");
            }
        }
    }
}

//! Push connection lifecycle.
//!
//! [`ConnectionMachine`] is the synchronous state machine: it decides states,
//! backoff delays and staleness, but performs no I/O. The pipeline actor owns
//! one and drives it from transport events and timers. The I/O side is the
//! [`Connector`]/[`Transport`] pair, implemented for WebSockets by
//! [`WebSocketConnector`].

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;

/// Connection errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },
}

impl ConnectionError {
    pub fn connect(endpoint: &str, message: impl Into<String>) -> Self {
        Self::Connect {
            endpoint: endpoint.to_owned(),
            message: message.into(),
        }
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Observable connection state; exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Error,
    Stale,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
            Self::Stale => write!(f, "stale"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Exponential reconnect delay with additive jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Jitter is drawn from `[0, jitter_ms)`.
    pub jitter_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for Backoff {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            jitter_ms: config.backoff_jitter_ms,
        }
    }
}

impl Backoff {
    /// `min(max, base * 2^attempt) + jitter`.
    pub fn delay(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let exponential = self
            .base_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.max_ms);
        Duration::from_millis(exponential.saturating_add(jitter_ms))
    }

    /// Draw a jitter value for [`delay`](Self::delay).
    pub fn jitter<R: Rng>(&self, rng: &mut R) -> u64 {
        if self.jitter_ms == 0 {
            0
        } else {
            rng.random_range(0..self.jitter_ms)
        }
    }
}

/// Connection state machine.
///
/// Every state change is queued and handed out by
/// [`take_transitions`](Self::take_transitions) so the owner can publish it.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempt: u32,
    manually_closed: bool,
    transport_open: bool,
    /// Open time or last inbound message, whichever is later.
    last_activity_ms: Option<i64>,
    stale_after_ms: i64,
    backoff: Backoff,
    transitions: Vec<ConnectionState>,
}

impl ConnectionMachine {
    pub fn new(backoff: Backoff, stale_after: Duration) -> Self {
        Self {
            state: ConnectionState::Connecting,
            attempt: 0,
            manually_closed: false,
            transport_open: false,
            last_activity_ms: None,
            stale_after_ms: i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX),
            backoff,
            transitions: Vec::new(),
        }
    }

    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts since the last successful open.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    pub const fn is_manually_closed(&self) -> bool {
        self.manually_closed
    }

    /// State changes since the last call, oldest first.
    pub fn take_transitions(&mut self) -> Vec<ConnectionState> {
        std::mem::take(&mut self.transitions)
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Connection state changed");
            self.state = next;
            self.transitions.push(next);
        }
    }

    /// A connection attempt is starting. Returns `false` once manually closed.
    pub fn begin_connect(&mut self) -> bool {
        if self.manually_closed {
            return false;
        }
        self.set_state(ConnectionState::Connecting);
        true
    }

    /// The transport opened.
    pub fn opened(&mut self, now_ms: i64) {
        self.attempt = 0;
        self.transport_open = true;
        self.last_activity_ms = Some(now_ms);
        self.set_state(ConnectionState::Connected);
    }

    /// The transport could not be opened; returns the reconnect delay.
    pub fn open_failed<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        self.transport_open = false;
        self.schedule_reconnect(rng)
    }

    /// The transport reported an error. It may still close afterwards.
    pub fn transport_error(&mut self) {
        if !self.manually_closed {
            self.set_state(ConnectionState::Error);
        }
    }

    /// The transport closed; returns the reconnect delay unless manually closed.
    pub fn transport_closed<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        self.transport_open = false;
        if self.manually_closed {
            self.set_state(ConnectionState::Closed);
            return None;
        }
        self.schedule_reconnect(rng)
    }

    fn schedule_reconnect<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.manually_closed {
            return None;
        }
        self.set_state(ConnectionState::Reconnecting);
        let delay = self.backoff.delay(self.attempt, self.backoff.jitter(rng));
        self.attempt = self.attempt.saturating_add(1);
        info!(
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnect scheduled"
        );
        Some(delay)
    }

    /// An inbound message arrived, parsed or not.
    pub fn message_observed(&mut self, now_ms: i64) {
        self.last_activity_ms = Some(now_ms);
    }

    /// Periodic staleness check. Returns `true` when the transport must be
    /// force-closed; the following close re-enters the reconnect path.
    pub fn heartbeat(&mut self, now_ms: i64) -> bool {
        if !self.transport_open || self.manually_closed {
            return false;
        }
        let Some(last) = self.last_activity_ms else {
            return false;
        };
        if now_ms.saturating_sub(last) <= self.stale_after_ms {
            return false;
        }
        warn!(
            silent_ms = now_ms.saturating_sub(last),
            stale_after_ms = self.stale_after_ms,
            "Connection stale, forcing close"
        );
        self.set_state(ConnectionState::Stale);
        true
    }

    /// Operator-triggered reconnect: forget the backoff and connect now.
    ///
    /// Returns `false` once manually closed.
    pub fn force_refresh(&mut self) -> bool {
        if self.manually_closed {
            return false;
        }
        self.attempt = 0;
        self.transport_open = false;
        self.begin_connect()
    }

    /// Teardown: suppress further reconnects. The state becomes `closed`
    /// immediately when no transport is open, otherwise on the close.
    pub fn close_manually(&mut self) {
        self.manually_closed = true;
        if !self.transport_open {
            self.set_state(ConnectionState::Closed);
        }
    }
}

/// Event produced by an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One UTF-8 text message.
    Message(String),
    /// Non-fatal transport error; a `Closed` normally follows.
    Error(String),
    /// The transport is gone.
    Closed,
}

/// An open push connection.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Next event. Must be cancel-safe; after `Closed` it keeps returning
    /// `Closed`.
    async fn recv(&mut self) -> TransportEvent;

    /// Close the connection, ignoring failures.
    async fn close(&mut self);
}

/// Opens transports to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, endpoint: &str) -> ConnectionResult<Box<dyn Transport>>;
}

/// WebSocket connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> ConnectionResult<Box<dyn Transport>> {
        let (stream, response) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| ConnectionError::connect(endpoint, e.to_string()))?;
        debug!(endpoint = endpoint, status = %response.status(), "WebSocket opened");
        Ok(Box::new(WebSocketTransport {
            stream,
            pending_close: false,
            closed: false,
        }))
    }
}

/// WebSocket transport. Text and UTF-8 binary frames become messages.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending_close: bool,
    closed: bool,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn recv(&mut self) -> TransportEvent {
        if self.closed || self.pending_close {
            self.closed = true;
            return TransportEvent::Closed;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Message(text.as_str().to_owned());
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return TransportEvent::Message(text),
                    Err(e) => debug!(error = %e, "Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Close frame received");
                    self.closed = true;
                    return TransportEvent::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.pending_close = true;
                    return TransportEvent::Error(e.to_string());
                }
                None => {
                    self.closed = true;
                    return TransportEvent::Closed;
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

//! Event-stream transports.
//!
//! A [`Connector`] opens an [`EventStream`] over one transport. Streams
//! perform the Engine.IO handshake, join the default Socket.IO namespace,
//! answer pings and yield decoded [`WireEvent`]s until the server goes away.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::packet::{decode_payload, EnginePacket, OpenInfo, PacketError, SocketPacket};

/// Transports in the order the server supports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Websocket,
    Polling,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Websocket => "websocket",
            TransportKind::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Server refused the connection: {0}")]
    ConnectRefused(String),
    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("No packet from the server within {0:?}")]
    HeartbeatLost(Duration),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// One named event with its first argument.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub name: String,
    pub payload: Value,
}

impl WireEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// An open event stream.
#[async_trait]
pub trait EventStream: Send {
    /// Next event, or `None` once the server has closed the stream.
    async fn next_event(&mut self) -> Result<Option<WireEvent>, TransportError>;

    /// Leave the namespace and close the underlying connection.
    async fn close(&mut self) -> Result<(), TransportError>;

    fn transport(&self) -> TransportKind;
}

/// Opens event streams.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        base_url: &str,
        transport: TransportKind,
    ) -> Result<Box<dyn EventStream>, TransportError>;
}

/// Build the Engine.IO endpoint for `base_url` on `transport`.
///
/// `http`/`https` and `ws`/`wss` bases are accepted for either transport;
/// the scheme is rewritten to match.
pub fn endpoint(base_url: &str, transport: TransportKind) -> Result<String, TransportError> {
    let base = base_url.trim().trim_end_matches('/');
    let (scheme, rest) = base
        .split_once("://")
        .ok_or_else(|| TransportError::InvalidUrl {
            url: base_url.to_string(),
            reason: "missing scheme".to_string(),
        })?;
    let secure = match scheme {
        "http" | "ws" => false,
        "https" | "wss" => true,
        other => {
            return Err(TransportError::InvalidUrl {
                url: base_url.to_string(),
                reason: format!("unsupported scheme {:?}", other),
            })
        }
    };
    if rest.is_empty() {
        return Err(TransportError::InvalidUrl {
            url: base_url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    let scheme = match (transport, secure) {
        (TransportKind::Websocket, false) => "ws",
        (TransportKind::Websocket, true) => "wss",
        (TransportKind::Polling, false) => "http",
        (TransportKind::Polling, true) => "https",
    };
    Ok(format!(
        "{}://{}/socket.io/?EIO=4&transport={}",
        scheme, rest, transport
    ))
}

/// What an open stream does with one Engine.IO packet.
enum Step {
    Deliver(WireEvent),
    Reply(EnginePacket),
    Closed,
    Skip,
}

fn step(packet: EnginePacket) -> Step {
    match packet {
        EnginePacket::Ping(data) => Step::Reply(EnginePacket::Pong(data)),
        EnginePacket::Close => Step::Closed,
        EnginePacket::Message(data) => match SocketPacket::decode(&data) {
            Ok(SocketPacket::Event { name, args, .. }) => Step::Deliver(WireEvent {
                payload: SocketPacket::event_payload(&args),
                name,
            }),
            Ok(SocketPacket::Disconnect { .. }) => Step::Closed,
            Ok(_) => Step::Skip,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable socket packet");
                Step::Skip
            }
        },
        _ => Step::Skip,
    }
}

/// How long the server may stay silent before the session is presumed dead.
///
/// The server pings every `ping_interval` and allows `ping_timeout` for the
/// pong, so anything longer than their sum means the peer is gone.
fn heartbeat_deadline(info: &OpenInfo) -> Duration {
    Duration::from_millis(info.ping_interval.saturating_add(info.ping_timeout))
}

async fn within_heartbeat<T>(
    deadline: Duration,
    read: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(deadline, read)
        .await
        .map_err(|_| TransportError::HeartbeatLost(deadline))?
}

/// Outcome of waiting for the namespace connect acknowledgement.
fn namespace_ack(packet: EnginePacket) -> Result<Option<Step>, TransportError> {
    match packet {
        EnginePacket::Message(data) => match SocketPacket::decode(&data)? {
            SocketPacket::Connect { .. } => Ok(None),
            SocketPacket::ConnectError { data, .. } => Err(TransportError::ConnectRefused(
                data.map(|d| d.to_string()).unwrap_or_default(),
            )),
            _ => Ok(Some(Step::Skip)),
        },
        EnginePacket::Ping(data) => Ok(Some(Step::Reply(EnginePacket::Pong(data)))),
        EnginePacket::Close => Ok(Some(Step::Closed)),
        _ => Ok(Some(Step::Skip)),
    }
}

// ============================================================================
// WEBSOCKET
// ============================================================================

pub struct WebSocketEvents {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    heartbeat: Duration,
}

impl WebSocketEvents {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        let mut events = Self {
            stream,
            heartbeat: Duration::MAX,
        };

        match events.read_packet().await? {
            Some(EnginePacket::Open(info)) => {
                debug!(sid = %info.sid, ping_interval = info.ping_interval, "Engine.IO session opened");
                events.heartbeat = heartbeat_deadline(&info);
            }
            Some(other) => {
                return Err(TransportError::Protocol(format!(
                    "expected open packet, got {:?}",
                    other
                )))
            }
            None => return Err(TransportError::Protocol("closed during handshake".into())),
        }

        events
            .send_packet(EnginePacket::socket(&SocketPacket::connect()))
            .await?;
        loop {
            let Some(packet) = events.read_packet().await? else {
                return Err(TransportError::Protocol("closed during handshake".into()));
            };
            match namespace_ack(packet)? {
                None => break,
                Some(Step::Reply(reply)) => events.send_packet(reply).await?,
                Some(Step::Closed) => {
                    return Err(TransportError::Protocol("closed during handshake".into()))
                }
                Some(_) => {}
            }
        }
        Ok(events)
    }

    async fn read_packet(&mut self) -> Result<Option<EnginePacket>, TransportError> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => match EnginePacket::decode(text.as_str()) {
                    Ok(packet) => return Ok(Some(packet)),
                    Err(e) => warn!(error = %e, "Dropping undecodable engine packet"),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    async fn send_packet(&mut self, packet: EnginePacket) -> Result<(), TransportError> {
        self.stream.send(Message::text(packet.encode())).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStream for WebSocketEvents {
    async fn next_event(&mut self) -> Result<Option<WireEvent>, TransportError> {
        loop {
            let deadline = self.heartbeat;
            let Some(packet) = within_heartbeat(deadline, self.read_packet()).await? else {
                return Ok(None);
            };
            match step(packet) {
                Step::Deliver(event) => return Ok(Some(event)),
                Step::Reply(reply) => self.send_packet(reply).await?,
                Step::Closed => return Ok(None),
                Step::Skip => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self
            .send_packet(EnginePacket::socket(&SocketPacket::disconnect()))
            .await
        {
            debug!(error = %e, "Namespace disconnect not delivered");
        }
        self.stream.close(None).await?;
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Websocket
    }
}

// ============================================================================
// LONG POLLING
// ============================================================================

pub struct PollingEvents {
    http: reqwest::Client,
    url: String,
    pending: VecDeque<EnginePacket>,
    heartbeat: Duration,
}

impl PollingEvents {
    pub async fn connect(http: reqwest::Client, base: String) -> Result<Self, TransportError> {
        let body = http.get(&base).send().await?.error_for_status()?.text().await?;
        let mut packets = decode_payload(&body).into_iter();
        let info = match packets.next() {
            Some(Ok(EnginePacket::Open(info))) => info,
            Some(Ok(other)) => {
                return Err(TransportError::Protocol(format!(
                    "expected open packet, got {:?}",
                    other
                )))
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(TransportError::Protocol("empty handshake".into())),
        };
        debug!(sid = %info.sid, "Engine.IO polling session opened");

        let mut events = Self {
            http,
            url: format!("{}&sid={}", base, info.sid),
            pending: packets.filter_map(Result::ok).collect(),
            heartbeat: heartbeat_deadline(&info),
        };
        events
            .send_packet(EnginePacket::socket(&SocketPacket::connect()))
            .await?;
        loop {
            let Some(packet) = events.read_packet().await? else {
                return Err(TransportError::Protocol("closed during handshake".into()));
            };
            match namespace_ack(packet)? {
                None => break,
                Some(Step::Reply(reply)) => events.send_packet(reply).await?,
                Some(Step::Closed) => {
                    return Err(TransportError::Protocol("closed during handshake".into()))
                }
                Some(_) => {}
            }
        }
        Ok(events)
    }

    async fn read_packet(&mut self) -> Result<Option<EnginePacket>, TransportError> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(Some(packet));
            }
            let response = self.http.get(&self.url).send().await?;
            if response.status().as_u16() == 400 {
                // Unknown or expired session id.
                return Ok(None);
            }
            let body = response.error_for_status()?.text().await?;
            for packet in decode_payload(&body) {
                match packet {
                    Ok(packet) => self.pending.push_back(packet),
                    Err(e) => warn!(error = %e, "Dropping undecodable engine packet"),
                }
            }
        }
    }

    async fn send_packet(&mut self, packet: EnginePacket) -> Result<(), TransportError> {
        self.http
            .post(&self.url)
            .header("content-type", "text/plain;charset=UTF-8")
            .body(packet.encode())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl EventStream for PollingEvents {
    async fn next_event(&mut self) -> Result<Option<WireEvent>, TransportError> {
        loop {
            let deadline = self.heartbeat;
            let Some(packet) = within_heartbeat(deadline, self.read_packet()).await? else {
                return Ok(None);
            };
            match step(packet) {
                Step::Deliver(event) => return Ok(Some(event)),
                Step::Reply(reply) => self.send_packet(reply).await?,
                Step::Closed => return Ok(None),
                Step::Skip => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.send_packet(EnginePacket::socket(&SocketPacket::disconnect()))
            .await?;
        self.send_packet(EnginePacket::Close).await
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Polling
    }
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Opens Socket.IO streams over the network.
#[derive(Clone)]
pub struct SocketIoConnector {
    http: reqwest::Client,
    handshake_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(handshake_timeout: Duration) -> Result<Self, TransportError> {
        // Long-poll requests stay open until the server's next ping.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            handshake_timeout,
        })
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn open(
        &self,
        base_url: &str,
        transport: TransportKind,
    ) -> Result<Box<dyn EventStream>, TransportError> {
        let url = endpoint(base_url, transport)?;
        debug!(url = %url, transport = %transport, "Opening event stream");
        let timeout = self.handshake_timeout;
        match transport {
            TransportKind::Websocket => {
                let events = tokio::time::timeout(timeout, WebSocketEvents::connect(&url))
                    .await
                    .map_err(|_| TransportError::Timeout(timeout))??;
                Ok(Box::new(events))
            }
            TransportKind::Polling => {
                let events =
                    tokio::time::timeout(timeout, PollingEvents::connect(self.http.clone(), url))
                        .await
                        .map_err(|_| TransportError::Timeout(timeout))??;
                Ok(Box::new(events))
            }
        }
    }
}

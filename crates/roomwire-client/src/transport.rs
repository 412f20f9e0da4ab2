//! Text-frame transports.
//!
//! [`Transport`] is one live link; [`Connector`] produces a fresh one each
//! time the client (re)connects. [`WsConnector`] dials a WebSocket URL;
//! [`ChannelTransport`] is an in-memory pair for driving a client without a
//! server.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::ClientError;

#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), ClientError>;

    /// Next inbound text frame; `None` once the peer has closed.
    /// Must be cancel-safe, it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Result<String, ClientError>>;

    async fn close(&mut self) -> Result<(), ClientError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    stream: WsStream,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(format!("connect {url}: {e}")))?;
        debug!(url, "websocket connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), ClientError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, ClientError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!("ignoring non-utf8 binary frame"),
                },
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite on the next read.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(ClientError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }
}

/// Dials the same URL on every connect.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError> {
        Ok(Box::new(WsTransport::connect(&self.url).await?))
    }
}

/// One end of an in-memory link.
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelTransport {
    /// Two connected ends: what one sends the other receives.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, text: String) -> Result<(), ClientError> {
        self.tx
            .as_ref()
            .ok_or(ClientError::Disconnected)?
            .send(text)
            .map_err(|_| ClientError::Disconnected)
    }

    async fn recv(&mut self) -> Option<Result<String, ClientError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

/// Hands out queued [`ChannelTransport`]s, one per connect.
pub struct ChannelConnector {
    queue: Mutex<mpsc::UnboundedReceiver<ChannelTransport>>,
}

impl ChannelConnector {
    /// The connector plus the sender used to queue transports for it.
    pub fn new() -> (Self, mpsc::UnboundedSender<ChannelTransport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                queue: Mutex::new(rx),
            },
            tx,
        )
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError> {
        let next = self.queue.lock().try_recv();
        match next {
            Ok(transport) => Ok(Box::new(transport)),
            Err(_) => Err(ClientError::Transport("no transport available".into())),
        }
    }
}

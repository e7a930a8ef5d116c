//! Transport adapter
//!
//! The connection task only ever sees text frames through [`Transport`];
//! [`Connector`] opens a fresh one for every (re)connect attempt. The
//! production implementation speaks WebSocket via tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{Error, Result};

/// One live bidirectional text-frame connection to the hub
#[async_trait]
pub trait Transport: Send {
    /// Write one serialized frame
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next inbound frame. `None` once the connection is closed,
    /// `Some(Err(_))` for transport errors.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Tear down the connection. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Transport>>;
}

/// Connects over WebSocket (`ws://` or `wss://`)
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Transport>> {
        let (stream, response) = connect_async(endpoint).await.map_err(|e| {
            Error::Connection(format!("WebSocket connect to {} failed: {}", endpoint, e))
        })?;

        debug!(endpoint = %endpoint, status = %response.status(), "WebSocket connected");

        Ok(Box::new(WebSocketTransport {
            stream,
            closed: false,
        }))
    }
}

/// WebSocket transport
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        self.stream.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        if self.closed {
            return None;
        }

        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes.to_vec()).map_err(|_| {
                        Error::Protocol("Binary frame is not valid UTF-8".into())
                    }));
                }
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "Hub closed the WebSocket");
                    self.closed = true;
                    return None;
                }
                // Ping/pong are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => {
                    self.closed = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

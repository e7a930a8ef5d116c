//! Scripted in-memory hub for tests
//!
//! [`MockConnector`] hands the client a channel-backed transport and gives
//! the test the other end as a [`HubConnection`], so a test can play the
//! hub frame by frame.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{BackoffPolicy, Config};
use crate::error::{Error, Result};
use crate::frame::{decode_frame, encode_frame, Frame, Status};
use crate::protocol::events;
use crate::transport::{Connector, Transport};

/// Credentials `a`/`b` and a deterministic backoff (1s, 2s, 4s, ...)
pub(crate) fn test_config() -> Config {
    Config::new("a", "b")
        .with_endpoint("ws://hub.test/socket")
        .with_backoff(BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        })
}

pub(crate) fn mock_hub() -> (Arc<MockConnector>, MockHub) {
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let refusals = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(AtomicUsize::new(0));

    let connector = MockConnector {
        accepted: accepted_tx,
        refusals: refusals.clone(),
        attempts: attempts.clone(),
    };
    let hub = MockHub {
        accepted: accepted_rx,
        refusals,
        attempts,
    };
    (Arc::new(connector), hub)
}

pub(crate) struct MockConnector {
    accepted: mpsc::UnboundedSender<HubConnection>,
    refusals: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::Connection(format!("{} refused", endpoint)));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let _ = self.accepted.send(HubConnection {
            to_client,
            from_client,
        });

        Ok(Box::new(MockTransport {
            incoming,
            outgoing,
            closed: false,
        }))
    }
}

struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Result<String>>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        self.outgoing
            .send(frame)
            .map_err(|_| Error::Connection("hub hung up".into()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        if self.closed {
            return None;
        }
        self.incoming.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Test-side control of the connector
pub(crate) struct MockHub {
    accepted: mpsc::UnboundedReceiver<HubConnection>,
    refusals: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MockHub {
    /// Wait for the client's next successful connect
    pub async fn accept(&mut self) -> HubConnection {
        self.accepted.recv().await.expect("connector dropped")
    }

    /// Refuse the next `count` connect attempts
    pub fn refuse(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// The hub's end of one client connection. Dropping it closes the
/// connection from the hub side.
pub(crate) struct HubConnection {
    to_client: mpsc::UnboundedSender<Result<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl HubConnection {
    /// Next frame written by the client
    pub async fn recv(&mut self) -> Frame {
        let text = self.from_client.recv().await.expect("client hung up");
        decode_frame(&text).unwrap()
    }

    /// Next frame, which must be `event`
    pub async fn expect(&mut self, event: &str) -> Frame {
        let frame = self.recv().await;
        assert_eq!(frame.event, event, "unexpected frame {:?}", frame);
        frame
    }

    /// Wait for the client to drop its end, discarding anything it sends
    pub async fn closed(&mut self) -> bool {
        while self.from_client.recv().await.is_some() {}
        true
    }

    pub fn send(&self, frame: Frame) {
        self.send_raw(&encode_frame(&frame).unwrap());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(Ok(text.to_string()));
    }

    /// Inject a transport-level failure
    pub fn fail(&self, message: &str) {
        let _ = self.to_client.send(Err(Error::Connection(message.to_string())));
    }

    pub fn push(&self, event: &str, payload: Value) {
        self.send(Frame::push(event, payload));
    }

    pub fn reply(&self, request: &Frame, payload: Value) {
        self.send(Frame {
            status: Some(Status::Success),
            ..Frame::request(
                request.event.clone(),
                request.reference.clone().unwrap(),
                payload,
            )
        });
    }

    pub fn reject(&self, request: &Frame, message: &str) {
        self.send(Frame {
            status: Some(Status::Failure),
            error: Some(message.to_string()),
            ..Frame::request(
                request.event.clone(),
                request.reference.clone().unwrap(),
                Value::Null,
            )
        });
    }

    /// Play a successful handshake: accept the credentials, acknowledge
    /// every re-announced player and answer the snapshot request.
    /// Returns the announced player names.
    pub async fn handshake(&mut self, snapshot: Value) -> Vec<String> {
        let auth = self.expect(events::AUTHENTICATE).await;
        self.reply(&auth, Value::Null);

        let mut announced = Vec::new();
        loop {
            let frame = self.recv().await;
            match frame.event.as_str() {
                events::PLAYERS_SIGN_IN => {
                    announced.push(frame.payload["name"].as_str().unwrap().to_string());
                    self.reply(&frame, Value::Null);
                }
                events::PLAYERS_STATUS => {
                    self.reply(&frame, snapshot);
                    return announced;
                }
                other => panic!("unexpected frame during handshake: {}", other),
            }
        }
    }
}

//! Grapevine Network Library
//!
//! Connects a game server to the Grapevine intermud network.
//!
//! # Architecture
//!
//! - **Client**: handle used by the game; commands go to a background task
//! - **Connection**: the task that owns the socket and runs the protocol
//!   state machine (authenticate, re-announce players, load the snapshot,
//!   heartbeat, reconnect with backoff)
//! - **Games**: the local view of which remote players are online
//! - **Protocol**: JSON text frames over WebSocket
//!
//! # Usage
//!
//! ```ignore
//! let client = Client::init(Config::new(client_id, client_secret))?;
//!
//! client.on(events::CHANNELS_BROADCAST, |payload| {
//!     println!("{}", payload["message"]);
//! });
//!
//! client.connect().await?;
//! client.add_player("SomePlayer").await?;
//! client.subscribe_channel("secrets").await?;
//!
//! let bob = client.find_player("bob@othergame")?;
//! ```

pub mod client;
pub mod config;
pub mod connection;
mod correlator;
pub mod dispatcher;
pub mod error;
mod frame;
pub mod games;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use client::Client;
pub use config::{BackoffPolicy, Config, Timeouts};
pub use connection::ConnectionState;
pub use dispatcher::ListenerId;
pub use error::{Error, Result};
pub use games::{Games, PlayerRef, RemoteGame};
pub use protocol::events;
pub use transport::{Connector, Transport, WebSocketConnector};

/// Default Grapevine hub endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://grapevine.haus/socket";

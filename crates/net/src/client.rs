//! Client handle for the Grapevine network

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::config::Config;
use crate::connection::{Command, Connection, ConnectionState};
use crate::dispatcher::{EventDispatcher, ListenerId};
use crate::error::{Error, Result};
use crate::games::{Games, PlayerRef};
use crate::protocol::{self, events, Channel, ChannelMessage, GamePresence, Tell};
use crate::transport::{Connector, WebSocketConnector};

/// Handle to one game's connection to the hub
///
/// All network work happens on a background task; the handle only sends it
/// commands and reads the state it publishes. Dropping the handle closes
/// the client.
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    dispatcher: Arc<EventDispatcher>,
    state: watch::Receiver<ConnectionState>,
    games: watch::Receiver<Arc<Games>>,
    closed: AtomicBool,
}

impl Client {
    /// Create a client that connects over WebSocket
    ///
    /// Must be called from within a Tokio runtime. Does not connect.
    pub fn init(config: Config) -> Result<Self> {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Create a client over a custom transport
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            Error::Configuration("Client must be created within a Tokio runtime".into())
        })?;

        let dispatcher = Arc::new(EventDispatcher::new());
        let (connection, state, games) = Connection::new(config, connector, dispatcher.clone());
        let (commands, rx) = mpsc::unbounded_channel();
        runtime.spawn(connection.run(rx));

        Ok(Self {
            commands,
            dispatcher,
            state,
            games,
            closed: AtomicBool::new(false),
        })
    }

    /// Connect, authenticate and load the network snapshot
    ///
    /// Resolves once the client is ready. Calling it while already ready
    /// resolves immediately.
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { reply })?;
        rx.await.map_err(|_| Error::ClientClosed)?
    }

    /// Send a request and wait for the hub's reply payload
    pub async fn send(&self, event: &str, payload: Value) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Request {
            event: event.to_string(),
            payload,
            reply,
        })?;
        rx.await.map_err(|_| Error::ClientClosed)?
    }

    /// Register a local player and announce it to the network
    ///
    /// The player is remembered even when the announcement fails, and is
    /// announced again after every reconnect.
    pub async fn add_player(&self, name: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::AddPlayer {
            name: name.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::ClientClosed)?.map(|_| ())
    }

    /// Forget a local player and announce the sign-out
    pub async fn remove_player(&self, name: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::RemovePlayer {
            name: name.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::ClientClosed)?.map(|_| ())
    }

    /// Look up a remote player by `player@game`
    pub fn find_player(&self, identifier: &str) -> Result<PlayerRef> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        self.games.borrow().find_player(identifier)
    }

    /// Current view of the remote network
    pub fn games(&self) -> Arc<Games> {
        self.games.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// True once authenticated and the snapshot is loaded
    pub fn is_alive(&self) -> bool {
        !self.is_closed() && self.state() == ConnectionState::Ready
    }

    /// Shut the client down for good. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Client close requested");
        let _ = self.commands.send(Command::Close);
    }

    /// Subscribe to a push event such as `channels/broadcast`
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.dispatcher.on(event, listener)
    }

    /// Subscribe to asynchronous errors (dropped connections, bad frames)
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.dispatcher.on_error(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.dispatcher.off(id)
    }

    pub async fn subscribe_channel(&self, channel: &str) -> Result<Value> {
        let payload = protocol::encode(&Channel {
            channel: channel.to_string(),
        })?;
        self.send(events::CHANNELS_SUBSCRIBE, payload).await
    }

    pub async fn unsubscribe_channel(&self, channel: &str) -> Result<Value> {
        let payload = protocol::encode(&Channel {
            channel: channel.to_string(),
        })?;
        self.send(events::CHANNELS_UNSUBSCRIBE, payload).await
    }

    /// Ask the hub about one game, or about every connected game with `None`
    pub async fn game_status(&self, game: Option<&str>) -> Result<Value> {
        let payload = match game {
            Some(game) => protocol::encode(&GamePresence {
                game: game.to_string(),
            })?,
            None => Value::Null,
        };
        self.send(events::GAMES_STATUS, payload).await
    }

    /// Send a message to a channel
    pub async fn broadcast(&self, message: &ChannelMessage) -> Result<Value> {
        self.send(events::CHANNELS_SEND, protocol::encode(message)?)
            .await
    }

    /// Send a private message to a player on another game
    pub async fn send_tell(&self, tell: &Tell) -> Result<Value> {
        self.send(events::TELLS_SEND, protocol::encode(tell)?).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        self.commands.send(command).map_err(|_| Error::ClientClosed)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

//! Connection task
//!
//! A single task per client owns the transport, the correlator, the local
//! roster and the remote-network cache, and drives the protocol state
//! machine:
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Ready
//!                     ^                |            |
//!                     +-- Reconnecting <------------+
//! ```
//!
//! `Authenticating` covers the whole handshake: the `authenticate` reply,
//! re-announcing every local player and loading the snapshot. Only then is
//! the connection `Ready`.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::correlator::{Completion, Correlator, Step};
use crate::dispatcher::{classify, EventDispatcher, Route};
use crate::error::{Error, Result};
use crate::frame::{decode_frame, encode_frame, Frame};
use crate::games::Games;
use crate::protocol::{
    self, events, Authenticate, GamePresence, Heartbeat, PlayerName, PlayerPresence,
    PlayerStatus, Restart, Snapshot,
};
use crate::transport::{Connector, Transport};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
}

/// Requests from the client handle to the connection task
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Request {
        event: String,
        payload: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    AddPlayer {
        name: String,
        reply: oneshot::Sender<Result<Value>>,
    },
    RemovePlayer {
        name: String,
        reply: oneshot::Sender<Result<Value>>,
    },
    Close,
}

type ConnectTask = JoinHandle<Result<Box<dyn Transport>>>;

/// Heartbeat bookkeeping while `Ready`
#[derive(Debug, Default)]
struct Watchdog {
    next_tick: Option<Instant>,
    seen: bool,
    missed: u32,
}

pub(crate) struct Connection {
    config: Config,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<EventDispatcher>,
    transport: Option<Box<dyn Transport>>,
    connecting: Option<ConnectTask>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    games: Games,
    games_tx: watch::Sender<Arc<Games>>,
    correlator: Correlator,
    /// Local players, re-announced after every authentication
    roster: Vec<String>,
    /// Roster already sent on this connection; later additions go out directly
    synchronized: bool,
    /// `connect()` calls waiting for `Ready`
    waiters: Vec<oneshot::Sender<Result<()>>>,
    watchdog: Watchdog,
    reconnect_at: Option<Instant>,
    attempt: u32,
    /// Minimum wait before the next reconnect, from a hub `restart`
    restart_hint: Option<Duration>,
    auto_reconnect: bool,
}

impl Connection {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<EventDispatcher>,
    ) -> (
        Self,
        watch::Receiver<ConnectionState>,
        watch::Receiver<Arc<Games>>,
    ) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (games_tx, games_rx) = watch::channel(Arc::new(Games::new()));

        let connection = Self {
            config,
            connector,
            dispatcher,
            transport: None,
            connecting: None,
            state: ConnectionState::Disconnected,
            state_tx,
            games: Games::new(),
            games_tx,
            correlator: Correlator::new(),
            roster: Vec::new(),
            synchronized: false,
            waiters: Vec::new(),
            watchdog: Watchdog::default(),
            reconnect_at: None,
            attempt: 0,
            restart_hint: None,
            auto_reconnect: false,
        };
        (connection, state_rx, games_rx)
    }

    /// Main loop. Runs until `Close` or until every client handle is gone.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }

                connected = join_connect(&mut self.connecting) => {
                    self.handle_connected(connected).await;
                }

                inbound = recv_from(&mut self.transport) => {
                    self.handle_inbound(inbound).await;
                }

                _ = sleep_until_opt(deadline) => {
                    self.handle_timer().await;
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect { reply } => self.connect(reply),
            Command::Request {
                event,
                payload,
                reply,
            } => {
                if self.state != ConnectionState::Ready {
                    let _ = reply.send(Err(Error::NotConnected));
                } else {
                    let limit = self.config.request_timeout();
                    if let Err(e) = self
                        .send_request(&event, payload, Completion::Caller(reply), limit)
                        .await
                    {
                        self.on_drop(e).await;
                    }
                }
            }
            Command::AddPlayer { name, reply } => {
                if !self.roster.iter().any(|p| same_name(p, &name)) {
                    self.roster.push(name.clone());
                }
                self.player_request(events::PLAYERS_SIGN_IN, name, reply).await;
            }
            Command::RemovePlayer { name, reply } => {
                self.roster.retain(|p| !same_name(p, &name));
                self.player_request(events::PLAYERS_SIGN_OUT, name, reply).await;
            }
            Command::Close => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.state {
            ConnectionState::Ready => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Disconnected => {
                self.waiters.push(reply);
                self.auto_reconnect = true;
                self.attempt = 0;
                self.start_connect();
            }
            // Resolved by the attempt already underway
            ConnectionState::Connecting
            | ConnectionState::Authenticating
            | ConnectionState::Reconnecting => self.waiters.push(reply),
        }
    }

    async fn player_request(
        &mut self,
        event: &str,
        name: String,
        reply: oneshot::Sender<Result<Value>>,
    ) {
        let can_send = self.state == ConnectionState::Ready
            || (self.state == ConnectionState::Authenticating && self.synchronized);
        if !can_send {
            let _ = reply.send(Err(Error::NotConnected));
            return;
        }

        let payload = match protocol::encode(&PlayerName { name }) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let limit = self.config.request_timeout();
        if let Err(e) = self
            .send_request(event, payload, Completion::Caller(reply), limit)
            .await
        {
            self.on_drop(e).await;
        }
    }

    fn start_connect(&mut self) {
        self.set_state(ConnectionState::Connecting);

        let connector = self.connector.clone();
        let endpoint = self.config.endpoint.clone();
        let limit = self.config.connect_timeout();
        info!(endpoint = %endpoint, attempt = self.attempt, "Connecting to hub");

        self.connecting = Some(tokio::spawn(async move {
            match timeout(limit, connector.connect(&endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Connection(format!(
                    "Timed out connecting to {}",
                    endpoint
                ))),
            }
        }));
    }

    async fn handle_connected(&mut self, result: Result<Box<dyn Transport>>) {
        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.set_state(ConnectionState::Authenticating);
                if let Err(e) = self.authenticate().await {
                    self.on_drop(e).await;
                }
            }
            Err(e) => {
                let error = into_connection_error(e);
                warn!(error = %error, "Failed to connect to hub");
                self.schedule_reconnect();
                self.fail_waiters(&error);
                self.dispatcher.emit_error(&error);
            }
        }
    }

    async fn authenticate(&mut self) -> Result<()> {
        let payload = protocol::encode(&Authenticate {
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.clone(),
            supports: self.config.supports.clone(),
            channels: self.config.channels.clone(),
            version: self.config.version.clone(),
            user_agent: self.config.user_agent.clone(),
        })?;

        let limit = self.config.connect_timeout();
        self.send_request(
            events::AUTHENTICATE,
            payload,
            Completion::Internal(Step::Authenticate),
            limit,
        )
        .await
    }

    /// Re-announce the roster and request the snapshot
    async fn synchronize(&mut self) -> Result<()> {
        let limit = self.config.request_timeout();
        self.synchronized = true;

        for name in self.roster.clone() {
            let payload = protocol::encode(&PlayerName { name: name.clone() })?;
            self.send_request(
                events::PLAYERS_SIGN_IN,
                payload,
                Completion::Internal(Step::Announce(name)),
                limit,
            )
            .await?;
        }

        self.send_request(
            events::PLAYERS_STATUS,
            Value::Null,
            Completion::Internal(Step::Snapshot),
            limit,
        )
        .await
    }

    async fn handle_inbound(&mut self, inbound: Option<Result<String>>) {
        match inbound {
            Some(Ok(text)) => self.handle_text(&text).await,
            Some(Err(e)) => self.on_drop(e).await,
            None => {
                self.on_drop(Error::Connection("Connection closed by hub".into()))
                    .await
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                self.dispatcher.emit_error(&e);
                return;
            }
        };

        match classify(frame, &self.correlator) {
            Route::Reply { reference, frame } => {
                let result = frame.outcome().map_err(|message| Error::Rejected {
                    event: frame.event.clone(),
                    message,
                });
                if let Some((step, result)) = self.correlator.resolve(&reference, result) {
                    self.handle_step(step, result).await;
                }
            }
            Route::Late(frame) => {
                debug!(event = %frame.event, reference = ?frame.reference, "Ignoring late reply");
            }
            Route::Push(frame) => self.handle_push(frame).await,
        }
    }

    async fn handle_step(&mut self, step: Step, result: Result<Value>) {
        match (step, result) {
            (Step::Authenticate, Ok(_)) => {
                info!(players = self.roster.len(), "Authenticated with hub");
                if let Err(e) = self.synchronize().await {
                    self.on_drop(e).await;
                }
            }
            (Step::Authenticate, Err(e)) => {
                let message = match e {
                    Error::Rejected { message, .. } => message,
                    other => other.to_string(),
                };
                self.auth_failed(Error::Authentication(message)).await;
            }
            (Step::Announce(name), Ok(_)) => {
                debug!(player = %name, "Player re-announced");
                self.check_ready();
            }
            (Step::Announce(name), Err(e)) => {
                warn!(player = %name, error = %e, "Player re-announce rejected");
                self.check_ready();
            }
            (Step::Snapshot, Ok(payload)) => {
                match protocol::decode::<Snapshot>(&payload) {
                    Ok(snapshot) => {
                        self.games.apply_snapshot(snapshot);
                        self.publish_games();
                    }
                    Err(e) => {
                        warn!(error = %e, "Invalid snapshot payload");
                        self.dispatcher.emit_error(&e);
                    }
                }
                self.check_ready();
            }
            (Step::Snapshot, Err(e)) => {
                warn!(error = %e, "Snapshot request rejected");
                self.dispatcher.emit_error(&e);
                self.check_ready();
            }
        }
    }

    async fn handle_push(&mut self, frame: Frame) {
        let Frame { event, payload, .. } = frame;

        match event.as_str() {
            events::HEARTBEAT => {
                if let Err(e) = self.answer_heartbeat().await {
                    self.on_drop(e).await;
                }
                return;
            }
            events::AUTHENTICATE => {
                debug!("Ignoring unsolicited authenticate frame");
                return;
            }
            events::RESTART => match protocol::decode::<Restart>(&payload) {
                Ok(restart) => {
                    info!(downtime_s = restart.downtime, "Hub announced a restart");
                    self.restart_hint = Some(Duration::from_secs(restart.downtime));
                }
                Err(e) => self.dispatcher.emit_error(&e),
            },
            _ => {
                if let Err(e) = self.update_games(&event, &payload) {
                    warn!(event = %event, error = %e, "Invalid presence payload");
                    self.dispatcher.emit_error(&e);
                }
            }
        }

        self.dispatcher.emit(&event, &payload);
    }

    /// Apply a presence push to the cache. Other events are ignored.
    fn update_games(&mut self, event: &str, payload: &Value) -> Result<()> {
        match event {
            events::PLAYERS_SIGN_IN => {
                let p: PlayerPresence = protocol::decode(payload)?;
                self.games.player_signed_in(&p.game, &p.name);
            }
            events::PLAYERS_SIGN_OUT => {
                let p: PlayerPresence = protocol::decode(payload)?;
                self.games.player_signed_out(&p.game, &p.name);
            }
            events::PLAYERS_STATUS => {
                let status: PlayerStatus = protocol::decode(payload)?;
                self.games.apply_status(status);
            }
            events::GAMES_CONNECT => {
                let g: GamePresence = protocol::decode(payload)?;
                self.games.game_connected(&g.game);
            }
            events::GAMES_DISCONNECT => {
                let g: GamePresence = protocol::decode(payload)?;
                self.games.game_disconnected(&g.game);
            }
            _ => return Ok(()),
        }
        self.publish_games();
        Ok(())
    }

    async fn answer_heartbeat(&mut self) -> Result<()> {
        self.watchdog.seen = true;
        let payload = protocol::encode(&Heartbeat {
            players: self.roster.clone(),
        })?;
        self.send_frame(&Frame::push(events::HEARTBEAT, payload))
            .await
    }

    async fn handle_timer(&mut self) {
        let now = Instant::now();

        // Any expired handshake step ends this connection
        if let Some(step) = self.correlator.expire(now).into_iter().next() {
            match step {
                Step::Authenticate => {
                    self.auth_failed(Error::Authentication(
                        "Timed out waiting for the hub".into(),
                    ))
                    .await;
                }
                Step::Announce(_) | Step::Snapshot => {
                    self.on_drop(Error::Connection(format!(
                        "Handshake step {:?} timed out",
                        step
                    )))
                    .await;
                }
            }
            return;
        }

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.start_connect();
        }

        if self.watchdog.next_tick.is_some_and(|tick| tick <= now) {
            self.watchdog_tick(now).await;
        }
    }

    async fn watchdog_tick(&mut self, now: Instant) {
        let limit = self.config.timeouts.heartbeat_miss_limit;

        if std::mem::take(&mut self.watchdog.seen) {
            self.watchdog.missed = 0;
        } else {
            self.watchdog.missed += 1;
            warn!(missed = self.watchdog.missed, limit = limit, "No heartbeat from hub");
        }

        if self.watchdog.missed >= limit {
            let missed = self.watchdog.missed;
            self.on_drop(Error::Connection(format!(
                "Missed {} heartbeats",
                missed
            )))
            .await;
        } else {
            self.watchdog.next_tick = Some(now + self.config.heartbeat_interval());
        }
    }

    fn check_ready(&mut self) {
        if self.state == ConnectionState::Authenticating && !self.correlator.has_internal() {
            self.enter_ready();
        }
    }

    fn enter_ready(&mut self) {
        self.attempt = 0;
        self.restart_hint = None;
        self.watchdog = Watchdog {
            next_tick: Some(Instant::now() + self.config.heartbeat_interval()),
            ..Watchdog::default()
        };
        self.set_state(ConnectionState::Ready);
        info!(
            games = self.games.len(),
            players = self.roster.len(),
            "Connection ready"
        );

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Unexpected loss of the connection: fail everything and retry
    async fn on_drop(&mut self, error: Error) {
        let error = into_connection_error(error);
        warn!(error = %error, state = ?self.state, "Connection to hub lost");

        self.teardown(&error).await;
        self.schedule_reconnect();
        self.fail_waiters(&error);
        self.dispatcher.emit_error(&error);
    }

    /// The hub refused our credentials; retrying will not help
    async fn auth_failed(&mut self, error: Error) {
        warn!(error = %error, "Authentication failed, not reconnecting");

        self.teardown(&error).await;
        self.auto_reconnect = false;
        self.reconnect_at = None;
        self.set_state(ConnectionState::Disconnected);
        self.fail_waiters(&error);
        self.dispatcher.emit_error(&error);
    }

    async fn teardown(&mut self, error: &Error) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "Error closing transport");
            }
        }

        if !self.correlator.is_empty() {
            debug!(pending = self.correlator.len(), error = %error, "Failing outstanding requests");
        }
        let cut_short = self.correlator.fail_all(error);
        if !cut_short.is_empty() {
            debug!(steps = ?cut_short, "Handshake interrupted");
        }

        self.synchronized = false;
        self.watchdog = Watchdog::default();
        self.games.clear();
        self.publish_games();
    }

    fn schedule_reconnect(&mut self) {
        if !self.auto_reconnect {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let mut delay = self.config.backoff.delay(self.attempt);
        if let Some(downtime) = self.restart_hint.take() {
            delay = delay.max(downtime);
        }
        self.attempt = self.attempt.saturating_add(1);
        self.reconnect_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Reconnecting);

        info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
    }

    async fn shutdown(&mut self) {
        info!("Closing client");

        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.auto_reconnect = false;
        self.reconnect_at = None;

        self.teardown(&Error::ClientClosed).await;
        self.roster.clear();
        self.set_state(ConnectionState::Disconnected);
        self.fail_waiters(&Error::ClientClosed);
    }

    async fn send_request(
        &mut self,
        event: &str,
        payload: Value,
        completion: Completion,
        limit: Duration,
    ) -> Result<()> {
        let reference = self.correlator.register(event, completion, limit);
        debug!(event = %event, reference = %reference, "Sending request");
        self.send_frame(&Frame::request(event, reference, payload))
            .await
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let text = encode_frame(frame)?;
        match self.transport.as_mut() {
            Some(transport) => transport.send(text).await,
            None => Err(Error::NotConnected),
        }
    }

    fn fail_waiters(&mut self, error: &Error) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Connection state change");
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn publish_games(&self) {
        self.games_tx.send_replace(Arc::new(self.games.clone()));
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.correlator.next_deadline(),
            self.watchdog.next_tick,
            self.reconnect_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn into_connection_error(error: Error) -> Error {
    match error {
        Error::Connection(_) => error,
        other => Error::Connection(other.to_string()),
    }
}

async fn join_connect(task: &mut Option<ConnectTask>) -> Result<Box<dyn Transport>> {
    match task {
        Some(handle) => {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(Error::Connection(format!("Connect task failed: {}", e))));
            *task = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn recv_from(transport: &mut Option<Box<dyn Transport>>) -> Option<Result<String>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

//! Grapevine protocol vocabulary
//!
//! Event names and typed payloads for the frames exchanged with the hub.
//! Payloads travel as `serde_json::Value`; these types are for callers who
//! want to build or inspect them without hand-written JSON.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Event names
pub mod events {
    pub const AUTHENTICATE: &str = "authenticate";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const RESTART: &str = "restart";

    pub const CHANNELS_SUBSCRIBE: &str = "channels/subscribe";
    pub const CHANNELS_UNSUBSCRIBE: &str = "channels/unsubscribe";
    pub const CHANNELS_SEND: &str = "channels/send";
    pub const CHANNELS_BROADCAST: &str = "channels/broadcast";

    pub const TELLS_SEND: &str = "tells/send";
    pub const TELLS_RECEIVE: &str = "tells/receive";

    pub const PLAYERS_SIGN_IN: &str = "players/sign-in";
    pub const PLAYERS_SIGN_OUT: &str = "players/sign-out";
    pub const PLAYERS_STATUS: &str = "players/status";

    pub const GAMES_CONNECT: &str = "games/connect";
    pub const GAMES_DISCONNECT: &str = "games/disconnect";
    pub const GAMES_STATUS: &str = "games/status";
}

/// Payload of the `authenticate` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authenticate {
    pub client_id: String,
    pub client_secret: String,
    pub supports: Vec<String>,
    pub channels: Vec<String>,
    pub version: String,
    pub user_agent: String,
}

/// Payload of the client's `heartbeat` answer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    pub players: Vec<String>,
}

/// Hub announcement that it is about to restart
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Restart {
    /// Expected downtime in seconds
    pub downtime: u64,
}

/// Name payload for `players/sign-in` and `players/sign-out` requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerName {
    pub name: String,
}

/// A remote player signing in or out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerPresence {
    pub game: String,
    pub name: String,
}

/// A remote game connecting or disconnecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamePresence {
    pub game: String,
}

/// Online players for one game
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStatus {
    pub game: String,
    #[serde(default)]
    pub players: Vec<String>,
}

/// Reply to the snapshot request: every connected game and its players
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub games: Vec<PlayerStatus>,
}

/// Channel name payload for subscribe/unsubscribe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub channel: String,
}

/// Outbound channel message (`channels/send`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub name: String,
    pub message: String,
}

/// Inbound channel message (`channels/broadcast`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBroadcast {
    pub channel: String,
    #[serde(default)]
    pub game: Option<String>,
    pub name: String,
    pub message: String,
}

/// Outbound tell (`tells/send`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tell {
    pub from_name: String,
    pub to_game: String,
    pub to_name: String,
    pub sent_at: DateTime<Utc>,
    pub message: String,
}

/// Inbound tell (`tells/receive`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TellReceived {
    pub from_game: String,
    pub from_name: String,
    pub to_name: String,
    pub sent_at: DateTime<Utc>,
    pub message: String,
}

/// Deserialize a frame payload into a typed value
pub fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    Ok(T::deserialize(payload)?)
}

/// Serialize a typed value into a frame payload
pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    #[test]
    fn test_decode_broadcast() {
        let payload = json!({
            "channel": "secrets",
            "game": "OtherGame",
            "name": "SomePlayer",
            "message": "shhh"
        });

        let broadcast: ChannelBroadcast = decode(&payload).unwrap();
        assert_eq!(broadcast.channel, "secrets");
        assert_eq!(broadcast.game.as_deref(), Some("OtherGame"));
        assert_eq!(broadcast.message, "shhh");
    }

    #[test]
    fn test_decode_wrong_shape() {
        let result: Result<Restart> = decode(&json!({"downtime": "soon"}));
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_tell_timestamp_format() {
        let tell = Tell {
            from_name: "SomePlayer".to_string(),
            to_game: "SomeGame".to_string(),
            to_name: "SomeOtherPlayer".to_string(),
            sent_at: "2024-01-02T03:04:05Z".parse().unwrap(),
            message: "test".to_string(),
        };

        let value = encode(&tell).unwrap();
        assert_eq!(value["sent_at"], "2024-01-02T03:04:05Z");
        assert_eq!(value["to_game"], "SomeGame");
    }

    #[test]
    fn test_snapshot_missing_players() {
        let snapshot: Snapshot = decode(&json!({"games": [{"game": "Empty"}]})).unwrap();
        assert_eq!(snapshot.games.len(), 1);
        assert!(snapshot.games[0].players.is_empty());
    }
}

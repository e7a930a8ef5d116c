//! Local view of the remote network
//!
//! Which games are connected to the hub and which of their players are
//! signed in, built purely from inbound frames. Names are matched
//! case-insensitively but kept in the spelling the hub last sent.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::protocol::{PlayerStatus, Snapshot};

/// A remote player located by [`Games::find_player`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerRef {
    pub name: String,
    pub game: String,
}

/// One other game on the network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteGame {
    pub name: String,
    /// Lowercased name -> display name
    players: BTreeMap<String, String>,
}

impl RemoteGame {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            players: BTreeMap::new(),
        }
    }

    /// Display names of online players, sorted case-insensitively
    pub fn players(&self) -> impl Iterator<Item = &str> {
        self.players.values().map(String::as_str)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn has_player(&self, name: &str) -> bool {
        self.players.contains_key(&name.to_lowercase())
    }

    fn sign_in(&mut self, name: &str) {
        self.players.insert(name.to_lowercase(), name.to_string());
    }

    fn sign_out(&mut self, name: &str) -> bool {
        self.players.remove(&name.to_lowercase()).is_some()
    }

    fn set_players<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.players.clear();
        for name in names {
            self.sign_in(name.as_ref());
        }
    }
}

/// Snapshot of every known remote game
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Games {
    /// Lowercased game name -> game
    games: BTreeMap<String, RemoteGame>,
}

impl Games {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&RemoteGame> {
        self.games.get(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteGame> {
        self.games.values()
    }

    /// Look up a `player@game` identifier
    pub fn find_player(&self, identifier: &str) -> Result<PlayerRef> {
        let not_found = || Error::PlayerNotFound {
            identifier: identifier.to_string(),
        };

        let (player, game) = identifier.trim().split_once('@').ok_or_else(not_found)?;
        if player.is_empty() || game.is_empty() {
            return Err(not_found());
        }

        let game = self.get(game).ok_or_else(not_found)?;
        let name = game.players.get(&player.to_lowercase()).ok_or_else(not_found)?;

        Ok(PlayerRef {
            name: name.clone(),
            game: game.name.clone(),
        })
    }

    /// Replace everything with a fresh snapshot
    pub(crate) fn apply_snapshot(&mut self, snapshot: Snapshot) {
        self.games.clear();
        for status in snapshot.games {
            self.apply_status(status);
        }
    }

    /// Replace one game's roster
    pub(crate) fn apply_status(&mut self, status: PlayerStatus) {
        self.entry(&status.game).set_players(&status.players);
    }

    pub(crate) fn game_connected(&mut self, game: &str) {
        self.entry(game);
    }

    pub(crate) fn game_disconnected(&mut self, game: &str) -> bool {
        self.games.remove(&game.to_lowercase()).is_some()
    }

    pub(crate) fn player_signed_in(&mut self, game: &str, name: &str) {
        self.entry(game).sign_in(name);
    }

    pub(crate) fn player_signed_out(&mut self, game: &str, name: &str) -> bool {
        self.games
            .get_mut(&game.to_lowercase())
            .map(|g| g.sign_out(name))
            .unwrap_or(false)
    }

    pub(crate) fn clear(&mut self) {
        self.games.clear();
    }

    /// Existing game, or a new empty one. Refreshes the display name.
    fn entry(&mut self, name: &str) -> &mut RemoteGame {
        let game = self
            .games
            .entry(name.to_lowercase())
            .or_insert_with(|| RemoteGame::new(name));
        game.name = name.to_string();
        game
    }
}

impl Serialize for Games {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.games.len()))?;
        for game in self.games.values() {
            let players: Vec<&str> = game.players().collect();
            map.serialize_entry(&game.name, &players)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn games() -> Games {
        let mut games = Games::new();
        games.apply_snapshot(Snapshot {
            games: vec![
                PlayerStatus {
                    game: "OtherGame".into(),
                    players: vec!["bob".into(), "Alice".into()],
                },
                PlayerStatus {
                    game: "SomeGame".into(),
                    players: vec!["SomeOtherPlayer".into()],
                },
            ],
        });
        games
    }

    #[test]
    fn test_find_player() {
        let games = games();

        assert_eq!(
            games.find_player("bob@othergame").unwrap(),
            PlayerRef {
                name: "bob".into(),
                game: "OtherGame".into()
            }
        );
        assert_eq!(
            games.find_player("someotherplayer@somegame").unwrap(),
            PlayerRef {
                name: "SomeOtherPlayer".into(),
                game: "SomeGame".into()
            }
        );
    }

    #[test]
    fn test_find_player_misses() {
        let games = games();

        for identifier in ["carol@othergame", "bob@nogame", "bob", "@othergame", "bob@", ""] {
            assert_eq!(
                games.find_player(identifier),
                Err(Error::PlayerNotFound {
                    identifier: identifier.into()
                }),
                "identifier {:?}",
                identifier
            );
        }
    }

    #[test]
    fn test_presence_updates() {
        let mut games = games();

        games.player_signed_in("othergame", "Carol");
        assert!(games.find_player("carol@OtherGame").is_ok());
        // Display name follows the latest frame
        assert_eq!(games.get("OTHERGAME").unwrap().name, "othergame");

        assert!(games.player_signed_out("OtherGame", "BOB"));
        assert!(games.find_player("bob@othergame").is_err());
        assert!(!games.player_signed_out("Unknown", "bob"));

        games.game_connected("NewGame");
        assert_eq!(games.get("newgame").unwrap().player_count(), 0);

        assert!(games.game_disconnected("somegame"));
        assert!(games.get("SomeGame").is_none());
        assert_eq!(games.len(), 2);
    }

    #[test]
    fn test_status_replaces_roster() {
        let mut games = games();
        games.apply_status(PlayerStatus {
            game: "OtherGame".into(),
            players: vec!["Dave".into()],
        });

        let players: Vec<&str> = games.get("othergame").unwrap().players().collect();
        assert_eq!(players, vec!["Dave"]);
    }

    #[test]
    fn test_snapshot_replaces_everything() {
        let mut games = games();
        games.apply_snapshot(Snapshot::default());
        assert!(games.is_empty());
    }

    #[test]
    fn test_serialize_shape() {
        let value = serde_json::to_value(games()).unwrap();
        assert_eq!(value["OtherGame"], serde_json::json!(["Alice", "bob"]));
        assert_eq!(value["SomeGame"], serde_json::json!(["SomeOtherPlayer"]));
    }
}

//! Demo session against the Grapevine network
//!
//! Registers listeners that log inbound traffic, then walks the client
//! through connect, player sign-in, channel traffic, a tell and close.

use chrono::Utc;
use grapevine_net::protocol::{self, ChannelBroadcast, ChannelMessage, Restart, Tell, TellReceived};
use grapevine_net::{events, Client, Config, Error, Result};
use tracing::{error, info, warn};

const PLAYER: &str = "SomePlayer";
const CHANNEL: &str = "secrets";

/// Wire logging listeners onto a client
pub fn attach_listeners(client: &Client) {
    client.on_error(|e| {
        if e.is_disconnect() {
            warn!(error = %e, "Connection problem");
        } else {
            error!(error = %e, "Client error");
        }
    });

    client.on(events::CHANNELS_BROADCAST, |payload| {
        match protocol::decode::<ChannelBroadcast>(payload) {
            Ok(b) => info!(
                channel = %b.channel,
                game = b.game.as_deref().unwrap_or("-"),
                name = %b.name,
                "{}",
                b.message
            ),
            Err(e) => warn!(error = %e, "Unreadable broadcast"),
        }
    });

    client.on(events::TELLS_RECEIVE, |payload| {
        match protocol::decode::<TellReceived>(payload) {
            Ok(t) => info!(from = %format!("{}@{}", t.from_name, t.from_game), to = %t.to_name, "{}", t.message),
            Err(e) => warn!(error = %e, "Unreadable tell"),
        }
    });

    client.on(events::RESTART, |payload| {
        if let Ok(r) = protocol::decode::<Restart>(payload) {
            warn!(downtime_s = r.downtime, "Hub restarting");
        }
    });

    for event in [events::GAMES_CONNECT, events::GAMES_DISCONNECT] {
        client.on(event, move |payload| info!(event = event, game = %payload["game"], "Game presence"));
    }
}

/// Run the demo session
pub async fn run(config: Config) -> Result<()> {
    let client = Client::init(config)?;
    attach_listeners(&client);

    client.connect().await?;
    let games = client.games();
    info!(games = games.len(), "Connected to Grapevine");
    for game in games.iter() {
        let players: Vec<&str> = game.players().collect();
        info!(game = %game.name, players = ?players, "Remote game");
    }

    client.add_player(PLAYER).await?;

    client.subscribe_channel(CHANNEL).await?;
    client
        .broadcast(&ChannelMessage {
            channel: CHANNEL.to_string(),
            name: PLAYER.to_string(),
            message: "shhh".to_string(),
        })
        .await?;
    client.unsubscribe_channel(CHANNEL).await?;

    match client.find_player("someotherplayer@somegame") {
        Ok(target) => {
            let tell = Tell {
                from_name: PLAYER.to_string(),
                to_game: target.game,
                to_name: target.name,
                sent_at: Utc::now(),
                message: "test".to_string(),
            };
            client.send_tell(&tell).await?;
        }
        Err(e @ Error::PlayerNotFound { .. }) => info!("{}", e),
        Err(e) => return Err(e),
    }

    info!(alive = client.is_alive(), "Before close");
    client.remove_player(PLAYER).await?;
    client.close();
    info!(alive = client.is_alive(), "After close");

    Ok(())
}

//! Grapevine demo client
//!
//! Connects a pretend game to the Grapevine network, walks through the
//! common operations and logs whatever the network sends back.
//!
//! Configuration comes from a TOML file given as the first argument or in
//! `GRAPEVINE_CONFIG`, falling back to `GRAPEVINE_CLIENT_ID` and
//! `GRAPEVINE_CLIENT_SECRET`.

use std::path::PathBuf;

use grapevine_net::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod network;

/// Where the configuration is read from
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConfigSource {
    File(PathBuf),
    Env { client_id: String, client_secret: String },
}

impl ConfigSource {
    fn resolve(
        arg: Option<String>,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, String> {
        if let Some(path) = arg.or_else(|| var("GRAPEVINE_CONFIG")) {
            return Ok(ConfigSource::File(PathBuf::from(path)));
        }

        match (var("GRAPEVINE_CLIENT_ID"), var("GRAPEVINE_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Ok(ConfigSource::Env {
                client_id,
                client_secret,
            }),
            _ => Err(
                "usage: grapevine-app <config.toml> (or set GRAPEVINE_CLIENT_ID and GRAPEVINE_CLIENT_SECRET)"
                    .to_string(),
            ),
        }
    }

    fn load(&self) -> grapevine_net::Result<Config> {
        match self {
            ConfigSource::File(path) => Config::from_file(path),
            ConfigSource::Env {
                client_id,
                client_secret,
            } => Ok(Config::new(client_id.clone(), client_secret.clone())),
        }
    }
}

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting Grapevine demo");

    let source = match ConfigSource::resolve(std::env::args().nth(1), |k| std::env::var(k).ok()) {
        Ok(source) => source,
        Err(usage) => {
            tracing::error!("{}", usage);
            std::process::exit(2);
        }
    };

    let config = match source.load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(network::run(config)) {
        tracing::error!("Demo failed: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_argument_wins() {
        let source = ConfigSource::resolve(
            Some("game.toml".into()),
            env(&[("GRAPEVINE_CONFIG", "other.toml")]),
        )
        .unwrap();
        assert_eq!(source, ConfigSource::File(PathBuf::from("game.toml")));
    }

    #[test]
    fn test_env_credentials() {
        let source = ConfigSource::resolve(
            None,
            env(&[
                ("GRAPEVINE_CLIENT_ID", "id"),
                ("GRAPEVINE_CLIENT_SECRET", "secret"),
            ]),
        )
        .unwrap();

        let config = source.load().unwrap();
        assert_eq!(config.client_id, "id");
        assert_eq!(config.endpoint, grapevine_net::DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_missing_everything() {
        assert!(ConfigSource::resolve(None, env(&[("GRAPEVINE_CLIENT_ID", "id")])).is_err());
    }
}

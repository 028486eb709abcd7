use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::ConfigError;

/// Realtime chat relay server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "relay-server", version, about = "Realtime chat relay server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "RELAY_PORT", default_value = "8080")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "RELAY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./relay.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "RELAY_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Display name used when a client connects without one
    #[arg(long, env = "RELAY_DEFAULT_USERNAME", default_value = "Anonymous")]
    pub default_username: String,

    /// Hub settings (loaded from [hub] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub hub: HubConfig,

    /// Per-connection settings (loaded from [session] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub session: SessionConfig,
}

/// Hub mailbox sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Commands queued for the Hub before senders wait (default: 256)
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

/// Outbound queue size and liveness timers for each connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Envelopes buffered per connection before it is evicted (default: 256)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Seconds between server pings (default: 54)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds without a pong before the connection is dropped (default: 60)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    /// Upper bound on a single frame write, in seconds (default: 10)
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl SessionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

/// A new member's queue must hold its welcome and its own join, both queued
/// before the session starts draining.
pub const MIN_QUEUE_CAPACITY: usize = 2;

fn default_mailbox_capacity() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    54
}

fn default_pong_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./relay.toml".to_string(),
            json_logs: false,
            generate_config: false,
            default_username: "Anonymous".to_string(),
            hub: HubConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (RELAY_*) < CLI args
    ///
    /// Only flags actually given on the command line (or through their env
    /// var) are layered on top, so clap's own defaults never mask the file.
    pub fn load() -> Result<Self, figment::Error> {
        let matches = Config::command().get_matches();
        let cli = Config::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("RELAY_").split("__"))
            .merge(Serialized::defaults(explicit_cli_values(&cli, &matches)))
            .extract()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.mailbox_capacity == 0 {
            return Err(ConfigError::Zero("hub.mailbox_capacity"));
        }
        let session = &self.session;
        if session.queue_capacity < MIN_QUEUE_CAPACITY {
            return Err(ConfigError::QueueTooSmall {
                got: session.queue_capacity,
                min: MIN_QUEUE_CAPACITY,
            });
        }
        if session.ping_interval_secs == 0 {
            return Err(ConfigError::Zero("session.ping_interval_secs"));
        }
        if session.pong_timeout_secs == 0 {
            return Err(ConfigError::Zero("session.pong_timeout_secs"));
        }
        if session.write_timeout_secs == 0 {
            return Err(ConfigError::Zero("session.write_timeout_secs"));
        }
        if session.ping_interval_secs >= session.pong_timeout_secs {
            return Err(ConfigError::PingNotShorterThanPong {
                ping: session.ping_interval_secs,
                pong: session.pong_timeout_secs,
            });
        }
        Ok(())
    }
}

/// Top-level values whose source is the command line or an env var.
fn explicit_cli_values(cli: &Config, matches: &ArgMatches) -> Map<String, Value> {
    let Ok(Value::Object(all)) = serde_json::to_value(cli) else {
        return Map::new();
    };
    let command = Config::command();
    all.into_iter()
        .filter(|(key, _)| {
            command.get_arguments().any(|arg| arg.get_id().as_str() == key.as_str())
                && matches!(
                    matches.value_source(key),
                    Some(ValueSource::CommandLine) | Some(ValueSource::EnvVariable)
                )
        })
        .collect()
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Chat Relay Server Configuration
# Place this file at ./relay.toml or specify with --config <path>
# All settings can be overridden via environment variables (RELAY_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Name given to clients that connect without ?username=
# default_username = "Anonymous"

# ---- Hub ----
# [hub]

# Commands buffered for the hub; chat senders wait when it is full
# mailbox_capacity = 256

# ---- Sessions ----
# [session]

# Envelopes buffered per connection (minimum 2). A connection whose buffer
# is full when a message is broadcast is disconnected.
# queue_capacity = 256

# Liveness: the server pings every ping_interval_secs and drops the
# connection if no pong arrives within pong_timeout_secs.
# ping_interval_secs = 54
# pong_timeout_secs = 60

# Maximum time a single frame write may take
# write_timeout_secs = 10
"#
    .to_string()
}

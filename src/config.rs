use std::collections::HashMap;
use std::env::var;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::store::enforcer::BanSources;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read configuration file {0} : {1}")]
    Read(PathBuf, std::io::Error),
    #[error("Could not parse configuration : {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub log_level: Option<String>,
    #[serde(default = "default_bans_file")]
    pub bans_file: PathBuf,
    #[serde(default = "default_exemptions_file")]
    pub exemptions_file: PathBuf,
    #[serde(default)]
    pub commands: CommandsConfig,
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandsConfig {
    /// Keyed `"<trigger>"`, `"<trigger>.type<N>"` or `"<trigger>.<channel>"`.
    #[serde(default)]
    pub access_overrides: HashMap<String, i32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub bind: Option<IpAddr>,
    #[serde(default = "default_subscribe_user")]
    pub subscribe_user: String,
    #[serde(default = "default_reconnect_delay", deserialize_with = "duration")]
    pub reconnect_delay: Duration,
    /// -1 keeps retrying forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_ping_interval", deserialize_with = "duration")]
    pub ping_interval: Duration,
    #[serde(default = "default_ping_timeout", deserialize_with = "duration")]
    pub ping_timeout: Duration,
    #[serde(default = "default_true")]
    pub rdns: bool,
    /// Enabled local ban match modes, all of them when absent.
    #[serde(default)]
    pub ban_sources: Option<Vec<String>>,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: char,
    /// Channel name to channel type, consumed by the chat relay.
    #[serde(default)]
    pub channels: HashMap<String, i32>,
}

impl ConnectionConfig {
    pub fn new(name: &str, host: &str, port: u16, password: &str) -> ConnectionConfig {
        ConnectionConfig {
            name: name.to_string(),
            host: host.to_string(),
            port,
            password: password.to_string(),
            bind: None,
            subscribe_user: default_subscribe_user(),
            reconnect_delay: default_reconnect_delay(),
            max_attempts: default_max_attempts(),
            ping_interval: default_ping_interval(),
            ping_timeout: default_ping_timeout(),
            rdns: false,
            ban_sources: None,
            command_prefix: default_command_prefix(),
            channels: HashMap::new(),
        }
    }

    pub fn sources(&self) -> BanSources {
        match &self.ban_sources {
            None => BanSources::default(),
            Some(list) => BanSources {
                steamid: list.iter().any(|s| s == "steamid"),
                ip: list.iter().any(|s| s == "ip"),
                hwid: list.iter().any(|s| s == "hwid"),
                rdns: list.iter().any(|s| s == "rdns"),
                name: list.iter().any(|s| s == "name"),
            },
        }
    }
}

fn default_bans_file() -> PathBuf {
    PathBuf::from("bans.dat")
}

fn default_exemptions_file() -> PathBuf {
    PathBuf::from("exemptions.dat")
}

fn default_subscribe_user() -> String {
    "overseer".to_string()
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> i64 {
    -1
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(45)
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_true() -> bool {
    true
}

fn default_command_prefix() -> char {
    '!'
}

fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Configuration file path from `OVERSEER_CONFIG`, `overseer.yml` otherwise.
pub fn config_path() -> PathBuf {
    var("OVERSEER_CONFIG").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("overseer.yml"))
}

pub fn load() -> Result<Config, ConfigError> {
    load_from(&config_path())
}

pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::Read(path.to_path_buf(), err))?;
    Ok(serde_yaml::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_connection_section() {
        let raw = r##"
log_level: info
bans_file: data/bans.dat
commands:
  access_overrides:
    kick: 1
    "kick.type0": 2
    "kick.#admin": 4
connections:
  - name: main
    host: game.example
    port: 7777
    password: secret
    reconnect_delay: 10s
    max_attempts: 5
    ping_interval: 30s
    ping_timeout: 2m
    rdns: false
    ban_sources: [steamid, ip]
    channels:
      "#admin": 1
      "#public": 0
"##;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.bans_file, PathBuf::from("data/bans.dat"));
        assert_eq!(config.exemptions_file, PathBuf::from("exemptions.dat"));
        assert_eq!(config.commands.access_overrides["kick.#admin"], 4);

        let connection = &config.connections[0];
        assert_eq!(connection.reconnect_delay, Duration::from_secs(10));
        assert_eq!(connection.ping_timeout, Duration::from_secs(120));
        assert_eq!(connection.max_attempts, 5);
        assert!(!connection.rdns);
        let sources = connection.sources();
        assert!(sources.steamid && sources.ip);
        assert!(!sources.hwid && !sources.rdns && !sources.name);
        assert_eq!(connection.channels["#admin"], 1);
    }

    #[test]
    fn defaults_fill_the_gaps() {
        let raw = r#"
connections:
  - name: main
    host: 127.0.0.1
    port: 7777
    password: secret
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        let connection = &config.connections[0];
        assert_eq!(connection.subscribe_user, "overseer");
        assert_eq!(connection.max_attempts, -1);
        assert_eq!(connection.command_prefix, '!');
        assert!(connection.rdns);
        let sources = connection.sources();
        assert!(sources.steamid && sources.ip && sources.hwid && sources.rdns && sources.name);
    }
}

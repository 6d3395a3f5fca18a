// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! Server configuration.
//!
//! Loaded from a single JSON file. Every scalar has a default so a minimal
//! config is just `{}`; `validate()` reports the first offending field path.

use crate::access::{AccessPolicy, PatternError};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value: {0}")]
    Invalid(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] PatternError),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub blacklist: BlacklistSection,

    #[serde(default)]
    pub repeater_configurations: RepeaterConfigurations,

    #[serde(default)]
    pub outbound_connections: Vec<OutboundConfig>,

    #[serde(default)]
    pub connection_type_detection: ConnectionTypeDetection,

    #[serde(default)]
    pub event_emitter: EventEmitterConfig,
}

/// The `global` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Address to bind the HBP UDP socket to.
    #[serde(default = "default_bind_ipv4")]
    pub bind_ipv4: IpAddr,

    /// HBP UDP port (default: 62031).
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file; stderr only when absent.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Keepalive interval expected from peers, seconds.
    #[serde(default = "default_ping_time")]
    pub ping_time: f64,

    /// Missed keepalives before a peer is declared dead.
    #[serde(default = "default_max_missed_pings")]
    pub max_missed_pings: u32,

    /// Inactivity window after which a stream is considered ended, seconds.
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout: f64,

    /// Post-end slot reservation window, seconds.
    #[serde(default = "default_hang_time")]
    pub hang_time: f64,

    /// User routing cache TTL, seconds.
    #[serde(default = "default_user_cache_timeout")]
    pub user_cache_timeout: u64,

    /// Daily counters file, written at shutdown.
    #[serde(default = "default_counters_file")]
    pub counters_file: PathBuf,
}

fn default_bind_ipv4() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_bind_port() -> u16 {
    crate::protocol::DMR_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ping_time() -> f64 {
    5.0
}

fn default_max_missed_pings() -> u32 {
    3
}

fn default_stream_timeout() -> f64 {
    2.0
}

fn default_hang_time() -> f64 {
    3.0
}

fn default_user_cache_timeout() -> u64 {
    600
}

fn default_counters_file() -> PathBuf {
    PathBuf::from("hbmaster_counters.json")
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            bind_ipv4: default_bind_ipv4(),
            bind_port: default_bind_port(),
            log_level: default_log_level(),
            log_file: None,
            ping_time: default_ping_time(),
            max_missed_pings: default_max_missed_pings(),
            stream_timeout: default_stream_timeout(),
            hang_time: default_hang_time(),
            user_cache_timeout: default_user_cache_timeout(),
            counters_file: default_counters_file(),
        }
    }
}

impl GlobalConfig {
    pub fn ping_time(&self) -> Duration {
        Duration::from_secs_f64(self.ping_time)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stream_timeout)
    }

    pub fn hang_time(&self) -> Duration {
        Duration::from_secs_f64(self.hang_time)
    }

    pub fn user_cache_timeout(&self) -> Duration {
        Duration::from_secs(self.user_cache_timeout)
    }
}

/// Match criteria of a rule. Kinds are ORed; at least one must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default)]
    pub ids: Vec<u32>,

    /// Inclusive ranges, `[[start, end], ...]`.
    #[serde(default)]
    pub id_ranges: Vec<(u32, u32)>,

    /// Callsign globs; `*` matches any run of characters.
    #[serde(default)]
    pub callsigns: Vec<String>,
}

/// The `blacklist` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlacklistSection {
    #[serde(default)]
    pub patterns: Vec<BlacklistRuleConfig>,
}

/// One blacklist rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistRuleConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub r#match: RuleMatch,
    pub reason: String,
}

/// The `repeater_configurations` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeaterConfigurations {
    #[serde(default)]
    pub patterns: Vec<PatternRuleConfig>,

    #[serde(default)]
    pub default: PeerConfig,
}

impl Default for RepeaterConfigurations {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            default: PeerConfig::default(),
        }
    }
}

/// One configuration pattern rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRuleConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub r#match: RuleMatch,
    pub config: PeerConfig,
}

/// Configuration applied to a matched peer.
///
/// An absent talkgroup list means the slot is unrestricted; an empty list
/// denies everything on that slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub passphrase: String,

    #[serde(default)]
    pub slot1_talkgroups: Option<Vec<u32>>,

    #[serde(default)]
    pub slot2_talkgroups: Option<Vec<u32>>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            passphrase: "passw0rd".to_string(),
            slot1_talkgroups: Some(vec![8]),
            slot2_talkgroups: Some(vec![8]),
        }
    }
}

/// One `outbound_connections` entry: an upstream master we dial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub name: String,
    pub address: String,
    pub port: u16,
    pub radio_id: u32,

    /// `password` is accepted as a legacy synonym.
    #[serde(alias = "password")]
    pub passphrase: String,

    /// RPTO body to subscribe with, e.g. `TS1=3100;TS2=3120`. Empty = none.
    #[serde(default)]
    pub options: String,

    #[serde(default)]
    pub callsign: String,
    #[serde(default)]
    pub rx_frequency: u64,
    #[serde(default)]
    pub tx_frequency: u64,
    #[serde(default)]
    pub power: u32,
    #[serde(default = "default_colorcode")]
    pub colorcode: u32,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_software_id")]
    pub software_id: String,
    #[serde(default = "default_package_id")]
    pub package_id: String,
}

fn default_true() -> bool {
    true
}

fn default_colorcode() -> u32 {
    1
}

fn default_software_id() -> String {
    "HBMaster".to_string()
}

fn default_package_id() -> String {
    format!("HBMaster v{}", env!("CARGO_PKG_VERSION"))
}

/// The `connection_type_detection` section: case-insensitive substrings
/// matched against package_id (primary) then software_id (fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTypeDetection {
    #[serde(default = "default_hotspot_packages")]
    pub hotspot_packages: Vec<String>,

    #[serde(default = "default_network_packages")]
    pub network_packages: Vec<String>,

    #[serde(default = "default_repeater_packages")]
    pub repeater_packages: Vec<String>,
}

fn default_hotspot_packages() -> Vec<String> {
    ["mmdvm_hs", "dmo", "dvmega", "zumspot", "openspot", "pi-star", "ps4", "wpsd"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_network_packages() -> Vec<String> {
    ["hblink", "freedmr", "xlx", "ipsc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_repeater_packages() -> Vec<String> {
    ["mmdvm", "unknown"].iter().map(|s| s.to_string()).collect()
}

impl Default for ConnectionTypeDetection {
    fn default() -> Self {
        Self {
            hotspot_packages: default_hotspot_packages(),
            network_packages: default_network_packages(),
            repeater_packages: default_repeater_packages(),
        }
    }
}

/// Event emitter transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitterTransport {
    Unix,
    Tcp,
}

/// The `event_emitter` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEmitterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_transport")]
    pub transport: EmitterTransport,

    /// TCP bind host.
    #[serde(default = "default_emitter_host")]
    pub host: IpAddr,

    /// TCP bind port.
    #[serde(default = "default_emitter_port")]
    pub port: u16,

    /// Unix stream socket path (mode 0660).
    #[serde(default = "default_unix_socket")]
    pub unix_socket: PathBuf,
}

fn default_transport() -> EmitterTransport {
    EmitterTransport::Unix
}

fn default_emitter_host() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn default_emitter_port() -> u16 {
    8765
}

fn default_unix_socket() -> PathBuf {
    PathBuf::from("/tmp/hbmaster.sock")
}

impl Default for EventEmitterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: default_transport(),
            host: default_emitter_host(),
            port: default_emitter_port(),
            unix_socket: default_unix_socket(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration; errors name the offending field path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global.bind_port == 0 {
            return Err(ConfigError::Invalid("global.bind_port cannot be 0".into()));
        }
        if self.global.ping_time <= 0.0 {
            return Err(ConfigError::Invalid(
                "global.ping_time must be positive".into(),
            ));
        }
        if self.global.stream_timeout <= 0.0 {
            return Err(ConfigError::Invalid(
                "global.stream_timeout must be positive".into(),
            ));
        }
        if self.global.hang_time < 0.0 {
            return Err(ConfigError::Invalid(
                "global.hang_time cannot be negative".into(),
            ));
        }
        if !LOG_LEVELS.contains(&self.global.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "global.log_level '{}' (expected one of {})",
                self.global.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        // Compiling the rules performs all pattern validation.
        self.access_policy()?;

        for (i, outbound) in self.outbound_connections.iter().enumerate() {
            let field = |name: &str| format!("outbound_connections[{}].{}", i, name);
            if outbound.name.is_empty() {
                return Err(ConfigError::Invalid(format!("{} is empty", field("name"))));
            }
            if outbound.address.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{} is empty",
                    field("address")
                )));
            }
            if outbound.passphrase.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{} is empty",
                    field("passphrase")
                )));
            }
            if outbound.port == 0 {
                return Err(ConfigError::Invalid(format!("{} cannot be 0", field("port"))));
            }
            if outbound.radio_id == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{} cannot be 0",
                    field("radio_id")
                )));
            }
        }

        if self.event_emitter.enabled {
            match self.event_emitter.transport {
                EmitterTransport::Unix => {
                    if self.event_emitter.unix_socket.as_os_str().is_empty() {
                        return Err(ConfigError::Invalid(
                            "event_emitter.unix_socket is empty".into(),
                        ));
                    }
                }
                EmitterTransport::Tcp => {
                    if self.event_emitter.port == 0 {
                        return Err(ConfigError::Invalid(
                            "event_emitter.port cannot be 0".into(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Compile the access policy from the blacklist and pattern sections.
    pub fn access_policy(&self) -> Result<AccessPolicy, PatternError> {
        AccessPolicy::compile(
            &self.blacklist.patterns,
            &self.repeater_configurations.patterns,
            self.repeater_configurations.default.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        assert_eq!(config.global.bind_port, 62031);
        assert_eq!(config.global.ping_time, 5.0);
        assert_eq!(config.global.max_missed_pings, 3);
        assert_eq!(config.global.stream_timeout, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_json() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.global.user_cache_timeout, 600);
        assert_eq!(
            config.repeater_configurations.default.slot1_talkgroups,
            Some(vec![8])
        );
    }

    #[test]
    fn test_full_sections_parse() {
        let json = r#"{
            "global": {
                "bind_ipv4": "0.0.0.0",
                "bind_port": 62031,
                "log_level": "debug",
                "ping_time": 5,
                "max_missed_pings": 3,
                "stream_timeout": 2.0,
                "hang_time": 10.0,
                "user_cache_timeout": 600
            },
            "blacklist": {
                "patterns": [
                    {
                        "name": "banned",
                        "description": "Banned IDs",
                        "match": { "ids": [123456] },
                        "reason": "abuse"
                    }
                ]
            },
            "repeater_configurations": {
                "patterns": [
                    {
                        "name": "KS-DMR Network",
                        "description": "Repeaters in the KS-DMR network",
                        "match": {
                            "ids": [315035],
                            "id_ranges": [[312000, 312099]],
                            "callsigns": ["KS0*"]
                        },
                        "config": {
                            "passphrase": "s3cret",
                            "slot1_talkgroups": [1, 2, 3, 9],
                            "slot2_talkgroups": [3120]
                        }
                    }
                ],
                "default": {
                    "passphrase": "passw0rd",
                    "slot1_talkgroups": [8],
                    "slot2_talkgroups": [8]
                }
            },
            "outbound_connections": [
                {
                    "name": "upstream",
                    "address": "master.example.net",
                    "port": 62031,
                    "radio_id": 312000,
                    "password": "legacy-key",
                    "options": "TS1=3100;TS2=3120"
                }
            ],
            "event_emitter": {
                "enabled": true,
                "transport": "tcp",
                "host": "127.0.0.1",
                "port": 8765
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.global.hang_time, 10.0);
        assert_eq!(config.blacklist.patterns.len(), 1);
        assert_eq!(
            config.repeater_configurations.patterns[0].r#match.id_ranges,
            vec![(312000, 312099)]
        );
        // `password` is accepted as a synonym for `passphrase`.
        assert_eq!(config.outbound_connections[0].passphrase, "legacy-key");
        assert_eq!(config.event_emitter.transport, EmitterTransport::Tcp);
    }

    #[test]
    fn test_validation_bind_port_zero() {
        let mut config = Config::default();
        config.global.bind_port = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("global.bind_port"));
    }

    #[test]
    fn test_validation_bad_log_level() {
        let mut config = Config::default();
        config.global.log_level = "verbose".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("global.log_level"));
    }

    #[test]
    fn test_validation_outbound_missing_passphrase() {
        let mut config = Config::default();
        config.outbound_connections.push(OutboundConfig {
            enabled: true,
            name: "upstream".into(),
            address: "master.example.net".into(),
            port: 62031,
            radio_id: 312000,
            passphrase: String::new(),
            options: String::new(),
            callsign: String::new(),
            rx_frequency: 0,
            tx_frequency: 0,
            power: 0,
            colorcode: 1,
            latitude: 0.0,
            longitude: 0.0,
            height: 0,
            location: String::new(),
            description: String::new(),
            url: String::new(),
            software_id: default_software_id(),
            package_id: default_package_id(),
        });
        let err = config.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("outbound_connections[0].passphrase"));
    }

    #[test]
    fn test_validation_bad_range_surfaces_rule() {
        let json = r#"{
            "repeater_configurations": {
                "patterns": [
                    {
                        "name": "inverted",
                        "match": { "id_ranges": [[20, 10]] },
                        "config": { "passphrase": "x" }
                    }
                ]
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("inverted"));
    }

    #[test]
    fn test_duration_accessors() {
        let config = GlobalConfig {
            ping_time: 2.5,
            ..Default::default()
        };
        assert_eq!(config.ping_time(), Duration::from_millis(2500));
        assert_eq!(config.stream_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.global.bind_port, config.global.bind_port);
        assert_eq!(parsed.global.counters_file, config.global.counters_file);
    }
}

// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The hub's own configuration: OSC listen address, reply port, and the
//! list of configured devices. Read-file-then-deserialize-then-validate,
//! layered on the `config` crate for environment overrides.

pub mod error;

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

pub use error::ConfigError;

#[derive(Debug, Deserialize)]
pub struct HubConfig {
    pub listen: SocketAddr,
    #[serde(default)]
    pub reply_port: Option<u16>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ReconnectConfig {
    #[serde(rename = "initialBackoffMs", default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(rename = "maxBackoffMs", default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct FeedbackConfig {
    #[serde(rename = "echoSuppressionMs", default = "default_echo_suppression_ms")]
    pub echo_suppression_ms: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            echo_suppression_ms: default_echo_suppression_ms(),
        }
    }
}

fn default_echo_suppression_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "intervalMs", default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum ViscaTransport {
    #[default]
    Tcp,
    Udp,
}

fn default_camera_address() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceConfig {
    Avantis {
        prefix: String,
        host: String,
        port: u16,
        #[serde(rename = "midiBaseChannel", default)]
        midi_base_channel: u8,
        #[serde(default)]
        feedback: FeedbackConfig,
        #[serde(default)]
        reconnect: ReconnectConfig,
        #[serde(default)]
        heartbeat: HeartbeatConfig,
    },
    Chamsys {
        prefix: String,
        host: String,
        port: u16,
        #[serde(default)]
        reconnect: ReconnectConfig,
        #[serde(default)]
        heartbeat: HeartbeatConfig,
    },
    Obs {
        prefix: String,
        host: String,
        port: u16,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        reconnect: ReconnectConfig,
        #[serde(default)]
        heartbeat: HeartbeatConfig,
    },
    Visca {
        prefix: String,
        host: String,
        port: u16,
        #[serde(default)]
        transport: ViscaTransport,
        #[serde(rename = "cameraAddress", default = "default_camera_address")]
        camera_address: u8,
    },
    Touchdesigner {
        prefix: String,
        host: String,
        port: u16,
    },
    Qlab {
        prefix: String,
        host: String,
        port: u16,
        #[serde(default)]
        passcode: Option<String>,
        #[serde(default)]
        reconnect: ReconnectConfig,
        #[serde(default)]
        heartbeat: HeartbeatConfig,
    },
}

impl DeviceConfig {
    pub fn prefix(&self) -> &str {
        match self {
            DeviceConfig::Avantis { prefix, .. }
            | DeviceConfig::Chamsys { prefix, .. }
            | DeviceConfig::Obs { prefix, .. }
            | DeviceConfig::Visca { prefix, .. }
            | DeviceConfig::Touchdesigner { prefix, .. }
            | DeviceConfig::Qlab { prefix, .. } => prefix,
        }
    }
}

/// Loads and validates the hub config from a YAML file.
pub fn load(path: &Path) -> Result<HubConfig, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(ConfigError::Load)?;
    let cfg: HubConfig = settings.try_deserialize().map_err(ConfigError::Load)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &HubConfig) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for device in &cfg.devices {
        let lower = device.prefix().to_lowercase();
        if !seen.insert(lower) {
            return Err(ConfigError::Validation(format!(
                "duplicate driver prefix: {}",
                device.prefix()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validate_rejects_case_insensitive_duplicate_prefixes() {
        let cfg = HubConfig {
            listen: "0.0.0.0:9000".parse().unwrap(),
            reply_port: None,
            devices: vec![
                DeviceConfig::Chamsys {
                    prefix: "/Lighting".into(),
                    host: "127.0.0.1".into(),
                    port: 9001,
                    reconnect: ReconnectConfig::default(),
                    heartbeat: HeartbeatConfig::default(),
                },
                DeviceConfig::Touchdesigner {
                    prefix: "/lighting".into(),
                    host: "127.0.0.1".into(),
                    port: 9002,
                },
            ],
        };
        let err = validate(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn validate_accepts_distinct_prefixes() {
        let cfg = HubConfig {
            listen: "0.0.0.0:9000".parse().unwrap(),
            reply_port: Some(9100),
            devices: vec![DeviceConfig::Chamsys {
                prefix: "/lighting".into(),
                host: "127.0.0.1".into(),
                port: 9001,
                reconnect: ReconnectConfig::default(),
                heartbeat: HeartbeatConfig::default(),
            }],
        };
        assert!(validate(&cfg).is_ok());
    }
}

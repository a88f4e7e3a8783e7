//! # Device Configuration
//!
//! One TOML document describes one device: how to reach the broker, which codec
//! to load, how publishing and confirmation behave, and which topics carry which
//! property. Keys follow the camelCase names used by existing deployments
//! (`optimizePublishing`, `confirmationPeriodms`, ...).
//!
//! Every transport option is optional. Unset values are filled with defaults when
//! the connection is built (see [`crate::mqtt::config`]), so a deployment only
//! states what it wants to change.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{LinkError, LinkResult};
use crate::topic::TopicSpec;

pub const DEFAULT_RETRY_LIMIT: u32 = 3;
const CONFIG_DIR: &str = "thinglink";
const DEVICE_CONFIG_FILE: &str = "device.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    /// Device name, used for the client id and the last-will message
    pub name: String,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cafile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    /// Skip server identity verification on TLS connections
    pub insecure: bool,
    /// Internal codec name or path to an external codec file
    pub codec: Option<String>,
    /// Suppress publishes that repeat the last payload sent on a topic
    pub optimize_publishing: bool,
    pub log_mqtt: bool,
    #[serde(rename = "debounceRecvms")]
    pub debounce_recv_ms: Option<u64>,
    #[serde(rename = "confirmationPeriodms")]
    pub confirmation_period_ms: Option<u64>,
    pub confirmation_indicate_offline: OfflineIndication,
    pub retry_limit: Option<u32>,
    pub mqtt_pub_options: PublishOptions,
    pub mqtt_options: TransportOverrides,
    pub topics: DeviceTopics,
    /// Base directory for relative external codec paths
    pub data_dir: Option<PathBuf>,
    pub json_codec: JsonCodecConfig,
    /// Property wiring used by the command line bridge
    pub properties: BTreeMap<String, PropertyTopics>,
}

impl DeviceConfig {
    pub fn from_toml_str(content: &str) -> LinkResult<Self> {
        let config: DeviceConfig = toml::from_str(content)
            .map_err(|e| LinkError::Config(format!("Failed to parse device config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> LinkResult<Self> {
        debug!("Loading device config from {}", path.display());
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            LinkError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// `<config dir>/thinglink/device.toml`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_DIR);
        path.push(DEVICE_CONFIG_FILE);
        path
    }

    pub fn validate(&self) -> LinkResult<()> {
        if self.mqtt_pub_options.qos > 2 {
            return Err(LinkError::Config(format!(
                "mqttPubOptions.qos must be 0, 1 or 2 (got {})",
                self.mqtt_pub_options.qos
            )));
        }
        if let Some(will) = &self.mqtt_options.will {
            if will.qos > 2 {
                return Err(LinkError::Config(format!(
                    "mqttOptions.will.qos must be 0, 1 or 2 (got {})",
                    will.qos
                )));
            }
        }
        if self.name.is_empty() {
            warn!("Device has no name; client id and last will use an empty name");
        }
        Ok(())
    }

    pub fn debounce(&self) -> Option<Duration> {
        self.debounce_recv_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn confirmation_period(&self) -> Option<Duration> {
        self.confirmation_period_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT)
    }

    /// Whether a confirmation timeout marks the device offline.
    ///
    /// Left unset, devices that report their own availability on an online topic
    /// keep control of the flag.
    pub fn indicates_offline_on_timeout(&self) -> bool {
        match self.confirmation_indicate_offline {
            OfflineIndication::Always => true,
            OfflineIndication::Never => false,
            OfflineIndication::Auto | OfflineIndication::Explicit => self.topics.get_online.is_none(),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push(CONFIG_DIR);
            path
        })
    }
}

/// `confirmationIndicateOffline`: `true`, `false` or `"explicit"`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OfflineIndication {
    #[default]
    Auto,
    Always,
    Never,
    /// Availability is reported by the device on its online topic when one is configured
    Explicit,
}

impl<'de> Deserialize<'de> for OfflineIndication {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Mode(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Ok(OfflineIndication::Always),
            Raw::Flag(false) => Ok(OfflineIndication::Never),
            Raw::Mode(mode) if mode == "explicit" => Ok(OfflineIndication::Explicit),
            Raw::Mode(mode) => Err(serde::de::Error::custom(format!(
                "confirmationIndicateOffline must be true, false or \"explicit\" (got \"{}\")",
                mode
            ))),
        }
    }
}

impl Serialize for OfflineIndication {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            OfflineIndication::Always => serializer.serialize_bool(true),
            OfflineIndication::Never => serializer.serialize_bool(false),
            OfflineIndication::Explicit => serializer.serialize_str("explicit"),
            OfflineIndication::Auto => serializer.serialize_none(),
        }
    }
}

/// QoS and retain flag applied to every publish
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PublishOptions {
    pub qos: u8,
    pub retain: bool,
}

/// Transport settings a deployment may override
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportOverrides {
    /// Keep-alive interval in seconds
    pub keepalive: Option<u64>,
    pub clean: Option<bool>,
    /// Delay between reconnection attempts in milliseconds
    pub reconnect_period: Option<u64>,
    /// Connection timeout in milliseconds
    pub connect_timeout: Option<u64>,
    pub client_id: Option<String>,
    pub will: Option<WillConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct WillConfig {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceTopics {
    /// Topic on which the device reports its own availability
    pub get_online: Option<TopicSpec>,
}

/// Settings of the built-in `json` codec
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct JsonCodecConfig {
    /// Property name to JSON field name; unmapped properties use their own name
    pub fields: HashMap<String, String>,
}

/// Topics of one property as wired by the command line bridge
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PropertyTopics {
    pub get: Option<TopicSpec>,
    pub set: Option<TopicSpec>,
    /// Publish through the confirmation state machine
    #[serde(default)]
    pub confirm: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_deployment_keys() {
        let config = DeviceConfig::from_toml_str(
            r#"
            name = "Lamp"
            url = "broker.local"
            optimizePublishing = true
            logMqtt = true
            debounceRecvms = 250
            confirmationPeriodms = 1000
            confirmationIndicateOffline = "explicit"
            retryLimit = 5

            [mqttPubOptions]
            qos = 1
            retain = true

            [mqttOptions]
            keepalive = 30

            [properties.on]
            get = "lamp/state"
            set = { topic = "lamp/set", apply = "return message ? 'ON' : 'OFF';" }
            confirm = true
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "Lamp");
        assert!(config.optimize_publishing);
        assert_eq!(config.debounce(), Some(Duration::from_millis(250)));
        assert_eq!(config.confirmation_period(), Some(Duration::from_secs(1)));
        assert_eq!(config.confirmation_indicate_offline, OfflineIndication::Explicit);
        assert_eq!(config.retry_limit(), 5);
        assert_eq!(config.mqtt_pub_options, PublishOptions { qos: 1, retain: true });
        assert_eq!(config.mqtt_options.keepalive, Some(30));
        assert!(config.properties["on"].confirm);
    }

    #[test]
    fn defaults_when_unset() {
        let config = DeviceConfig::from_toml_str(r#"name = "x""#).unwrap();
        assert_eq!(config.retry_limit(), DEFAULT_RETRY_LIMIT);
        assert_eq!(config.debounce(), None);
        assert_eq!(config.confirmation_period(), None);
        assert_eq!(config.confirmation_indicate_offline, OfflineIndication::Auto);
        assert!(config.indicates_offline_on_timeout());
    }

    #[test]
    fn online_topic_takes_over_liveness_unless_forced() {
        let mut config = DeviceConfig::from_toml_str(
            r#"
            name = "x"
            [topics]
            getOnline = "lamp/online"
            "#,
        )
        .unwrap();
        assert!(!config.indicates_offline_on_timeout());

        config.confirmation_indicate_offline = OfflineIndication::Always;
        assert!(config.indicates_offline_on_timeout());

        config.confirmation_indicate_offline = OfflineIndication::Never;
        assert!(!config.indicates_offline_on_timeout());

        config.confirmation_indicate_offline = OfflineIndication::Explicit;
        assert!(!config.indicates_offline_on_timeout());
        config.topics.get_online = None;
        assert!(config.indicates_offline_on_timeout());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(DeviceConfig::from_toml_str("confirmationIndicateOffline = \"sometimes\"").is_err());
        assert!(DeviceConfig::from_toml_str("[mqttPubOptions]\nqos = 3").is_err());
    }
}

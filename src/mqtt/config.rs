//! Connection options resolved from the device configuration.
//!
//! Deployment values always win; defaults only fill the gaps.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::config::{DeviceConfig, WillConfig};
use crate::mqtt::TransportError;

pub const USERNAME_ENV: &str = "THINGLINK_USERNAME";
pub const PASSWORD_ENV: &str = "THINGLINK_PASSWORD";
pub const URL_ENV: &str = "THINGLINK_URL";

const DEFAULT_KEEPALIVE_SECS: u64 = 10;
const DEFAULT_RECONNECT_PERIOD_MS: u64 = 1000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30 * 1000;
const DEFAULT_WILL_TOPIC: &str = "WillMsg";
const CLIENT_ID_PREFIX: &str = "thinglink";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
}

/// Broker address after scheme defaulting
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    pub url: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parses `scheme://host[:port][/path]`, adding `mqtt://` to bare hosts.
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let url = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("mqtt://{}", raw)
        };
        let parsed = Url::parse(&url).map_err(|_| TransportError::UnsupportedUrl(raw.to_string()))?;
        let scheme = match parsed.scheme() {
            "mqtt" | "tcp" => Scheme::Tcp,
            "mqtts" | "ssl" | "tls" => Scheme::Tls,
            _ => return Err(TransportError::UnsupportedUrl(raw.to_string())),
        };
        let host = match parsed.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(TransportError::UnsupportedUrl(raw.to_string())),
        };
        let port = parsed.port().unwrap_or(match scheme {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
        });

        Ok(Self {
            url,
            scheme,
            host,
            port,
        })
    }
}

/// Fully resolved options for one broker connection
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub broker: BrokerAddress,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub reconnect_period: Duration,
    pub connect_timeout: Duration,
    pub will: WillConfig,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cafile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub insecure: bool,
}

impl ConnectOptions {
    pub fn resolve(config: &DeviceConfig) -> Result<Self, TransportError> {
        Self::resolve_with_env(config, |key| std::env::var(key).ok())
    }

    pub(crate) fn resolve_with_env(
        config: &DeviceConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, TransportError> {
        let overrides = &config.mqtt_options;
        let raw_url = config
            .url
            .clone()
            .or_else(|| env(URL_ENV))
            .ok_or(TransportError::MissingUrl)?;

        Ok(Self {
            broker: BrokerAddress::parse(&raw_url)?,
            client_id: overrides
                .client_id
                .clone()
                .unwrap_or_else(|| client_id(&config.name)),
            keep_alive: Duration::from_secs(overrides.keepalive.unwrap_or(DEFAULT_KEEPALIVE_SECS)),
            clean_session: overrides.clean.unwrap_or(true),
            reconnect_period: Duration::from_millis(
                overrides
                    .reconnect_period
                    .unwrap_or(DEFAULT_RECONNECT_PERIOD_MS),
            ),
            connect_timeout: Duration::from_millis(
                overrides
                    .connect_timeout
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            will: overrides.will.clone().unwrap_or_else(|| WillConfig {
                topic: DEFAULT_WILL_TOPIC.to_string(),
                payload: format!("{} [{}] has stopped", CLIENT_ID_PREFIX, config.name),
                qos: 0,
                retain: false,
            }),
            username: config.username.clone().or_else(|| env(USERNAME_ENV)),
            password: config.password.clone().or_else(|| env(PASSWORD_ENV)),
            cafile: config.cafile.clone(),
            certfile: config.certfile.clone(),
            keyfile: config.keyfile.clone(),
            insecure: config.insecure,
        })
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("broker", &self.broker.url)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("reconnect_period", &self.reconnect_period)
            .field("connect_timeout", &self.connect_timeout)
            .field("will", &self.will)
            .field("username", &self.username)
            .field("cafile", &self.cafile)
            .field("certfile", &self.certfile)
            .field("keyfile", &self.keyfile)
            .field("insecure", &self.insecure)
            .finish_non_exhaustive()
    }
}

/// `thinglink_<printable name>_<8 hex chars>`; the random suffix keeps devices
/// with equal names from kicking each other off the broker.
pub fn client_id(name: &str) -> String {
    let printable: String = name.chars().filter(|c| (' '..='\x7f').contains(c)).collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", CLIENT_ID_PREFIX, printable, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportOverrides;

    fn config(url: &str) -> DeviceConfig {
        DeviceConfig {
            name: "Desk Lamp".to_string(),
            url: Some(url.to_string()),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn bare_host_gets_mqtt_scheme() {
        let broker = BrokerAddress::parse("broker.local").unwrap();
        assert_eq!(broker.url, "mqtt://broker.local");
        assert_eq!(broker.scheme, Scheme::Tcp);
        assert_eq!(broker.port, 1883);
    }

    #[test]
    fn tls_schemes_default_to_8883() {
        let broker = BrokerAddress::parse("mqtts://user@broker.local").unwrap();
        assert_eq!(broker.scheme, Scheme::Tls);
        assert_eq!(broker.host, "broker.local");
        assert_eq!(broker.port, 8883);
        assert_eq!(BrokerAddress::parse("tcp://10.0.0.2:1884").unwrap().port, 1884);
        assert!(BrokerAddress::parse("ws://broker.local").is_err());
    }

    #[test]
    fn bracketed_ipv6_hosts() {
        let broker = BrokerAddress::parse("mqtt://[::1]").unwrap();
        assert_eq!(broker.host, "[::1]");
        assert_eq!(broker.port, 1883);

        let broker = BrokerAddress::parse("ssl://[fd00::2]:9883").unwrap();
        assert_eq!(broker.scheme, Scheme::Tls);
        assert_eq!(broker.host, "[fd00::2]");
        assert_eq!(broker.port, 9883);
    }

    #[test]
    fn rejects_missing_host_and_bad_port() {
        assert!(BrokerAddress::parse("mqtt://").is_err());
        assert!(BrokerAddress::parse("mqtt://broker.local:99999").is_err());
    }

    #[test]
    fn defaults_fill_unset_options() {
        let options = ConnectOptions::resolve_with_env(&config("broker.local"), |_| None).unwrap();
        assert_eq!(options.keep_alive, Duration::from_secs(10));
        assert!(options.clean_session);
        assert_eq!(options.reconnect_period, Duration::from_millis(1000));
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.will.topic, "WillMsg");
        assert_eq!(options.will.payload, "thinglink [Desk Lamp] has stopped");
        assert!(options.client_id.starts_with("thinglink_Desk Lamp_"));
    }

    #[test]
    fn deployment_values_are_not_overridden() {
        let mut config = config("broker.local");
        config.mqtt_options = TransportOverrides {
            keepalive: Some(60),
            clean: Some(false),
            client_id: Some("fixed".to_string()),
            ..TransportOverrides::default()
        };
        config.username = Some("alice".to_string());
        let options = ConnectOptions::resolve_with_env(&config, |key| match key {
            USERNAME_ENV => Some("env-user".to_string()),
            PASSWORD_ENV => Some("env-pass".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert!(!options.clean_session);
        assert_eq!(options.client_id, "fixed");
        assert_eq!(options.username.as_deref(), Some("alice"));
        assert_eq!(options.password.as_deref(), Some("env-pass"));
    }

    #[test]
    fn url_falls_back_to_environment() {
        let config = DeviceConfig::default();
        assert!(matches!(
            ConnectOptions::resolve_with_env(&config, |_| None),
            Err(TransportError::MissingUrl)
        ));
        let options = ConnectOptions::resolve_with_env(&config, |key| {
            (key == URL_ENV).then(|| "env-broker:1999".to_string())
        })
        .unwrap();
        assert_eq!(options.broker.host, "env-broker");
        assert_eq!(options.broker.port, 1999);
    }

    #[test]
    fn client_id_strips_non_printable_characters() {
        let id = client_id("Lämp\u{1}");
        assert!(id.starts_with("thinglink_Lmp_"));
        assert_eq!(id.len(), "thinglink_Lmp_".len() + 8);
    }

    #[test]
    fn debug_output_hides_password() {
        let mut config = config("broker.local");
        config.password = Some("secret".to_string());
        let options = ConnectOptions::resolve_with_env(&config, |_| None).unwrap();
        assert!(!format!("{:?}", options).contains("secret"));
    }
}

// config.rs

use std::fmt;
use std::time::Duration;

const DEFAULT_MQTT_HOST: &str = "homeassistant";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_SLEEP_SECS: u64 = 120;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_BROKER_BACKOFF_MS: u64 = 2000;
const DEFAULT_WIFI_BACKOFF_MS: u64 = 500;

pub const CLIENT_ID_PREFIX: &str = "esp32-client-";
pub const FALLBACK_CLIENT_ID: &str = "ESPofficeClient";
pub const SENSOR_TOPIC: &str = "esp32/office";

/// How long to wait between attempts, and how many attempts to make.
/// `max_attempts: None` retries forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub const fn forever(backoff: Duration) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    pub const fn bounded(backoff: Duration, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(max_attempts),
        }
    }

    /// True when `attempts` failed attempts use up the policy.
    pub fn exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}

/// A command topic and the GPIO number it drives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandPin {
    pub topic: String,
    pub gpio: u8,
}

#[derive(Clone)]
pub struct StationConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_topic: String,
    pub fallback_client_id: String,
    pub connect_timeout: Duration,

    pub command_pins: [CommandPin; 2],
    pub sensor_gpio: u8,

    pub sleep: Duration,
    pub broker_retry: RetryPolicy,
    pub wifi_retry: RetryPolicy,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: option_env!("WIFI_SSID").unwrap_or("internet").into(),
            wifi_pass: option_env!("WIFI_PASS").unwrap_or("password").into(),

            mqtt_host: DEFAULT_MQTT_HOST.into(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: option_env!("MQTT_USER").unwrap_or("hassio_mqtt_user").into(),
            mqtt_pass: option_env!("MQTT_PASS").unwrap_or("hassio_mqtt_password").into(),
            mqtt_topic: SENSOR_TOPIC.into(),
            fallback_client_id: FALLBACK_CLIENT_ID.into(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),

            command_pins: [
                CommandPin {
                    topic: "esp32office/4".into(),
                    gpio: 4,
                },
                CommandPin {
                    topic: "esp32office/5".into(),
                    gpio: 5,
                },
            ],
            sensor_gpio: 15,

            sleep: Duration::from_secs(DEFAULT_SLEEP_SECS),
            broker_retry: RetryPolicy::forever(Duration::from_millis(DEFAULT_BROKER_BACKOFF_MS)),
            wifi_retry: RetryPolicy::forever(Duration::from_millis(DEFAULT_WIFI_BACKOFF_MS)),
        }
    }
}

impl StationConfig {
    pub fn broker_url(&self) -> String {
        format!("mqtt://{}:{}", self.mqtt_host, self.mqtt_port)
    }

    /// Client identifier derived from the station MAC, e.g.
    /// `esp32-client-24:0A:C4:12:34:56`.
    pub fn client_id(&self, mac: &[u8; 6]) -> String {
        format!(
            "{CLIENT_ID_PREFIX}{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5],
        )
    }

    pub fn command_topics(&self) -> impl Iterator<Item = &str> {
        self.command_pins.iter().map(|c| c.topic.as_str())
    }
}

// passwords stay out of the boot log
impl fmt::Debug for StationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StationConfig")
            .field("wifi_ssid", &self.wifi_ssid)
            .field("wifi_pass", &"***")
            .field("mqtt_url", &self.broker_url())
            .field("mqtt_user", &self.mqtt_user)
            .field("mqtt_pass", &"***")
            .field("mqtt_topic", &self.mqtt_topic)
            .field("fallback_client_id", &self.fallback_client_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_pins", &self.command_pins)
            .field("sensor_gpio", &self.sensor_gpio)
            .field("sleep", &self.sleep)
            .field("broker_retry", &self.broker_retry)
            .field("wifi_retry", &self.wifi_retry)
            .finish()
    }
}


// EOF

use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// mDNS service type Luxio firmware advertises.
pub const SERVICE_TYPE: &str = "_luxio._tcp.local.";

/// Address a Luxio answers on while it hosts its own setup network.
///
/// Must match the firmware's soft-AP address exactly.
pub const ACCESS_POINT_ADDRESS: &str = "192.168.4.1";

/// How a connection receives state updates after the initial snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushMode {
    /// Subscribe to the event stream, poll if the device does not serve one.
    Auto,
    /// Event stream only.
    Push,
    /// Periodic full-state polling only.
    Poll,
}

/// Tunables for discovery, connections and command dispatch.
///
/// Durations are written as milliseconds in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub service_type: String,
    pub access_point_address: String,
    #[serde(with = "duration_millis")]
    pub access_point_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub discovery_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Window used to coalesce explicit refresh requests while polling.
    #[serde(with = "duration_millis")]
    pub refresh_throttle: Duration,
    /// Window for power, brightness and configuration writes.
    #[serde(with = "duration_millis")]
    pub command_throttle: Duration,
    /// Window for solid color and gradient writes.
    #[serde(with = "duration_millis")]
    pub color_throttle: Duration,
    pub push_mode: PushMode,
    /// Connect to every newly discovered device right away.
    pub auto_connect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            service_type: SERVICE_TYPE.to_string(),
            access_point_address: ACCESS_POINT_ADDRESS.to_string(),
            access_point_timeout: Duration::from_millis(1500),
            discovery_timeout: Duration::from_millis(5000),
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1000),
            refresh_throttle: Duration::from_millis(200),
            command_throttle: Duration::from_millis(200),
            color_throttle: Duration::from_millis(400),
            push_mode: PushMode::Auto,
            auto_connect: true,
        }
    }
}

mod duration_millis {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: u64 = Deserialize::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{ "poll_interval": 2500, "push_mode": "poll" }"#).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(2500));
        assert_eq!(config.push_mode, PushMode::Poll);
        assert_eq!(config.access_point_address, ACCESS_POINT_ADDRESS);
        assert_eq!(config.command_throttle, Duration::from_millis(200));
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let json = serde_json::to_value(ClientConfig::default()).unwrap();
        assert_eq!(json["access_point_timeout"], 1500);
        assert_eq!(json["color_throttle"], 400);
    }
}

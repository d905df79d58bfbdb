//! The device aggregate and its observable state.
//!
//! A [`Device`] is created once per hardware id and lives for as long as the
//! registry that owns it. Consumers read it through [`Device::snapshot`] or
//! [`Device::watch`], listen to topic events, and change it only through
//! [`Device::commands`].

pub(crate) mod cache;
pub mod command;
pub mod connection;
pub mod demo;
pub mod dispatcher;
pub mod events;
#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use derivative::Derivative;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::control_interface::DeviceTransport;
use crate::error::ConnectionError;
use crate::led::led_state::normalize_colors;
use crate::led::{LedConfig, LedState};

use self::cache::DeviceCache;
use self::command::{DeviceCommand, Property};
use self::connection::DeviceConnection;
use self::dispatcher::DeviceCommandDispatcher;
use self::events::{DeviceEvent, EventTopic, ListenerId};

pub use self::connection::ConnectionState;

/// How a device was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Multicast,
    AccessPoint,
    Demo,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Multicast => "mdns",
            TransportKind::AccessPoint => "access-point",
            TransportKind::Demo => "demo",
        };
        write!(f, "{}", name)
    }
}

/// What a discovery strategy knows about a device. Two descriptors are equal
/// when they describe the same hardware, wherever it currently lives.
#[derive(Derivative)]
#[derivative(Hash, PartialEq, Eq)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable hardware identity, usually the MAC address.
    pub id: String,
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub name: String,
    /// `host` or `host:port`.
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub address: String,
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub firmware_version: u32,
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub transport: TransportKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiState {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

/// Everything a device reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub system_config: SystemConfig,
    pub system_state: SystemState,
    pub led_state: LedState,
    pub led_config: LedConfig,
    pub wifi_state: WifiState,
}

impl DeviceSnapshot {
    /// One event per topic, in the order listeners should see them.
    pub fn into_events(self) -> Vec<DeviceEvent> {
        vec![
            DeviceEvent::SystemConfig(self.system_config),
            DeviceEvent::LedConfig(self.led_config),
            DeviceEvent::LedState(self.led_state),
            DeviceEvent::WifiState(self.wifi_state),
        ]
    }

    pub fn apply(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::LedState(state) => self.led_state = state.clone(),
            DeviceEvent::LedConfig(config) => self.led_config = config.clone(),
            DeviceEvent::SystemConfig(config) => self.system_config = config.clone(),
            DeviceEvent::WifiState(state) => self.wifi_state = state.clone(),
        }
    }

    /// Copies the local value of every pending property into `incoming`.
    fn preserve_pending(&self, incoming: &mut DeviceEvent, pending: &[Property]) {
        for property in pending {
            match (property, &mut *incoming) {
                (Property::Power, DeviceEvent::LedState(state)) => state.on = self.led_state.on,
                (Property::Brightness, DeviceEvent::LedState(state)) => {
                    state.brightness = self.led_state.brightness
                }
                (Property::Colors, DeviceEvent::LedState(state)) => {
                    state.colors = self.led_state.colors.clone()
                }
                (Property::PixelCount, DeviceEvent::LedConfig(config)) => {
                    config.pixel_count = self.led_config.pixel_count
                }
                (Property::LedType, DeviceEvent::LedConfig(config)) => {
                    config.led_type = self.led_config.led_type
                }
                (Property::Name, DeviceEvent::SystemConfig(config)) => {
                    config.name = self.system_config.name.clone()
                }
                _ => {}
            }
        }
    }

    /// Applies a command optimistically and returns the event describing the
    /// new state, or `None` if the command carries no local state.
    fn apply_command(&mut self, command: &DeviceCommand) -> Option<DeviceEvent> {
        match command {
            DeviceCommand::SetOn(on) => self.led_state.on = *on,
            DeviceCommand::SetBrightness(brightness) => self.led_state.brightness = *brightness,
            DeviceCommand::SetColor(color) => self.led_state.colors = vec![*color, *color],
            DeviceCommand::SetGradient(colors) => {
                self.led_state.colors = normalize_colors(colors.clone()).ok()?
            }
            DeviceCommand::SetName(name) => {
                self.system_config.name = name.clone();
                return Some(DeviceEvent::SystemConfig(self.system_config.clone()));
            }
            DeviceCommand::SetCount(count) => {
                self.led_config.pixel_count = *count;
                return Some(DeviceEvent::LedConfig(self.led_config.clone()));
            }
            DeviceCommand::SetType(led_type) => {
                self.led_config.led_type = *led_type;
                return Some(DeviceEvent::LedConfig(self.led_config.clone()));
            }
            DeviceCommand::Restart
            | DeviceCommand::FactoryReset
            | DeviceCommand::ScanNetworks
            | DeviceCommand::ConnectWifi { .. } => return None,
        }
        Some(DeviceEvent::LedState(self.led_state.clone()))
    }
}

/// A Luxio device known to the registry.
pub struct Device {
    id: String,
    descriptor: RwLock<DeviceDescriptor>,
    last_seen: RwLock<DateTime<Utc>>,
    transport: Arc<dyn DeviceTransport>,
    cache: Arc<DeviceCache>,
    connection: DeviceConnection,
    dispatcher: DeviceCommandDispatcher,
}

impl Device {
    pub(crate) fn new(
        descriptor: DeviceDescriptor,
        transport: Arc<dyn DeviceTransport>,
        config: &ClientConfig,
        cancel: CancellationToken,
    ) -> Self {
        let mut initial = DeviceSnapshot::default();
        initial.system_config.id = descriptor.id.clone();
        initial.system_config.name = descriptor.name.clone();
        initial.system_state.version = descriptor.firmware_version;
        let cache = Arc::new(DeviceCache::new(initial));

        Device {
            id: descriptor.id.clone(),
            descriptor: RwLock::new(descriptor),
            last_seen: RwLock::new(Utc::now()),
            connection: DeviceConnection::new(transport.clone(), cache.clone(), config, cancel),
            dispatcher: DeviceCommandDispatcher::new(transport.clone(), cache.clone(), config),
            transport,
            cache,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn address(&self) -> String {
        self.descriptor.read().unwrap_or_else(PoisonError::into_inner).address.clone()
    }

    /// The name the device reports, or the advertised one before the first
    /// snapshot arrives.
    pub fn name(&self) -> String {
        let name = self.cache.snapshot().system_config.name;
        if name.is_empty() {
            self.descriptor().name
        } else {
            name
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.descriptor.read().unwrap_or_else(PoisonError::into_inner).transport
    }

    /// Whether this device was reached on its own setup network and still
    /// needs to be joined to a Wi-Fi network.
    pub fn is_access_point(&self) -> bool {
        self.transport_kind() == TransportKind::AccessPoint
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a rediscovery. Only the address changes, the device keeps its
    /// identity, state and listeners.
    pub(crate) fn rediscovered(&self, descriptor: &DeviceDescriptor) {
        *self.last_seen.write().unwrap_or_else(PoisonError::into_inner) = Utc::now();
        let mut current = self.descriptor.write().unwrap_or_else(PoisonError::into_inner);
        if current.address != descriptor.address {
            info!(
                "Device {} moved from {} to {}",
                self.id,
                current.address,
                descriptor.address
            );
            current.address = descriptor.address.clone();
            self.transport.set_host(&descriptor.address);
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.cache.snapshot()
    }

    /// Receiver that is notified on every state change.
    pub fn watch(&self) -> watch::Receiver<DeviceSnapshot> {
        self.cache.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn connection(&self) -> &DeviceConnection {
        &self.connection
    }

    pub fn commands(&self) -> &DeviceCommandDispatcher {
        &self.dispatcher
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connection.connect().await
    }

    pub fn add_event_listener<F>(&self, topic: EventTopic, handler: F) -> ListenerId
    where
        F: Fn(&DeviceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.connection.add_event_listener(topic, handler)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.connection.remove_event_listener(id)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("descriptor", &self.descriptor())
            .field("connection", &self.connection_state())
            .finish()
    }
}

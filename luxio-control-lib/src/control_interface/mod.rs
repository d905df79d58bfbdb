use std::collections::HashSet;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, Stream, StreamExt};
use log::{debug, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ClientConfig;
use crate::device::command::DeviceCommand;
use crate::device::demo::DemoTransport;
use crate::device::events::DeviceEvent;
use crate::device::{
    DeviceDescriptor, DeviceSnapshot, SystemConfig, SystemState, TransportKind, WifiState,
};
use crate::error::{CommandError, ConnectionError};
use crate::led::{LedConfig, LedState};

pub mod sse;

use self::sse::SseDecoder;

/// Events pushed by a device, in arrival order.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<DeviceEvent, ConnectionError>> + Send>>;

/// Everything the core needs from a device. Implemented over HTTP by
/// [`ControlInterface`] and in memory by [`DemoTransport`].
#[async_trait]
pub trait DeviceTransport: Send + Sync + fmt::Debug {
    fn host(&self) -> String;

    /// Points the transport at a new address after a rediscovery.
    fn set_host(&self, host: &str);

    /// Fetches `system.config`, `system.state`, `led.state`, `led.config` and
    /// `wifi.state`.
    async fn fetch_snapshot(&self) -> Result<DeviceSnapshot, ConnectionError>;

    /// Opens the push channel. Fails with [`ConnectionError::PushUnsupported`]
    /// when the device does not serve one.
    async fn subscribe(&self) -> Result<EventStream, ConnectionError>;

    async fn send(&self, command: &DeviceCommand) -> Result<(), CommandError>;

    /// Networks found by the last `wifi.scanNetworks`, as reported by the device.
    async fn get_networks(&self) -> Result<Vec<WifiNetwork>, CommandError>;
}

/// Builds the transport for a newly discovered device.
pub trait TransportFactory: Send + Sync {
    fn create(&self, descriptor: &DeviceDescriptor, config: &ClientConfig) -> Arc<dyn DeviceTransport>;
}

/// HTTP for real devices, the in-memory stub for the demo device.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, descriptor: &DeviceDescriptor, config: &ClientConfig) -> Arc<dyn DeviceTransport> {
        match descriptor.transport {
            TransportKind::Demo => Arc::new(DemoTransport::new()),
            TransportKind::Multicast | TransportKind::AccessPoint => {
                Arc::new(ControlInterface::new(&descriptor.address, config.request_timeout))
            }
        }
    }
}

/// A Wi-Fi network seen by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    pub rssi: i32,
    #[serde(default)]
    pub encrypted: bool,
}

/// Strongest signal first, one entry per SSID.
pub fn strongest_unique(mut networks: Vec<WifiNetwork>) -> Vec<WifiNetwork> {
    networks.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    let mut seen = HashSet::new();
    networks.retain(|network| seen.insert(network.ssid.clone()));
    networks
}

/// HTTP client for a single Luxio.
#[derive(Debug)]
pub struct ControlInterface {
    host: RwLock<String>,
    client: Client,
    request_timeout: Duration,
}

impl ControlInterface {
    pub fn new(host: &str, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        ControlInterface::with_client(host, client, request_timeout)
    }

    pub fn with_client(host: &str, client: Client, request_timeout: Duration) -> Self {
        ControlInterface {
            host: RwLock::new(host.to_string()),
            client,
            request_timeout,
        }
    }

    fn url(&self, path: &str) -> (String, String) {
        let host = self.host();
        let url = format!("http://{}{}", host, path);
        (host, url)
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConnectionError> {
        let (host, url) = self.url(path);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ConnectionError::Request {
                host: host.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ConnectionError::Status {
                host,
                status: response.status().as_u16(),
            });
        }
        response.json::<T>().await.map_err(|e| ConnectionError::Decode {
            host,
            message: e.to_string(),
        })
    }

    pub async fn fetch_system_config(&self) -> Result<SystemConfig, ConnectionError> {
        self.fetch("/api/system/config").await
    }

    pub async fn fetch_system_state(&self) -> Result<SystemState, ConnectionError> {
        self.fetch("/api/system/state").await
    }

    pub async fn fetch_led_state(&self) -> Result<LedState, ConnectionError> {
        let state: LedState = self.fetch("/api/led/state").await?;
        state.normalized().map_err(|e| ConnectionError::Decode {
            host: self.host(),
            message: e.to_string(),
        })
    }

    pub async fn fetch_led_config(&self) -> Result<LedConfig, ConnectionError> {
        self.fetch("/api/led/config").await
    }

    pub async fn fetch_wifi_state(&self) -> Result<WifiState, ConnectionError> {
        self.fetch("/api/wifi/state").await
    }

    /// Posts a command to the execute endpoint.
    pub async fn execute(&self, command: &DeviceCommand) -> Result<(), CommandError> {
        let (_, url) = self.url("/api/execute");
        let method = command.method();
        debug!("Sending {} to {}", method, url);
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&json!({ "method": method, "params": command.params() }))
            .send()
            .await
            .map_err(|e| CommandError::transport(method, e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CommandError::Rejected {
                method: method.to_string(),
                status: response.status().as_u16(),
            })
        }
    }
}

#[async_trait]
impl DeviceTransport for ControlInterface {
    fn host(&self) -> String {
        self.host.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_host(&self, host: &str) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = host.to_string();
    }

    async fn fetch_snapshot(&self) -> Result<DeviceSnapshot, ConnectionError> {
        let (system_config, system_state, led_state, led_config, wifi_state) = tokio::try_join!(
            self.fetch_system_config(),
            self.fetch_system_state(),
            self.fetch_led_state(),
            self.fetch_led_config(),
            self.fetch_wifi_state(),
        )?;
        Ok(DeviceSnapshot {
            system_config,
            system_state,
            led_state,
            led_config,
            wifi_state,
        })
    }

    async fn subscribe(&self) -> Result<EventStream, ConnectionError> {
        let (host, url) = self.url("/api/events");
        // Only the response head is bounded, the body stays open.
        let request = self.client.get(&url).header(ACCEPT, "text/event-stream").send();
        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| ConnectionError::Request {
                host: host.clone(),
                message: format!("no event stream response within {:?}", self.request_timeout),
            })?
            .map_err(|e| ConnectionError::Request {
                host: host.clone(),
                message: e.to_string(),
            })?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NOT_IMPLEMENTED => {
                return Err(ConnectionError::PushUnsupported)
            }
            status if !status.is_success() => {
                return Err(ConnectionError::Status {
                    host,
                    status: status.as_u16(),
                })
            }
            _ => {}
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("text/event-stream"))
            .unwrap_or(false);
        if !is_event_stream {
            return Err(ConnectionError::PushUnsupported);
        }

        debug!("Subscribed to events of {}", host);
        let events = response
            .bytes_stream()
            .scan((SseDecoder::default(), false), |(decoder, failed), chunk| {
                if *failed {
                    return future::ready(None);
                }
                let frames = chunk
                    .map_err(|e| ConnectionError::StreamClosed(e.to_string()))
                    .and_then(|bytes| decoder.feed(&bytes));
                let items: Vec<Result<DeviceEvent, ConnectionError>> = match frames {
                    Ok(frames) => frames
                        .into_iter()
                        .filter_map(|frame| match DeviceEvent::decode(&frame.event, &frame.data) {
                            Ok(event) => Some(Ok(event)),
                            Err(e) => {
                                debug!("Skipping {} event: {}", frame.event, e);
                                None
                            }
                        })
                        .collect(),
                    Err(e) => {
                        *failed = true;
                        vec![Err(e)]
                    }
                };
                future::ready(Some(futures::stream::iter(items)))
            })
            .flatten();
        Ok(Box::pin(events))
    }

    async fn send(&self, command: &DeviceCommand) -> Result<(), CommandError> {
        self.execute(command).await
    }

    async fn get_networks(&self) -> Result<Vec<WifiNetwork>, CommandError> {
        self.fetch("/api/wifi/networks")
            .await
            .map_err(|e| CommandError::transport("wifi.getNetworks", e))
    }
}

//! An in-memory Luxio for trying things out without hardware.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use log::debug;
use tokio::sync::broadcast;

use crate::control_interface::{DeviceTransport, EventStream, WifiNetwork};
use crate::device::command::DeviceCommand;
use crate::device::events::DeviceEvent;
use crate::device::{
    DeviceDescriptor, DeviceSnapshot, SystemConfig, SystemState, TransportKind, WifiState,
};
use crate::error::{CommandError, ConnectionError};
use crate::led::{LedConfig, LedState, LedType, Rgbw};

pub const DEMO_ID: &str = "demo";
pub const DEMO_NAME: &str = "Demo Luxio";
pub const DEMO_ADDRESS: &str = "127.0.0.1";
pub const DEMO_VERSION: u32 = 999;

/// Descriptor the demo strategy reports.
pub fn demo_descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        id: DEMO_ID.to_string(),
        name: DEMO_NAME.to_string(),
        address: DEMO_ADDRESS.to_string(),
        firmware_version: DEMO_VERSION,
        transport: TransportKind::Demo,
    }
}

fn demo_snapshot() -> DeviceSnapshot {
    DeviceSnapshot {
        system_config: SystemConfig {
            id: DEMO_ID.to_string(),
            name: DEMO_NAME.to_string(),
        },
        system_state: SystemState {
            version: DEMO_VERSION,
        },
        led_state: LedState {
            on: true,
            brightness: 100,
            colors: vec![Rgbw::new(79, 255, 127, 0), Rgbw::new(0, 210, 255, 0)],
        },
        led_config: LedConfig {
            led_type: LedType::Sk6812,
            pixel_count: 60,
            pin: 0,
        },
        wifi_state: WifiState {
            ssid: Some("Demo Wi-Fi".to_string()),
            ip: Some("1.3.3.7".to_string()),
            mac: Some("DE:MO:DE:MO:DE:MO".to_string()),
        },
    }
}

/// Accepts every write, echoes it back as an event, and refuses to restart
/// or reset.
#[derive(Debug)]
pub struct DemoTransport {
    state: Mutex<DeviceSnapshot>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DemoTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        DemoTransport {
            state: Mutex::new(demo_snapshot()),
            events,
        }
    }
}

impl Default for DemoTransport {
    fn default() -> Self {
        DemoTransport::new()
    }
}

#[async_trait]
impl DeviceTransport for DemoTransport {
    fn host(&self) -> String {
        DEMO_ADDRESS.to_string()
    }

    fn set_host(&self, _host: &str) {}

    async fn fetch_snapshot(&self) -> Result<DeviceSnapshot, ConnectionError> {
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn subscribe(&self) -> Result<EventStream, ConnectionError> {
        let rx = self.events.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Demo event stream skipped {} events", skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn send(&self, command: &DeviceCommand) -> Result<(), CommandError> {
        let event = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match command {
                DeviceCommand::Restart => {
                    return Err(CommandError::Unsupported(
                        "A demo Luxio cannot restart, obviously!".to_string(),
                    ))
                }
                DeviceCommand::FactoryReset => {
                    return Err(CommandError::Unsupported(
                        "A demo Luxio cannot factory reset, obviously!".to_string(),
                    ))
                }
                DeviceCommand::ConnectWifi { ssid, .. } => {
                    state.wifi_state.ssid = Some(ssid.clone());
                    Some(DeviceEvent::WifiState(state.wifi_state.clone()))
                }
                DeviceCommand::ScanNetworks => None,
                _ => state.apply_command(command),
            }
        };
        if let Some(event) = event {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn get_networks(&self) -> Result<Vec<WifiNetwork>, CommandError> {
        Ok(vec![
            WifiNetwork {
                ssid: "Demo Wi-Fi".to_string(),
                rssi: -42,
                encrypted: true,
            },
            WifiNetwork {
                ssid: "Neighbours".to_string(),
                rssi: -77,
                encrypted: true,
            },
            WifiNetwork {
                ssid: "Coffee Shop".to_string(),
                rssi: -64,
                encrypted: false,
            },
        ])
    }
}

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::control_interface::ControlInterface;
use crate::device::{DeviceDescriptor, TransportKind};
use crate::discovery::{DescriptorSink, DiscoveryStrategy, StrategyKind};
use crate::error::DiscoveryError;

/// Looks for a Luxio that is hosting its own setup network, which only
/// happens while it has no Wi-Fi credentials.
#[derive(Debug, Clone)]
pub struct AccessPointStrategy {
    address: String,
    timeout: Duration,
}

impl AccessPointStrategy {
    pub fn new(address: &str, timeout: Duration) -> Self {
        AccessPointStrategy {
            address: address.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        AccessPointStrategy::new(&config.access_point_address, config.access_point_timeout)
    }

    /// One bounded attempt. Anything short of a complete answer in time means
    /// there is no access point.
    pub async fn probe(&self) -> Option<DeviceDescriptor> {
        let iface = ControlInterface::new(&self.address, self.timeout);
        let answer = tokio::time::timeout(self.timeout, async {
            tokio::try_join!(iface.fetch_system_config(), iface.fetch_system_state())
        })
        .await;

        let (config, state) = match answer {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                debug!("No Luxio access point at {}: {}", self.address, e);
                return None;
            }
            Err(_) => {
                debug!("No Luxio access point at {} within {:?}", self.address, self.timeout);
                return None;
            }
        };

        if config.id.is_empty() {
            debug!("Access point at {} did not report an id", self.address);
            return None;
        }
        let name = if config.name.is_empty() {
            config.id.clone()
        } else {
            config.name
        };
        Some(DeviceDescriptor {
            id: config.id,
            name,
            address: self.address.clone(),
            firmware_version: state.version,
            transport: TransportKind::AccessPoint,
        })
    }
}

#[async_trait]
impl DiscoveryStrategy for AccessPointStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AccessPoint
    }

    async fn run(&self, sink: DescriptorSink, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        let found = tokio::select! {
            _ = cancel.cancelled() => None,
            found = self.probe() => found,
        };
        if let Some(descriptor) = found {
            sink.report(descriptor);
        }
        Ok(())
    }
}

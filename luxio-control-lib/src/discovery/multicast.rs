use std::net::IpAddr;

use async_trait::async_trait;
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceDescriptor, TransportKind};
use crate::discovery::{DescriptorSink, DiscoveryStrategy, StrategyKind};
use crate::error::{DiscoveryError, ValidationError};

/// Browses for Luxio devices announcing themselves over mDNS.
#[derive(Debug, Clone)]
pub struct MulticastStrategy {
    service_type: String,
}

impl MulticastStrategy {
    pub fn new(service_type: &str) -> Self {
        MulticastStrategy {
            service_type: service_type.to_string(),
        }
    }

    fn resolved(&self, info: &ServiceInfo, sink: &DescriptorSink) {
        let addresses: Vec<IpAddr> = info
            .get_addresses()
            .iter()
            .filter_map(|address| address.to_string().parse().ok())
            .collect();

        match parse_resolution(
            info.get_property_val_str("id"),
            info.get_property_val_str("name"),
            info.get_property_val_str("version"),
            &addresses,
            info.get_port(),
        ) {
            Ok(descriptor) => {
                debug!("Resolved {} at {}", descriptor.id, descriptor.address);
                sink.report(descriptor);
            }
            Err(e) => debug!("Ignoring {}: {}", info.get_fullname(), e),
        }
    }
}

/// Builds a descriptor from a resolved service record.
///
/// The lowest IPv4 address wins, IPv6 is used only when nothing else
/// resolved. The port is left out when it is the HTTP default.
pub fn parse_resolution(
    id: Option<&str>,
    name: Option<&str>,
    version: Option<&str>,
    addresses: &[IpAddr],
    port: u16,
) -> Result<DeviceDescriptor, ValidationError> {
    let id = id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ValidationError::missing("id"))?;
    let name = name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ValidationError::missing("name"))?;
    let version = version.ok_or_else(|| ValidationError::missing("version"))?;
    let firmware_version = version
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ValidationError::invalid("version", format!("{:?} is not a positive integer", version)))?;

    let address = addresses
        .iter()
        .filter(|a| a.is_ipv4())
        .min()
        .or_else(|| addresses.iter().min())
        .ok_or_else(|| ValidationError::missing("address"))?;

    let address = match (address, port) {
        (_, 0 | 80) => address.to_string(),
        (IpAddr::V4(v4), port) => format!("{}:{}", v4, port),
        (IpAddr::V6(v6), port) => format!("[{}]:{}", v6, port),
    };

    Ok(DeviceDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        address,
        firmware_version,
        transport: TransportKind::Multicast,
    })
}

#[async_trait]
impl DiscoveryStrategy for MulticastStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Multicast
    }

    async fn run(&self, sink: DescriptorSink, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Init(e.to_string()))?;
        let receiver = match daemon.browse(&self.service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = daemon.shutdown();
                return Err(DiscoveryError::Init(e.to_string()));
            }
        };
        info!("Browsing for {}", self.service_type);

        let result = loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                event = receiver.recv_async() => event,
            };
            match event {
                Ok(ServiceEvent::ServiceResolved(info)) => self.resolved(&info, &sink),
                Ok(ServiceEvent::ServiceRemoved(_, fullname)) => debug!("{} went away", fullname),
                Ok(_) => {}
                Err(e) => break Err(DiscoveryError::Transport(e.to_string())),
            }
        };

        if let Err(e) = daemon.stop_browse(&self.service_type) {
            debug!("Could not stop browsing {}: {}", self.service_type, e);
        }
        if let Err(e) = daemon.shutdown() {
            warn!("mDNS daemon did not shut down cleanly: {}", e);
        }
        info!("Stopped browsing for {}", self.service_type);
        result
    }
}

use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::control_interface::{DefaultTransportFactory, TransportFactory};
use crate::device::Device;
use crate::discovery::{DiscoveryOptions, DiscoveryService, ScanGuard};
use crate::registry::DeviceRegistry;

/// Owns the registry, the discovery service and every background task they
/// start. Dropping the context stops all of them.
#[derive(Debug)]
pub struct LuxioContext {
    config: ClientConfig,
    registry: Arc<DeviceRegistry>,
    discovery: DiscoveryService,
    cancel: CancellationToken,
}

impl LuxioContext {
    pub fn new(config: ClientConfig) -> Self {
        LuxioContext::with_transport_factory(config, Arc::new(DefaultTransportFactory))
    }

    /// Uses `factory` to build device transports, for tests or custom
    /// firmware.
    pub fn with_transport_factory(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let cancel = CancellationToken::new();
        let registry = Arc::new(DeviceRegistry::new(factory, config.clone(), cancel.clone()));
        let discovery = DiscoveryService::new(registry.clone(), config.clone(), cancel.clone());
        LuxioContext {
            config,
            registry,
            discovery,
            cancel,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    pub fn start_discovery(&self, options: DiscoveryOptions) -> ScanGuard {
        self.discovery.start(options)
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.list()
    }

    pub fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.registry.get(id)
    }

    /// Stops scans, closes every connection and refuses new ones.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Shutting down, {} devices known", self.registry.len());
        self.cancel.cancel();
        for device in self.registry.list() {
            device.connection().disconnect();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for LuxioContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

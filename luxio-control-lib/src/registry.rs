//! The set of known devices, keyed by hardware id.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::control_interface::TransportFactory;
use crate::device::{Device, DeviceDescriptor};

/// Handle returned by [`DeviceRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

type Observer = Arc<dyn Fn(Arc<Device>) + Send + Sync>;

/// What [`DeviceRegistry::upsert`] did with a descriptor.
#[derive(Debug, Clone)]
pub enum Upsert {
    Inserted(Arc<Device>),
    Updated(Arc<Device>),
}

impl Upsert {
    pub fn device(&self) -> &Arc<Device> {
        match self {
            Upsert::Inserted(device) | Upsert::Updated(device) => device,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Upsert::Inserted(_))
    }
}

/// At most one [`Device`] per id. A device keeps its identity for the
/// lifetime of the registry, so handles held by consumers never go stale.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    observers: RwLock<Vec<(ObserverId, Observer)>>,
    factory: Arc<dyn TransportFactory>,
    config: ClientConfig,
    cancel: CancellationToken,
}

impl DeviceRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, config: ClientConfig, cancel: CancellationToken) -> Self {
        DeviceRegistry {
            devices: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            factory,
            config,
            cancel,
        }
    }

    /// Adds a device or refreshes the address of the one already known under
    /// the same id. Observers hear about new devices only, after the registry
    /// lock is released.
    pub fn upsert(&self, descriptor: DeviceDescriptor) -> Upsert {
        let result = {
            let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
            match devices.get(&descriptor.id) {
                Some(device) => {
                    device.rediscovered(&descriptor);
                    Upsert::Updated(device.clone())
                }
                None => {
                    info!(
                        "Found {} ({}) at {} via {}",
                        descriptor.name, descriptor.id, descriptor.address, descriptor.transport
                    );
                    let transport = self.factory.create(&descriptor, &self.config);
                    let device = Arc::new(Device::new(
                        descriptor,
                        transport,
                        &self.config,
                        self.cancel.child_token(),
                    ));
                    devices.insert(device.id().to_string(), device.clone());
                    Upsert::Inserted(device)
                }
            }
        };

        if let Upsert::Inserted(device) = &result {
            self.notify(device);
        }
        result
    }

    fn notify(&self, device: &Arc<Device>) {
        let observers: Vec<Observer> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        debug!("Notifying {} observers of {}", observers.len(), device.id());
        for observer in observers {
            let device = device.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(device))).is_err() {
                warn!("Device observer panicked");
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Every known device, ordered by id.
    pub fn list(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<Arc<Device>> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `observer` once for every device added from now on.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(Arc<Device>) + Send + Sync + 'static,
    {
        let id = ObserverId(Uuid::new_v4());
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(observer, _)| *observer != id);
        observers.len() != before
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::control_interface::DefaultTransportFactory;
    use crate::device::TransportKind;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(
            Arc::new(DefaultTransportFactory),
            ClientConfig::default(),
            CancellationToken::new(),
        )
    }

    fn bedroom(address: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: "AA:BB".to_string(),
            name: "Bedroom".to_string(),
            address: address.to_string(),
            firmware_version: 33,
            transport: TransportKind::Multicast,
        }
    }

    #[tokio::test]
    async fn test_rediscovery_keeps_the_same_device() {
        let registry = registry();

        let first = registry.upsert(bedroom("10.0.0.5"));
        let second = registry.upsert(bedroom("10.0.0.9"));

        assert!(first.is_new());
        assert!(!second.is_new());
        assert!(Arc::ptr_eq(first.device(), second.device()));
        assert_eq!(second.device().address(), "10.0.0.9");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_observers_hear_each_device_once() {
        let registry = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = registry.subscribe(move |device| sink.lock().unwrap().push(device.id().to_string()));

        registry.upsert(bedroom("10.0.0.5"));
        registry.upsert(bedroom("10.0.0.6"));
        assert!(registry.unsubscribe(id));
        registry.upsert(DeviceDescriptor {
            id: "CC:DD".to_string(),
            ..bedroom("10.0.0.7")
        });

        assert_eq!(*seen.lock().unwrap(), vec!["AA:BB".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_observer_may_read_registry() {
        let registry = Arc::new(registry());
        let count = Arc::new(Mutex::new(0));
        let (weak, sink) = (Arc::downgrade(&registry), count.clone());
        registry.subscribe(move |_| {
            if let Some(registry) = weak.upgrade() {
                *sink.lock().unwrap() = registry.len();
            }
        });

        registry.upsert(bedroom("10.0.0.5"));

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_create_one_device() {
        let registry = Arc::new(registry());

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.upsert(bedroom(&format!("10.0.0.{}", i))) })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;

        let inserted = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(Upsert::is_new)
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(registry.len(), 1);
    }
}

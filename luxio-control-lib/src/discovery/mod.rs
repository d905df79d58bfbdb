//! Finding devices and feeding them into the registry.
//!
//! Each [`DiscoveryStrategy`] runs in its own task and reports what it finds
//! through a [`DescriptorSink`]. A single merge task per scan owns the writes
//! to the [`DeviceRegistry`], so a device seen by two strategies at once is
//! still created only once.

pub mod access_point;
pub mod multicast;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::device::demo::demo_descriptor;
use crate::device::{Device, DeviceDescriptor};
use crate::error::DiscoveryError;
use crate::registry::{DeviceRegistry, ObserverId, Upsert};

use self::access_point::AccessPointStrategy;
use self::multicast::MulticastStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Multicast,
    AccessPoint,
    Demo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub strategies: Vec<StrategyKind>,
    /// Stops the scan on its own after this long. `None` scans until the
    /// guard is dropped.
    pub timeout: Option<Duration>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            strategies: vec![StrategyKind::Multicast, StrategyKind::AccessPoint],
            timeout: None,
        }
    }
}

/// Where strategies report descriptors.
#[derive(Debug, Clone)]
pub struct DescriptorSink {
    tx: mpsc::UnboundedSender<DeviceDescriptor>,
}

impl DescriptorSink {
    fn channel() -> (Self, mpsc::UnboundedReceiver<DeviceDescriptor>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DescriptorSink { tx }, rx)
    }

    /// Returns `false` once the scan is over and nobody is listening.
    pub fn report(&self, descriptor: DeviceDescriptor) -> bool {
        self.tx.send(descriptor).is_ok()
    }
}

/// A way of finding devices.
#[async_trait]
pub trait DiscoveryStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> StrategyKind;

    /// Runs until the strategy is done or `cancel` fires. Errors are logged by
    /// the caller and never reach consumers.
    async fn run(&self, sink: DescriptorSink, cancel: CancellationToken) -> Result<(), DiscoveryError>;
}

/// Keeps a scan alive. Dropping it stops every strategy the scan started.
#[derive(Debug)]
#[must_use = "the scan stops when the guard is dropped"]
pub struct ScanGuard {
    token: CancellationToken,
}

impl ScanGuard {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub struct DiscoveryService {
    registry: Arc<DeviceRegistry>,
    config: ClientConfig,
    root: CancellationToken,
    scans: Mutex<CancellationToken>,
}

impl DiscoveryService {
    pub fn new(registry: Arc<DeviceRegistry>, config: ClientConfig, cancel: CancellationToken) -> Self {
        let scans = Mutex::new(cancel.child_token());
        DiscoveryService {
            registry,
            config,
            root: cancel,
            scans,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn scan_token(&self) -> CancellationToken {
        self.scans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token()
    }

    /// Starts the requested strategies. The demo device, if asked for, is in
    /// the registry before this returns.
    pub fn start(&self, options: DiscoveryOptions) -> ScanGuard {
        let token = self.scan_token();
        let (sink, rx) = DescriptorSink::channel();
        tokio::spawn(merge(self.registry.clone(), self.config.auto_connect, rx));

        for kind in &options.strategies {
            match kind {
                StrategyKind::Multicast => spawn_strategy(
                    Arc::new(MulticastStrategy::new(&self.config.service_type)),
                    sink.clone(),
                    token.clone(),
                ),
                StrategyKind::AccessPoint => spawn_strategy(
                    Arc::new(AccessPointStrategy::from_config(&self.config)),
                    sink.clone(),
                    token.clone(),
                ),
                StrategyKind::Demo => {
                    self.enable_demo();
                }
            }
        }

        if let Some(timeout) = options.timeout {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        debug!("Scan finished after {:?}", timeout);
                        token.cancel();
                    }
                }
            });
        }
        ScanGuard { token }
    }

    /// Runs a single strategy, built in or not, against the registry.
    pub fn run_strategy(&self, strategy: Arc<dyn DiscoveryStrategy>) -> ScanGuard {
        let token = self.scan_token();
        let (sink, rx) = DescriptorSink::channel();
        tokio::spawn(merge(self.registry.clone(), self.config.auto_connect, rx));
        spawn_strategy(strategy, sink, token.clone());
        ScanGuard { token }
    }

    /// The devices known right now, or, if there are none, whatever shows up
    /// first within `timeout`. Does not start scanning by itself.
    pub async fn discover_once(&self, timeout: Duration) -> Vec<Arc<Device>> {
        let arrived = Arc::new(Notify::new());
        let notify = arrived.clone();
        let observer = self.registry.subscribe(move |_| notify.notify_one());

        if self.registry.is_empty() {
            let _ = tokio::time::timeout(timeout, arrived.notified()).await;
        }
        self.registry.unsubscribe(observer);
        self.registry.list()
    }

    pub fn register_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(Arc<Device>) + Send + Sync + 'static,
    {
        self.registry.subscribe(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Adds the demo device, or returns it if it is already there.
    pub fn enable_demo(&self) -> Arc<Device> {
        ingest(&self.registry, self.config.auto_connect, demo_descriptor())
            .device()
            .clone()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.list()
    }

    pub fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.registry.get(id)
    }

    /// Stops every running scan. New scans can be started afterwards.
    pub fn stop(&self) {
        let mut scans = self.scans.lock().unwrap_or_else(PoisonError::into_inner);
        scans.cancel();
        *scans = self.root.child_token();
    }
}

impl fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("registry", &self.registry)
            .finish()
    }
}

fn spawn_strategy(strategy: Arc<dyn DiscoveryStrategy>, sink: DescriptorSink, token: CancellationToken) {
    tokio::spawn(async move {
        let kind = strategy.kind();
        debug!("Starting {:?} discovery", kind);
        match strategy.run(sink, token).await {
            Ok(()) => debug!("{:?} discovery finished", kind),
            Err(e) => warn!("{:?} discovery unavailable: {}", kind, e),
        }
    });
}

/// Sole writer of one scan's results. Ends when every sink is gone.
async fn merge(registry: Arc<DeviceRegistry>, auto_connect: bool, mut rx: mpsc::UnboundedReceiver<DeviceDescriptor>) {
    while let Some(descriptor) = rx.recv().await {
        ingest(&registry, auto_connect, descriptor);
    }
}

fn ingest(registry: &DeviceRegistry, auto_connect: bool, descriptor: DeviceDescriptor) -> Upsert {
    let upsert = registry.upsert(descriptor);
    if let (true, Upsert::Inserted(device)) = (auto_connect, &upsert) {
        let device = device.clone();
        tokio::spawn(async move {
            if let Err(e) = device.connect().await {
                warn!("Could not connect to {}: {}", device.id(), e);
            }
        });
    }
    upsert
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::control_interface::DefaultTransportFactory;
    use crate::device::{ConnectionState, TransportKind};

    // ── Helpers ──

    fn service(auto_connect: bool) -> DiscoveryService {
        let config = ClientConfig {
            auto_connect,
            ..ClientConfig::default()
        };
        let cancel = CancellationToken::new();
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(DefaultTransportFactory),
            config.clone(),
            cancel.clone(),
        ));
        DiscoveryService::new(registry, config, cancel)
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

    /// Reports a fixed list, optionally after a delay, then finishes.
    #[derive(Debug)]
    struct ScriptedStrategy {
        delay: Duration,
        found: Vec<DeviceDescriptor>,
    }

    #[async_trait]
    impl DiscoveryStrategy for ScriptedStrategy {
        fn kind(&self) -> StrategyKind {
            StrategyKind::Multicast
        }

        async fn run(&self, sink: DescriptorSink, _cancel: CancellationToken) -> Result<(), DiscoveryError> {
            tokio::time::sleep(self.delay).await;
            for descriptor in &self.found {
                sink.report(descriptor.clone());
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct BrokenStrategy;

    #[async_trait]
    impl DiscoveryStrategy for BrokenStrategy {
        fn kind(&self) -> StrategyKind {
            StrategyKind::Multicast
        }

        async fn run(&self, _sink: DescriptorSink, _cancel: CancellationToken) -> Result<(), DiscoveryError> {
            Err(DiscoveryError::Init("multicast not permitted".to_string()))
        }
    }

    /// Runs until cancelled and records that it saw the cancellation.
    #[derive(Debug, Default)]
    struct EndlessStrategy {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DiscoveryStrategy for EndlessStrategy {
        fn kind(&self) -> StrategyKind {
            StrategyKind::Multicast
        }

        async fn run(&self, _sink: DescriptorSink, cancel: CancellationToken) -> Result<(), DiscoveryError> {
            cancel.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    // ── Tests ──

    #[tokio::test]
    async fn test_demo_is_available_synchronously() {
        let service = service(false);

        let _scan = service.start(DiscoveryOptions {
            strategies: vec![StrategyKind::Demo],
            timeout: None,
        });

        let devices = service.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), "demo");
        assert_eq!(devices[0].name(), "Demo Luxio");
    }

    #[tokio::test(start_paused = true)]
    async fn test_moved_device_is_updated_not_duplicated() {
        let service = service(false);
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        service.register_observer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let _scan = service.run_strategy(Arc::new(ScriptedStrategy {
            delay: Duration::ZERO,
            found: vec![bedroom("10.0.0.5"), bedroom("10.0.0.9")],
        }));
        let first = service.discover_once(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let devices = service.devices();
        assert_eq!(devices.len(), 1);
        assert!(Arc::ptr_eq(&first[0], &devices[0]));
        assert_eq!(devices[0].address(), "10.0.0.9");
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_once_waits_for_first_device() {
        let service = service(false);
        let _scan = service.run_strategy(Arc::new(ScriptedStrategy {
            delay: Duration::from_millis(300),
            found: vec![bedroom("10.0.0.5")],
        }));

        let devices = service.discover_once(Duration::from_secs(5)).await;

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), "AA:BB");
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_strategy_degrades_to_empty() {
        let service = service(false);
        let _scan = service.run_strategy(Arc::new(BrokenStrategy));

        let devices = service.discover_once(Duration::from_millis(500)).await;

        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_guard_stops_strategy() {
        let service = service(false);
        let stopped = Arc::new(AtomicBool::new(false));
        let scan = service.run_strategy(Arc::new(EndlessStrategy {
            stopped: stopped.clone(),
        }));

        tokio::task::yield_now().await;
        assert!(!stopped.load(Ordering::SeqCst));
        drop(scan);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_cancels_running_scans() {
        let service = service(false);
        let stopped = Arc::new(AtomicBool::new(false));
        let scan = service.run_strategy(Arc::new(EndlessStrategy {
            stopped: stopped.clone(),
        }));

        service.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(stopped.load(Ordering::SeqCst));
        assert!(!scan.is_active());

        let next = service.run_strategy(Arc::new(EndlessStrategy {
            stopped: Arc::new(AtomicBool::new(false)),
        }));
        assert!(next.is_active());
    }

    #[tokio::test]
    async fn test_new_devices_are_connected_automatically() {
        let service = service(true);

        let device = service.enable_demo();

        let mut state = device.connection().watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(device.snapshot().led_config.pixel_count, 60);
    }
}

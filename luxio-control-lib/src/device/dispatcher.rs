use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::config::ClientConfig;
use crate::control_interface::{strongest_unique, DeviceTransport, WifiNetwork};
use crate::device::cache::DeviceCache;
use crate::device::command::{DeviceCommand, Property};
use crate::error::{CommandError, ValidationError};
use crate::led::led_state::normalize_colors;
use crate::led::{LedType, Rgbw};
use crate::util::throttle::Throttle;

type CommandStream = Throttle<(u64, DeviceCommand), Result<(), CommandError>>;

/// Outcome of a queued write.
///
/// The local state has already changed when this is returned. Awaiting it
/// yields the result of the request that carried the value, or the newer value
/// that replaced it. Dropping it does not cancel the write.
pub struct PendingCommand {
    state: PendingState,
}

enum PendingState {
    Ready(Option<Result<(), CommandError>>),
    Waiting(oneshot::Receiver<Result<(), CommandError>>),
}

impl PendingCommand {
    fn ready(result: Result<(), CommandError>) -> Self {
        PendingCommand {
            state: PendingState::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<(), CommandError>>) -> Self {
        PendingCommand {
            state: PendingState::Waiting(rx),
        }
    }
}

impl Future for PendingCommand {
    type Output = Result<(), CommandError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingState::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(CommandError::Closed))),
            PendingState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(CommandError::Closed))),
        }
    }
}

impl fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            PendingState::Ready(_) => "ready",
            PendingState::Waiting(_) => "waiting",
        };
        f.debug_struct("PendingCommand").field("state", &state).finish()
    }
}

/// Sends writes to one device.
///
/// Property setters update the local state right away and go through a
/// per-property throttle, so dragging a slider produces a handful of requests
/// instead of hundreds. They must be called from within a tokio runtime.
/// Failed writes are logged and reported, the local state is not rolled back.
pub struct DeviceCommandDispatcher {
    transport: Arc<dyn DeviceTransport>,
    cache: Arc<DeviceCache>,
    command_window: Duration,
    color_window: Duration,
    streams: Mutex<HashMap<Property, CommandStream>>,
}

impl DeviceCommandDispatcher {
    pub(crate) fn new(transport: Arc<dyn DeviceTransport>, cache: Arc<DeviceCache>, config: &ClientConfig) -> Self {
        DeviceCommandDispatcher {
            transport,
            cache,
            command_window: config.command_throttle,
            color_window: config.color_throttle,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_on(&self, on: bool) -> PendingCommand {
        self.throttled(DeviceCommand::SetOn(on))
    }

    pub fn set_brightness(&self, brightness: u8) -> PendingCommand {
        self.throttled(DeviceCommand::SetBrightness(brightness))
    }

    /// Solid color. Shown locally as a gradient of two identical stops.
    pub fn set_color(&self, color: Rgbw) -> PendingCommand {
        self.throttled(DeviceCommand::SetColor(color))
    }

    /// A single stop is stretched to two. An empty gradient is rejected
    /// without touching the device or the local state.
    pub fn set_gradient(&self, colors: Vec<Rgbw>) -> PendingCommand {
        match normalize_colors(colors) {
            Ok(colors) => self.throttled(DeviceCommand::SetGradient(colors)),
            Err(e) => PendingCommand::ready(Err(e.into())),
        }
    }

    pub fn set_name(&self, name: &str) -> PendingCommand {
        let name = name.trim();
        if name.is_empty() {
            return PendingCommand::ready(Err(ValidationError::invalid("name", "must not be empty").into()));
        }
        self.throttled(DeviceCommand::SetName(name.to_string()))
    }

    pub fn set_count(&self, count: u16) -> PendingCommand {
        self.throttled(DeviceCommand::SetCount(count))
    }

    pub fn set_type(&self, led_type: LedType) -> PendingCommand {
        self.throttled(DeviceCommand::SetType(led_type))
    }

    pub async fn restart(&self) -> Result<(), CommandError> {
        self.send_now(DeviceCommand::Restart).await
    }

    pub async fn factory_reset(&self) -> Result<(), CommandError> {
        self.send_now(DeviceCommand::FactoryReset).await
    }

    /// Asks the device to start a Wi-Fi scan. Results are read with
    /// [`Self::get_networks`] once the scan has had time to finish.
    pub async fn scan_networks(&self) -> Result<(), CommandError> {
        self.send_now(DeviceCommand::ScanNetworks).await
    }

    /// Networks from the last scan, strongest first, one entry per SSID.
    pub async fn get_networks(&self) -> Result<Vec<WifiNetwork>, CommandError> {
        Ok(strongest_unique(self.transport.get_networks().await?))
    }

    /// Scans, waits `settle` for the radio, then lists what was found.
    pub async fn find_networks(&self, settle: Duration) -> Result<Vec<WifiNetwork>, CommandError> {
        self.scan_networks().await?;
        tokio::time::sleep(settle).await;
        self.get_networks().await
    }

    pub async fn connect_wifi(&self, ssid: &str, pass: &str) -> Result<(), CommandError> {
        if ssid.is_empty() {
            return Err(ValidationError::missing("ssid").into());
        }
        self.send_now(DeviceCommand::ConnectWifi {
            ssid: ssid.to_string(),
            pass: pass.to_string(),
        })
        .await
    }

    async fn send_now(&self, command: DeviceCommand) -> Result<(), CommandError> {
        debug!("Sending {} to {}", command.method(), self.transport.host());
        self.transport.send(&command).await.map_err(|e| {
            warn!("{} to {} failed: {}", command.method(), self.transport.host(), e);
            e
        })
    }

    fn throttled(&self, command: DeviceCommand) -> PendingCommand {
        let Some(property) = command.property() else {
            return PendingCommand::ready(Err(CommandError::Unsupported(format!(
                "{} carries no state to throttle",
                command.method()
            ))));
        };
        let sequence = self.cache.apply_local(property, &command);
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = streams
            .entry(property)
            .or_insert_with(|| self.stream(property));
        PendingCommand::waiting(stream.call((sequence, command)))
    }

    fn stream(&self, property: Property) -> CommandStream {
        let window = match property {
            Property::Colors => self.color_window,
            _ => self.command_window,
        };
        let transport = self.transport.clone();
        let cache = self.cache.clone();
        Throttle::new(window, move |(sequence, command): (u64, DeviceCommand)| {
            let transport = transport.clone();
            let cache = cache.clone();
            async move {
                let result = transport.send(&command).await;
                if let Err(e) = &result {
                    warn!("{} to {} failed: {}", command.method(), transport.host(), e);
                }
                cache.settle(property, sequence);
                result
            }
        })
    }
}

impl fmt::Debug for DeviceCommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCommandDispatcher")
            .field("host", &self.transport.host())
            .field("command_window", &self.command_window)
            .field("color_window", &self.color_window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use tokio::time::Instant;

    use crate::device::demo::DemoTransport;
    use crate::device::events::DeviceEvent;
    use crate::device::mock::MockTransport;
    use crate::device::DeviceSnapshot;
    use crate::led::LedState;

    // ── Helpers ──

    fn dispatcher(transport: Arc<dyn DeviceTransport>) -> (DeviceCommandDispatcher, Arc<DeviceCache>) {
        let cache = Arc::new(DeviceCache::new(DeviceSnapshot::default()));
        let dispatcher = DeviceCommandDispatcher::new(transport, cache.clone(), &ClientConfig::default());
        (dispatcher, cache)
    }

    // ── Tests ──

    #[tokio::test(start_paused = true)]
    async fn test_brightness_drag_sends_first_and_last() {
        let transport = Arc::new(MockTransport::default());
        let (dispatcher, cache) = dispatcher(transport.clone());

        let mut pending = Vec::new();
        for value in [50, 80, 120, 200, 255] {
            pending.push(dispatcher.set_brightness(value));
            assert_eq!(cache.snapshot().led_state.brightness, value);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for result in futures::future::join_all(pending).await {
            result.unwrap();
        }

        assert_eq!(
            transport.sent_commands(),
            vec![DeviceCommand::SetBrightness(50), DeviceCommand::SetBrightness(255)]
        );
        assert_eq!(cache.snapshot().led_state.brightness, 255);
    }

    #[tokio::test(start_paused = true)]
    async fn test_color_writes_use_longer_window() {
        let transport = Arc::new(MockTransport::default());
        let (dispatcher, _) = dispatcher(transport.clone());
        let start = Instant::now();

        let first = dispatcher.set_color(Rgbw::rgb(255, 0, 0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = dispatcher.set_color(Rgbw::rgb(0, 0, 255));
        first.await.unwrap();
        second.await.unwrap();

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1 - start >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_properties_are_throttled_independently() {
        let transport = Arc::new(MockTransport::default());
        let (dispatcher, _) = dispatcher(transport.clone());

        let on = dispatcher.set_on(true);
        let brightness = dispatcher.set_brightness(10);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, sent[1].1);
        on.await.unwrap();
        brightness.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_keeps_optimistic_state() {
        let transport = Arc::new(MockTransport::default());
        transport.fail_send.store(true, Ordering::SeqCst);
        let (dispatcher, cache) = dispatcher(transport.clone());

        let err = dispatcher.set_on(true).await.unwrap_err();

        assert!(matches!(err, CommandError::Rejected { status: 500, .. }));
        assert!(cache.snapshot().led_state.on);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_gradient_is_rejected_locally() {
        let transport = Arc::new(MockTransport::default());
        let (dispatcher, cache) = dispatcher(transport.clone());
        let before = cache.snapshot();

        let err = dispatcher.set_gradient(vec![]).await.unwrap_err();

        assert!(matches!(err, CommandError::Invalid(_)));
        assert_eq!(cache.snapshot(), before);
        assert!(transport.sent_commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_stop_gradient_is_sent_as_two() {
        let transport = Arc::new(MockTransport::default());
        let (dispatcher, _) = dispatcher(transport.clone());
        let color = Rgbw::rgb(9, 9, 9);

        dispatcher.set_gradient(vec![color]).await.unwrap();

        assert_eq!(transport.sent_commands(), vec![DeviceCommand::SetGradient(vec![color, color])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_write_wins_over_remote_update() {
        let transport = Arc::new(MockTransport::default());
        *transport.send_delay.lock().unwrap() = Duration::from_millis(300);
        let (dispatcher, cache) = dispatcher(transport.clone());
        let remote = || {
            DeviceEvent::LedState(LedState {
                brightness: 10,
                ..LedState::default()
            })
        };

        let pending = dispatcher.set_brightness(200);
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.apply_remote(remote());
        assert_eq!(cache.snapshot().led_state.brightness, 200);

        pending.await.unwrap();
        cache.apply_remote(remote());
        assert_eq!(cache.snapshot().led_state.brightness, 10);
    }

    #[tokio::test]
    async fn test_demo_device_refuses_factory_reset() {
        let (dispatcher, _) = dispatcher(Arc::new(DemoTransport::new()));

        let err = dispatcher.factory_reset().await.unwrap_err();

        assert_eq!(err.to_string(), "A demo Luxio cannot factory reset, obviously!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_networks_scans_then_lists() {
        let transport = Arc::new(MockTransport::default());
        *transport.networks.lock().unwrap() = vec![
            WifiNetwork {
                ssid: "Home".to_string(),
                rssi: -70,
                encrypted: true,
            },
            WifiNetwork {
                ssid: "Home".to_string(),
                rssi: -30,
                encrypted: true,
            },
        ];
        let (dispatcher, _) = dispatcher(transport.clone());

        let networks = dispatcher.find_networks(Duration::from_secs(5)).await.unwrap();

        assert_eq!(transport.sent_commands(), vec![DeviceCommand::ScanNetworks]);
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].rssi, -30);
    }

    #[tokio::test]
    async fn test_connect_wifi_requires_ssid() {
        let transport = Arc::new(MockTransport::default());
        let (dispatcher, _) = dispatcher(transport.clone());

        let err = dispatcher.connect_wifi("", "secret").await.unwrap_err();

        assert!(matches!(err, CommandError::Invalid(_)));
        assert!(transport.sent_commands().is_empty());
    }
}

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, PushMode};
use crate::control_interface::{DeviceTransport, EventStream};
use crate::device::cache::DeviceCache;
use crate::device::events::{DeviceEvent, EventTopic, ListenerId};
use crate::error::ConnectionError;
use crate::util::throttle::Throttle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last attempt or the live channel failed. Polling connections keep
    /// trying and return to `Connected` on the next good poll.
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// The live link to one device: initial snapshot, then either the device's
/// event stream or periodic polling.
///
/// Cheap to clone. Background tasks only hold a weak reference and stop once
/// the last handle is dropped.
#[derive(Clone)]
pub struct DeviceConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    transport: Arc<dyn DeviceTransport>,
    cache: Arc<DeviceCache>,
    push_mode: PushMode,
    poll_interval: Duration,
    refresh_throttle: Duration,
    state: watch::Sender<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    /// Number of finished connection attempts.
    attempts: AtomicU64,
    last_error: Mutex<Option<ConnectionError>>,
    cancel: CancellationToken,
    task: Mutex<Option<LiveTask>>,
    refresh: OnceLock<Throttle<(), Result<(), ConnectionError>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Push,
    Poll,
}

struct LiveTask {
    channel: Channel,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl DeviceConnection {
    pub(crate) fn new(
        transport: Arc<dyn DeviceTransport>,
        cache: Arc<DeviceCache>,
        config: &ClientConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        DeviceConnection {
            inner: Arc::new(ConnectionInner {
                transport,
                cache,
                push_mode: config.push_mode,
                poll_interval: config.poll_interval,
                refresh_throttle: config.refresh_throttle,
                state,
                connect_lock: tokio::sync::Mutex::new(()),
                attempts: AtomicU64::new(0),
                last_error: Mutex::new(None),
                cancel,
                task: Mutex::new(None),
                refresh: OnceLock::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Fetches the full state and opens the live channel.
    ///
    /// Idempotent: a connected device returns immediately, and callers that
    /// arrive while an attempt is running wait for it and share its outcome.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let observed = self.inner.attempts.load(Ordering::SeqCst);
        let _guard = self.inner.connect_lock.lock().await;

        if self.inner.cancel.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }
        if self.inner.attempts.load(Ordering::SeqCst) != observed {
            return match self.state() {
                ConnectionState::Connected => Ok(()),
                _ => Err(self
                    .inner
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                    .unwrap_or(ConnectionError::Cancelled)),
            };
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let result = self.inner.establish().await;
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// Stops the live channel. State stays cached, listeners stay registered.
    pub fn disconnect(&self) {
        self.inner.stop_task();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Re-fetches the full state. Bursts of calls are coalesced into at most
    /// one request per refresh window.
    pub async fn refresh(&self) -> Result<(), ConnectionError> {
        let throttle = self.inner.refresh.get_or_init(|| {
            let inner = Arc::downgrade(&self.inner);
            Throttle::new(self.inner.refresh_throttle, move |()| {
                let inner = inner.clone();
                async move {
                    match inner.upgrade() {
                        Some(inner) => inner.refresh_now().await,
                        None => Err(ConnectionError::Cancelled),
                    }
                }
            })
        });
        throttle
            .call(())
            .await
            .unwrap_or(Err(ConnectionError::Cancelled))
    }

    pub fn add_event_listener<F>(&self, topic: EventTopic, handler: F) -> ListenerId
    where
        F: Fn(&DeviceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.cache.listeners().add(topic, handler)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.cache.listeners().remove(id)
    }
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("host", &self.inner.transport.host())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionInner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn fail(&self, error: &ConnectionError) {
        warn!("Connection to {} failed: {}", self.transport.host(), error);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
        self.set_state(ConnectionState::Error(error.to_string()));
    }

    fn stop_task(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.token.cancel();
        }
    }

    /// A poll loop is still running. Only polling can bring an errored
    /// connection back, a dead event stream needs a new `connect()`.
    fn is_polling(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| task.channel == Channel::Poll && !task.handle.is_finished())
    }

    async fn establish(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.stop_task();
        self.set_state(ConnectionState::Connecting);
        debug!("Connecting to {}", self.transport.host());

        match self.open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn open(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let snapshot = self.transport.fetch_snapshot().await?;
        self.cache.apply_snapshot(snapshot);

        let stream = match self.push_mode {
            PushMode::Poll => None,
            PushMode::Push => Some(self.transport.subscribe().await?),
            PushMode::Auto => match self.transport.subscribe().await {
                Ok(stream) => Some(stream),
                Err(ConnectionError::PushUnsupported) => {
                    info!(
                        "{} has no event stream, polling every {:?}",
                        self.transport.host(),
                        self.poll_interval
                    );
                    None
                }
                Err(e) => return Err(e),
            },
        };

        let token = self.cancel.child_token();
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.set_state(ConnectionState::Connected);
        info!("Connected to {}", self.transport.host());

        let weak = Arc::downgrade(self);
        let (channel, handle) = match stream {
            Some(stream) => (Channel::Push, tokio::spawn(pump(weak, stream, token.clone()))),
            None => (Channel::Poll, tokio::spawn(poll(weak, self.poll_interval, token.clone()))),
        };
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(LiveTask {
            channel,
            token,
            handle,
        });
        Ok(())
    }

    /// One full-state fetch. A good poll heals an errored polling connection.
    async fn refresh_now(&self) -> Result<(), ConnectionError> {
        match self.transport.fetch_snapshot().await {
            Ok(snapshot) => {
                self.cache.apply_snapshot(snapshot);
                let errored = matches!(*self.state.borrow(), ConnectionState::Error(_));
                if errored && self.is_polling() {
                    info!("{} is reachable again", self.transport.host());
                    *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
                    self.set_state(ConnectionState::Connected);
                }
                Ok(())
            }
            Err(e) => {
                if *self.state.borrow() == ConnectionState::Connected {
                    self.fail(&e);
                }
                Err(e)
            }
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.stop_task();
    }
}

async fn pump(weak: Weak<ConnectionInner>, mut stream: EventStream, token: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return,
            next = stream.next() => next,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if token.is_cancelled() {
            return;
        }
        match next {
            Some(Ok(event)) => inner.cache.apply_remote(event),
            Some(Err(e)) => {
                inner.fail(&e);
                return;
            }
            None => {
                inner.fail(&ConnectionError::StreamClosed(
                    "device ended the event stream".to_string(),
                ));
                return;
            }
        }
    }
}

async fn poll(weak: Weak<ConnectionInner>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires at once and the snapshot is fresh.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if let Err(e) = inner.refresh_now().await {
            debug!("Poll of {} failed: {}", inner.transport.host(), e);
        }
    }
}

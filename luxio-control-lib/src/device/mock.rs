use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::control_interface::{DeviceTransport, EventStream, WifiNetwork};
use crate::device::command::DeviceCommand;
use crate::device::events::DeviceEvent;
use crate::device::DeviceSnapshot;
use crate::error::{CommandError, ConnectionError};

pub(crate) type PushSender = mpsc::UnboundedSender<Result<DeviceEvent, ConnectionError>>;

/// Scriptable transport that records what it was asked to do.
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    pub snapshot: Mutex<DeviceSnapshot>,
    pub fail_fetch: AtomicBool,
    pub fetches: AtomicUsize,
    /// `None` makes `subscribe` report that push is unsupported.
    pub push: Mutex<Option<mpsc::UnboundedReceiver<Result<DeviceEvent, ConnectionError>>>>,
    pub sent: Mutex<Vec<(DeviceCommand, Instant)>>,
    pub fail_send: AtomicBool,
    pub send_delay: Mutex<Duration>,
    pub networks: Mutex<Vec<WifiNetwork>>,
}

impl MockTransport {
    pub fn with_push() -> (Self, PushSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = MockTransport::default();
        *transport.push.lock().unwrap() = Some(rx);
        (transport, tx)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn sent_commands(&self) -> Vec<DeviceCommand> {
        self.sent.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    fn host(&self) -> String {
        "mock".to_string()
    }

    fn set_host(&self, _host: &str) {}

    async fn fetch_snapshot(&self) -> Result<DeviceSnapshot, ConnectionError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ConnectionError::Request {
                host: "mock".to_string(),
                message: "unreachable".to_string(),
            });
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn subscribe(&self) -> Result<EventStream, ConnectionError> {
        let rx = self.push.lock().unwrap().take().ok_or(ConnectionError::PushUnsupported)?;
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn send(&self, command: &DeviceCommand) -> Result<(), CommandError> {
        self.sent.lock().unwrap().push((command.clone(), Instant::now()));
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(CommandError::Rejected {
                method: command.method().to_string(),
                status: 500,
            });
        }
        Ok(())
    }

    async fn get_networks(&self) -> Result<Vec<WifiNetwork>, CommandError> {
        Ok(self.networks.lock().unwrap().clone())
    }
}

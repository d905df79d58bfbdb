use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

struct Submission<T, R> {
    value: T,
    reply: oneshot::Sender<R>,
}

/// Leading + trailing throttle in front of an async sink.
///
/// The first value of a burst goes out immediately. Values submitted while the
/// window is open replace each other; when the window closes the latest one is
/// sent and a new window opens. The sink is awaited before the next value is
/// sent, so values reach it in submission order.
///
/// Every submitter gets the result of the sink call that carried its value or
/// the value that replaced it.
pub struct Throttle<T, R> {
    tx: mpsc::UnboundedSender<Submission<T, R>>,
}

impl<T, R> Throttle<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Spawns the throttle task on the current tokio runtime. The task exits
    /// once the `Throttle` is dropped and the last pending value is flushed.
    pub fn new<F, Fut>(window: Duration, sink: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(window, rx, sink));
        Throttle { tx }
    }

    /// Queues a value. The receiver resolves once the value, or the value that
    /// superseded it, has been through the sink. It errors if the throttle
    /// task is gone.
    pub fn call(&self, value: T) -> oneshot::Receiver<R> {
        let (reply, rx) = oneshot::channel();
        // A send error drops `reply`, which the caller sees as a closed receiver.
        let _ = self.tx.send(Submission { value, reply });
        rx
    }
}

async fn run<T, R, F, Fut>(window: Duration, mut rx: mpsc::UnboundedReceiver<Submission<T, R>>, sink: F)
where
    R: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    while let Some(first) = rx.recv().await {
        let mut waiting = vec![first.reply];
        let mut next = Some(first.value);
        let mut closed = false;

        while let Some(value) = next.take() {
            let deadline = Instant::now() + window;
            let result = sink(value).await;
            for reply in waiting.drain(..) {
                let _ = reply.send(result.clone());
            }
            if closed {
                return;
            }

            loop {
                tokio::select! {
                    biased;
                    submission = rx.recv() => match submission {
                        Some(submission) => {
                            next = Some(submission.value);
                            waiting.push(submission.reply);
                        }
                        None => {
                            closed = true;
                            break;
                        }
                    },
                    _ = sleep_until(deadline) => {
                        // The sink may have outlived the window; pick up what queued meanwhile.
                        while let Ok(submission) = rx.try_recv() {
                            next = Some(submission.value);
                            waiting.push(submission.reply);
                        }
                        break;
                    }
                }
            }
        }

        if closed {
            return;
        }
    }
}

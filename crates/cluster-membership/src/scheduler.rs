//! Cancellable background tasks owned by a running protocol

use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::warn;

#[derive(Debug, Default)]
pub struct TaskSet {
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(task));
    }

    /// Send `command()` to `commands` every `period`, starting one period
    /// from now. The task ends when the receiving side goes away.
    pub fn spawn_periodic<C, F>(
        &mut self,
        period: Duration,
        commands: mpsc::UnboundedSender<C>,
        command: F,
    ) where
        C: Send + 'static,
        F: Fn() -> C + Send + 'static,
    {
        self.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if commands.send(command()).is_err() {
                    break;
                }
            }
        });
    }

    /// Relay every broadcast item into `commands` until either side closes
    pub fn spawn_forward<E, C, F>(
        &mut self,
        mut events: broadcast::Receiver<E>,
        commands: mpsc::UnboundedSender<C>,
        command: F,
    ) where
        E: Clone + Send + 'static,
        C: Send + 'static,
        F: Fn(E) -> C + Send + 'static,
    {
        self.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if commands.send(command(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} lagging events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

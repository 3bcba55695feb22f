//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Owned, cancellable periodic task handle."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error};

struct Running {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// A single background loop owned by a component.
///
/// At most one loop runs per handle; `stop` signals it and waits for it to exit.
pub(crate) struct PeriodicTask {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the loop. Returns false when a loop is already running.
    ///
    /// The first tick fires immediately.
    pub(crate) fn start<F, Fut>(&self, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let name = self.name;
        let period = period.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(
                            target: "rampart::resilience::timer",
                            task = name,
                            "shutdown signal received"
                        );
                        break;
                    }
                    _ = ticker.tick() => tick().await,
                }
            }
        });
        *running = Some(Running { shutdown, task });
        true
    }

    /// Signal the loop and wait for it to finish its current tick.
    pub(crate) async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { shutdown, task }) = running {
            let _ = shutdown.send(());
            if let Err(err) = task.await {
                error!(
                    target: "rampart::resilience::timer",
                    task = self.name,
                    error = %err,
                    "periodic task join error"
                );
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.task.abort();
        }
    }
}

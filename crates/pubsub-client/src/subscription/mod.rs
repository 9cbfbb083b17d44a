//! Subscription engine: the long-poll driver, its command queue and the
//! heartbeat ticker.

pub(crate) mod event_loop;
pub(crate) mod protocol;
pub(crate) mod reconnect;
pub(crate) mod state;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::heartbeat::{Announcer, spawn_heartbeat};
use crate::listener::ListenerRegistry;
use crate::request::Executor;

use self::event_loop::{Command, Driver};
use self::state::Snapshot;

/// How long shutdown waits for each background task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Handle to the background driver and heartbeat tasks.
pub(crate) struct SubscriptionManager {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: Arc<RwLock<Snapshot>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    /// Spawn the driver and heartbeat tasks on `runtime`.
    pub fn start(
        runtime: &tokio::runtime::Handle,
        executor: Executor,
        listeners: ListenerRegistry,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(Snapshot::default()));
        let announcer = Announcer::new(executor.clone(), listeners.clone());

        let heartbeat = {
            let _guard = runtime.enter();
            spawn_heartbeat(
                announcer.clone(),
                snapshot.clone(),
                executor.shutdown_token().clone(),
            )
        };
        let driver = Driver::new(executor, listeners, announcer, snapshot.clone());
        let driver = runtime.spawn(driver.run(rx));

        Self {
            commands,
            snapshot,
            driver: Mutex::new(Some(driver)),
            heartbeat: Mutex::new(heartbeat),
        }
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Cancelled)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    /// Stop the driver (sending leaves unless suppressed), then cancel
    /// everything through `executor` and wait for the heartbeat to end.
    pub async fn shutdown(&self, executor: &Executor) {
        // A closed queue means the driver already exited.
        let _ = self.commands.send(Command::Stop);

        let driver = self.driver.lock().take();
        if let Some(handle) = driver {
            join_or_abort(handle, "subscribe driver").await;
        }
        executor.cancel_all();

        let heartbeat = self.heartbeat.lock().take();
        if let Some(handle) = heartbeat {
            join_or_abort(handle, "heartbeat").await;
        }
        *self.snapshot.write() = Snapshot::default();
    }
}

async fn join_or_abort(mut handle: JoinHandle<()>, task: &'static str) {
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(task, error = %e, "background task failed"),
        Err(_) => {
            tracing::warn!(task, "background task did not stop in time, aborting");
            handle.abort();
        }
    }
}

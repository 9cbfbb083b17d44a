//! Presence announcements: periodic heartbeats and leave notifications.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::endpoints::presence::{Heartbeat, Leave};
use crate::listener::ListenerRegistry;
use crate::request::Executor;
use crate::status::StatusCategory;
use crate::subscription::state::{ConnectionState, Snapshot};

/// Sends heartbeat and leave requests and reports heartbeat outcomes to
/// listeners according to the announce flags.
#[derive(Clone)]
pub(crate) struct Announcer {
    executor: Executor,
    listeners: ListenerRegistry,
}

impl Announcer {
    pub fn new(executor: Executor, listeners: ListenerRegistry) -> Self {
        Self {
            executor,
            listeners,
        }
    }

    pub async fn heartbeat(&self, channels: Vec<String>, groups: Vec<String>) {
        let endpoint = Heartbeat { channels, groups };
        let (result, mut status) = self.executor.run(&endpoint, None).await;
        let config = self.executor.config().get();
        match result {
            Ok(()) => {
                tracing::trace!("heartbeat sent");
                if config.announce_successful_heartbeats {
                    status.category = StatusCategory::HeartbeatSuccess;
                    self.listeners.emit_status(&status);
                }
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat failed");
                if config.announce_failed_heartbeats {
                    status.category = StatusCategory::HeartbeatFailed;
                    self.listeners.emit_status(&status);
                }
            }
        }
    }

    /// Best effort; failures are only logged.
    pub async fn leave(&self, channels: Vec<String>, groups: Vec<String>) {
        if channels.is_empty() && groups.is_empty() {
            return;
        }
        let endpoint = Leave { channels, groups };
        if let (Err(e), _) = self.executor.run(&endpoint, None).await {
            tracing::warn!(error = %e, "leave failed");
        }
    }
}

/// Start the heartbeat timer. Returns `None` when the announce interval is
/// zero.
pub(crate) fn spawn_heartbeat(
    announcer: Announcer,
    snapshot: Arc<RwLock<Snapshot>>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let period = announcer.executor.config().get().presence_announce_interval();
    if period.is_zero() {
        tracing::debug!("heartbeat disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            let (channels, groups) = {
                let snap = snapshot.read();
                if snap.connection == ConnectionState::Disconnected {
                    continue;
                }
                (snap.channels.clone(), snap.groups.clone())
            };
            if channels.is_empty() && groups.is_empty() {
                continue;
            }
            tokio::select! {
                _ = announcer.heartbeat(channels, groups) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{Config, SharedConfig};
    use crate::request::testing::NullTransport;
    use crate::state::StateStore;

    struct PresenceOk;

    #[async_trait::async_trait]
    impl crate::transport::Transport for PresenceOk {
        async fn send(
            &self,
            _request: crate::transport::HttpRequest,
        ) -> std::result::Result<crate::transport::HttpResponse, crate::transport::TransportError>
        {
            Ok(crate::request::testing::response(
                200,
                r#"{"status":200,"message":"OK","service":"Presence"}"#,
            ))
        }
    }

    fn announcer_with(
        config: Config,
        transport: Arc<dyn crate::transport::Transport>,
    ) -> (Announcer, ListenerRegistry) {
        let executor = Executor::new(SharedConfig::new(config), transport, None, StateStore::new());
        let listeners = ListenerRegistry::new();
        (Announcer::new(executor, listeners.clone()), listeners)
    }

    fn announcer(config: Config) -> (Announcer, ListenerRegistry) {
        announcer_with(config, Arc::new(NullTransport))
    }

    #[tokio::test]
    async fn successful_heartbeat_is_announced_as_heartbeat_success() {
        let mut config = Config::new("pub", "sub", "me");
        config.announce_successful_heartbeats = true;
        let (announcer, listeners) = announcer_with(config, Arc::new(PresenceOk));
        let mut l = listeners.add(4);
        announcer.heartbeat(vec!["ch".into()], Vec::new()).await;
        let status = l.status().recv().await.unwrap();
        assert_eq!(status.category, StatusCategory::HeartbeatSuccess);
        assert_eq!(status.status_code, 200);
        assert!(l.status().try_recv().is_err());
    }

    #[tokio::test]
    async fn successful_heartbeat_is_quiet_by_default() {
        let (announcer, listeners) =
            announcer_with(Config::new("pub", "sub", "me"), Arc::new(PresenceOk));
        let mut l = listeners.add(4);
        announcer.heartbeat(vec!["ch".into()], Vec::new()).await;
        assert!(l.status().try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_heartbeat_is_announced() {
        let (announcer, listeners) = announcer(Config::new("pub", "sub", "me"));
        let mut l = listeners.add(4);
        announcer.heartbeat(vec!["ch".into()], Vec::new()).await;
        let status = l.status().recv().await.unwrap();
        assert_eq!(status.category, StatusCategory::HeartbeatFailed);
        assert_eq!(status.affected_channels, vec!["ch"]);
    }

    #[tokio::test]
    async fn failed_heartbeat_can_be_silenced() {
        let mut config = Config::new("pub", "sub", "me");
        config.announce_failed_heartbeats = false;
        let (announcer, listeners) = announcer(config);
        let mut l = listeners.add(4);
        announcer.heartbeat(vec!["ch".into()], Vec::new()).await;
        assert!(l.status().try_recv().is_err());
    }

    #[tokio::test]
    async fn zero_interval_disables_timer() {
        let mut config = Config::new("pub", "sub", "me");
        config.heartbeat_interval = Some(Duration::ZERO);
        let (announcer, _) = announcer(config);
        let handle = spawn_heartbeat(
            announcer,
            Arc::new(RwLock::new(Snapshot::default())),
            CancellationToken::new(),
        );
        assert!(handle.is_none());
    }
}

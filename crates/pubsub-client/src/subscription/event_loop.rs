//! The subscribe driver: one task owning the subscription state, the single
//! outstanding long poll and the reconnect timer.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::heartbeat::Announcer;
use crate::listener::ListenerRegistry;
use crate::request::Executor;
use crate::status::{Operation, Status, StatusCategory};
use crate::subscription::protocol::{SubscribeRequest, SubscribeResponse, decode_envelope};
use crate::subscription::reconnect::{RetryPolicy, policy_for, within_budget};
use crate::subscription::state::{ConnectionState, Cursor, Snapshot, SubscriptionState};
use crate::types::Event;

/// Requests serialized through the driver's queue.
#[derive(Debug)]
pub(crate) enum Command {
    Subscribe {
        channels: Vec<String>,
        groups: Vec<String>,
        with_presence: bool,
        timetoken: Option<i64>,
        cancel: Option<CancellationToken>,
    },
    Unsubscribe {
        channels: Vec<String>,
        groups: Vec<String>,
    },
    UnsubscribeAll,
    Reconnect,
    Disconnect,
    Stop,
}

type Poll = BoxFuture<'static, (Result<SubscribeResponse>, Status)>;

pub(crate) struct Driver {
    executor: Executor,
    listeners: ListenerRegistry,
    announcer: Announcer,
    state: SubscriptionState,
    snapshot: Arc<RwLock<Snapshot>>,
    policy: Box<dyn RetryPolicy>,
    /// Caller-supplied token from the latest subscribe command.
    user_cancel: Option<CancellationToken>,
    in_flight: Option<Poll>,
    retry_at: Option<Instant>,
}

async fn next_poll(poll: &mut Option<Poll>) -> (Result<SubscribeResponse>, Status) {
    match poll {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    pub fn new(
        executor: Executor,
        listeners: ListenerRegistry,
        announcer: Announcer,
        snapshot: Arc<RwLock<Snapshot>>,
    ) -> Self {
        let policy = policy_for(executor.config().get().reconnection_policy);
        Self {
            executor,
            listeners,
            announcer,
            state: SubscriptionState::default(),
            snapshot,
            policy,
            user_cancel: None,
            in_flight: None,
            retry_at: None,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let shutdown = self.executor.shutdown_token().clone();
        tracing::debug!("subscribe driver started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(Command::Stop) | None => {
                        self.stop().await;
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },

                (result, status) = next_poll(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.handle_response(result, status);
                }

                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    tracing::info!(retry_count = self.state.retry_count, "reconnecting");
                    self.state.connection = ConnectionState::Reconnecting;
                    self.start_poll();
                }
            }
            self.publish();
        }

        self.in_flight = None;
        self.state.clear();
        self.state.cursor = Cursor::default();
        self.state.connection = ConnectionState::Disconnected;
        self.publish();
        tracing::debug!("subscribe driver stopped");
    }

    fn publish(&self) {
        *self.snapshot.write() = self.state.snapshot();
    }

    fn status(&self, category: StatusCategory) -> Status {
        Status::new(Operation::Subscribe, category)
            .with_targets(&self.state.channel_names(), &self.state.group_names())
    }

    /// Replace any in-flight poll with a fresh request for the current set.
    fn start_poll(&mut self) {
        self.retry_at = None;
        if self.state.is_empty() {
            self.in_flight = None;
            return;
        }
        let request = SubscribeRequest {
            channels: self.state.wire_channels(),
            groups: self.state.wire_groups(),
            cursor: self.state.cursor,
        };
        tracing::debug!(
            timetoken = request.cursor.timetoken,
            region = request.cursor.region,
            channels = request.channels.len(),
            groups = request.groups.len(),
            "long poll"
        );
        let executor = self.executor.clone();
        let cancel = self.user_cancel.clone();
        self.in_flight = Some(Box::pin(async move { executor.run(&request, cancel).await }));
    }

    /// Restart from a handshake after a set change. A client that is already
    /// connected stays connected without a new status.
    fn rehandshake(&mut self, cursor: Cursor) {
        self.state.cursor = cursor;
        self.state.retry_count = 0;
        if self.state.connection != ConnectionState::Connected {
            self.state.connection = ConnectionState::Connecting;
        }
        self.start_poll();
    }

    fn go_disconnected(&mut self) {
        self.in_flight = None;
        self.retry_at = None;
        self.state.connection = ConnectionState::Disconnected;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe {
                channels,
                groups,
                with_presence,
                timetoken,
                cancel,
            } => {
                if cancel.is_some() {
                    self.user_cancel = cancel;
                }
                self.state.add(&channels, &groups, with_presence);
                let cursor = timetoken
                    .map(|timetoken| Cursor {
                        timetoken,
                        region: 0,
                    })
                    .unwrap_or_default();
                tracing::info!(
                    channels = ?channels,
                    groups = ?groups,
                    with_presence,
                    catch_up = timetoken.is_some(),
                    "subscribe"
                );
                self.rehandshake(cursor);
            }
            Command::Unsubscribe { channels, groups } => {
                let removed = self.state.remove(&channels, &groups);
                self.after_removal(removed).await;
            }
            Command::UnsubscribeAll => {
                let removed = self.state.clear();
                self.after_removal(removed).await;
            }
            Command::Reconnect => {
                if self.state.is_empty() {
                    tracing::debug!("reconnect ignored, nothing subscribed");
                    return;
                }
                tracing::info!("reconnect requested");
                self.state.connection = ConnectionState::Connecting;
                self.rehandshake(Cursor::default());
            }
            Command::Disconnect => {
                tracing::info!("disconnect requested");
                self.go_disconnected();
                self.listeners
                    .emit_status(&self.status(StatusCategory::Disconnected));
            }
            Command::Stop => self.stop().await,
        }
    }

    async fn after_removal(&mut self, (channels, groups): (Vec<String>, Vec<String>)) {
        if channels.is_empty() && groups.is_empty() {
            return;
        }
        tracing::info!(channels = ?channels, groups = ?groups, "unsubscribe");
        self.in_flight = None;
        self.retry_at = None;

        if !self.executor.config().get().suppress_leave_events {
            self.announcer.leave(channels.clone(), groups.clone()).await;
        }

        if self.state.is_empty() {
            self.go_disconnected();
            self.state.cursor = Cursor::default();
            self.state.retry_count = 0;
            let status = Status::new(Operation::Unsubscribe, StatusCategory::Disconnected)
                .with_targets(&channels, &groups);
            self.listeners.emit_status(&status);
        } else {
            self.rehandshake(Cursor::default());
        }
    }

    async fn stop(&mut self) {
        self.in_flight = None;
        self.retry_at = None;
        if self.state.is_empty() || self.executor.config().get().suppress_leave_events {
            return;
        }
        let channels = self.state.channel_names();
        let groups = self.state.group_names();
        self.announcer.leave(channels, groups).await;
    }

    fn handle_response(&mut self, result: Result<SubscribeResponse>, status: Status) {
        match result {
            Ok(response) => self.on_success(response, status.status_code),
            Err(Error::Cancelled) => self.on_cancelled(),
            // An unreadable 200 body (e.g. from a proxy) is treated like a
            // dropped connection.
            Err(e) if e.is_retriable() || matches!(e, Error::Decoding(_)) => {
                self.on_retriable(&e, status)
            }
            Err(e) => {
                tracing::warn!(error = %e, "subscribe failed");
                self.go_disconnected();
                self.listeners.emit_status(&status);
            }
        }
    }

    fn on_success(&mut self, response: SubscribeResponse, status_code: u16) {
        let next = Cursor::from(response.cursor);
        if next.timetoken >= self.state.cursor.timetoken {
            self.state.cursor = next;
        } else {
            tracing::warn!(
                current = self.state.cursor.timetoken,
                received = next.timetoken,
                "ignoring cursor that moves backwards"
            );
        }

        let category = if self.state.retry_count > 0 {
            Some(StatusCategory::Reconnected)
        } else if self.state.connection != ConnectionState::Connected {
            Some(StatusCategory::Connected)
        } else {
            None
        };
        if let Some(category) = category {
            tracing::info!(?category, timetoken = self.state.cursor.timetoken, "connected");
            self.listeners
                .emit_status(&self.status(category).with_status_code(status_code));
        }
        self.state.connection = ConnectionState::Connected;
        self.state.retry_count = 0;

        let overflow = self.executor.config().get().message_queue_overflow_count;
        if response.envelopes.len() >= overflow {
            tracing::warn!(count = response.envelopes.len(), threshold = overflow, "message count exceeded");
            self.listeners
                .emit_status(&self.status(StatusCategory::MessageCountExceeded));
        }

        let cipher = self.executor.cipher();
        let events: Vec<Event> = response
            .envelopes
            .into_iter()
            .map(|raw| {
                decode_envelope(raw, cipher.as_deref()).unwrap_or_else(|(channel, e)| {
                    tracing::warn!(channel = ?channel, error = %e, "skipping undecodable envelope");
                    let mut status = Status::from_error(Operation::Subscribe, &e)
                        .with_targets(channel.as_slice(), &[]);
                    status.category = StatusCategory::DecryptionError;
                    Event::Status(status)
                })
            })
            .collect();
        self.listeners.dispatch(events);
        self.start_poll();
    }

    fn on_cancelled(&mut self) {
        if self.executor.shutdown_token().is_cancelled() {
            return;
        }
        tracing::info!("subscribe cancelled by caller");
        self.user_cancel = None;
        self.go_disconnected();
        let mut status = self.status(StatusCategory::Cancelled);
        status.was_cancelled = true;
        self.listeners.emit_status(&status);
    }

    fn on_retriable(&mut self, error: &Error, status: Status) {
        let attempt = self.state.retry_count;
        let max_retries = self.executor.config().get().maximum_reconnection_retries;

        if !within_budget(attempt, max_retries) {
            tracing::error!(retry_count = attempt, error = %error, "reconnection attempts exhausted");
            self.go_disconnected();
            let mut exhausted = status;
            exhausted.category = StatusCategory::ReconnectionAttemptsExhausted;
            exhausted.retry_count = attempt;
            self.listeners.emit_status(&exhausted);
            return;
        }

        let Some(delay) = self.policy.next_delay(attempt) else {
            tracing::warn!(error = %error, "subscribe failed, reconnection disabled");
            self.go_disconnected();
            self.listeners.emit_status(&status);
            return;
        };

        self.state.retry_count = attempt + 1;
        self.state.connection = ConnectionState::UnexpectedDisconnect;
        self.retry_at = Some(Instant::now() + delay);
        tracing::warn!(
            error = %error,
            retry_count = self.state.retry_count,
            delay_ms = delay.as_millis() as u64,
            "subscribe failed, scheduling reconnect"
        );

        let mut unexpected = status;
        unexpected.category = StatusCategory::UnexpectedDisconnect;
        unexpected.retry_delay = Some(delay);
        unexpected.retry_count = self.state.retry_count;
        self.listeners.emit_status(&unexpected);
    }
}

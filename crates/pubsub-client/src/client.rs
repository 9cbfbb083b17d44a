//! [`Client`]: the facade that owns configuration, transport, listeners and
//! the subscription engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::config::{Config, SharedConfig};
use crate::crypto::{AesCbcCipher, EncryptionProvider};
use crate::endpoints::access::{GrantToken, GrantTokenBuilder, RevokeToken, RevokeTokenBuilder};
use crate::endpoints::channel_groups::{
    GroupAction, ListChannelsInGroup, ListChannelsInGroupBuilder, ModifyChannelGroup,
    ModifyChannelGroupBuilder,
};
use crate::endpoints::files::{ListFiles, ListFilesBuilder};
use crate::endpoints::history::{DeleteMessages, DeleteMessagesBuilder, History, HistoryBuilder};
use crate::endpoints::presence::{
    GetState, GetStateBuilder, HereNow, HereNowBuilder, SetState, SetStateBuilder, WhereNow,
    WhereNowBuilder,
};
use crate::endpoints::publish::{Publish, PublishBuilder, PublishKind};
use crate::endpoints::push::{
    ListPushProvisions, ListPushProvisionsBuilder, ModifyPush, ModifyPushBuilder, PushAction,
};
use crate::endpoints::time::{Time, TimeBuilder};
use crate::error::{Error, Result};
use crate::listener::{Listener, ListenerId, ListenerRegistry};
use crate::request::{Endpoint, Executor, RequestBuilder};
use crate::state::StateStore;
use crate::subscription::SubscriptionManager;
use crate::subscription::event_loop::Command;
use crate::subscription::state::{ConnectionState, Cursor};
use crate::token::{PermissionsBody, Token, parse_token};
use crate::transport::{ReqwestTransport, Transport};

struct ClientInner {
    executor: Executor,
    listeners: ListenerRegistry,
    manager: SubscriptionManager,
    destroyed: AtomicBool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.executor.cancel_all();
    }
}

/// Entry point of the SDK. Clone is a cheap Arc refcount bump; every clone
/// drives the same subscription.
///
/// Must be created inside a tokio runtime: the subscribe driver and the
/// heartbeat ticker are spawned on it.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client using the default `reqwest` transport.
    pub fn new(config: Config) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let cipher = config
            .cipher_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(|key| {
                Arc::new(AesCbcCipher::new(key, config.use_random_initialization_vector))
                    as Arc<dyn EncryptionProvider>
            });
        Self::with_components(config, transport, cipher)
    }

    /// Build a client with a custom transport and encryption provider. A
    /// provided `cipher` takes precedence over `Config::cipher_key`.
    pub fn with_components(
        config: Config,
        transport: Arc<dyn Transport>,
        cipher: Option<Arc<dyn EncryptionProvider>>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::validation("a client must be created inside a tokio runtime"))?;

        tracing::info!(
            uuid = %config.uuid,
            origin = %config.origin,
            encrypted = cipher.is_some(),
            "creating client"
        );
        let executor = Executor::new(SharedConfig::new(config), transport, cipher, StateStore::new());
        let listeners = ListenerRegistry::new();
        let manager = SubscriptionManager::start(&runtime, executor.clone(), listeners.clone());

        Ok(Self {
            inner: Arc::new(ClientInner {
                executor,
                listeners,
                manager,
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    fn builder<E: Endpoint>(&self, endpoint: E) -> RequestBuilder<E> {
        RequestBuilder::new(self.inner.executor.clone(), endpoint)
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        self.inner.manager.send(command)
    }

    // -----------------------------------------------------------------------
    // One-shot operations
    // -----------------------------------------------------------------------

    pub fn time(&self) -> TimeBuilder {
        self.builder(Time)
    }

    pub fn publish(&self) -> PublishBuilder {
        self.builder(Publish::new(PublishKind::Publish))
    }

    /// Publish to functions only: not stored and not replicated.
    pub fn fire(&self) -> PublishBuilder {
        self.builder(Publish::new(PublishKind::Fire))
    }

    pub fn signal(&self) -> PublishBuilder {
        self.builder(Publish::new(PublishKind::Signal))
    }

    pub fn history(&self) -> HistoryBuilder {
        self.builder(History::default())
    }

    pub fn delete_messages(&self) -> DeleteMessagesBuilder {
        self.builder(DeleteMessages::default())
    }

    pub fn here_now(&self) -> HereNowBuilder {
        self.builder(HereNow::default())
    }

    pub fn where_now(&self) -> WhereNowBuilder {
        self.builder(WhereNow::default())
    }

    pub fn set_state(&self) -> SetStateBuilder {
        self.builder(SetState::default())
    }

    pub fn get_state(&self) -> GetStateBuilder {
        self.builder(GetState::default())
    }

    pub fn add_channels_to_group(&self) -> ModifyChannelGroupBuilder {
        self.builder(ModifyChannelGroup::new(GroupAction::Add))
    }

    pub fn remove_channels_from_group(&self) -> ModifyChannelGroupBuilder {
        self.builder(ModifyChannelGroup::new(GroupAction::Remove))
    }

    pub fn delete_channel_group(&self) -> ModifyChannelGroupBuilder {
        self.builder(ModifyChannelGroup::new(GroupAction::Delete))
    }

    pub fn list_channels_in_group(&self) -> ListChannelsInGroupBuilder {
        self.builder(ListChannelsInGroup::default())
    }

    pub fn add_push_notifications(&self) -> ModifyPushBuilder {
        self.builder(ModifyPush::new(PushAction::Add))
    }

    pub fn remove_push_notifications(&self) -> ModifyPushBuilder {
        self.builder(ModifyPush::new(PushAction::Remove))
    }

    pub fn remove_all_push_notifications(&self) -> ModifyPushBuilder {
        self.builder(ModifyPush::new(PushAction::RemoveAll))
    }

    pub fn list_push_provisions(&self) -> ListPushProvisionsBuilder {
        self.builder(ListPushProvisions::default())
    }

    pub fn grant_token(&self) -> GrantTokenBuilder {
        self.builder(GrantToken::default())
    }

    pub fn revoke_token(&self) -> RevokeTokenBuilder {
        self.builder(RevokeToken::default())
    }

    pub fn list_files(&self) -> ListFilesBuilder {
        self.builder(ListFiles::default())
    }

    // -----------------------------------------------------------------------
    // Listeners and subscription
    // -----------------------------------------------------------------------

    /// Register a listener whose queues hold up to
    /// `Config::message_queue_overflow_count` events each.
    pub fn add_listener(&self) -> Listener {
        let capacity = self.inner.executor.config().get().message_queue_overflow_count;
        self.inner.listeners.add(capacity)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn subscribe(&self) -> SubscribeBuilder<'_> {
        SubscribeBuilder {
            client: self,
            channels: Vec::new(),
            groups: Vec::new(),
            with_presence: false,
            timetoken: None,
            cancel: None,
        }
    }

    /// Leave the given channels and groups. Enqueued; outcomes arrive as
    /// status events.
    pub fn unsubscribe<C, G>(&self, channels: C, groups: G) -> Result<()>
    where
        C: IntoIterator,
        C::Item: Into<String>,
        G: IntoIterator,
        G::Item: Into<String>,
    {
        self.command(Command::Unsubscribe {
            channels: channels.into_iter().map(Into::into).collect(),
            groups: groups.into_iter().map(Into::into).collect(),
        })
    }

    pub fn unsubscribe_all(&self) -> Result<()> {
        self.command(Command::UnsubscribeAll)
    }

    /// Re-handshake with the current set, e.g. after reconnection attempts
    /// were exhausted.
    pub fn reconnect(&self) -> Result<()> {
        self.command(Command::Reconnect)
    }

    /// Stop the long poll but keep the subscription set.
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.inner.manager.snapshot().channels
    }

    pub fn subscribed_groups(&self) -> Vec<String> {
        self.inner.manager.snapshot().groups
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.manager.snapshot().connection
    }

    /// Cursor the next long poll will use.
    pub fn cursor(&self) -> Cursor {
        self.inner.manager.snapshot().cursor
    }

    /// Presence state this client announces, per channel.
    pub fn presence_state(&self) -> &StateStore {
        self.inner.executor.state()
    }

    /// Stop background tasks, send leaves for the current set (unless
    /// suppressed), cancel outstanding requests and release every listener.
    /// Idempotent; the client is unusable afterwards.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("destroying client");
        self.inner.manager.shutdown(&self.inner.executor).await;
        self.inner.listeners.clear();
    }

    // -----------------------------------------------------------------------
    // Runtime-mutable settings
    // -----------------------------------------------------------------------

    pub fn uuid(&self) -> String {
        self.inner.executor.config().uuid()
    }

    pub fn set_uuid(&self, uuid: impl Into<String>) -> Result<()> {
        let uuid = uuid.into();
        if uuid.trim().is_empty() {
            return Err(Error::validation("uuid must not be empty"));
        }
        self.inner.executor.config().set_uuid(uuid);
        Ok(())
    }

    pub fn set_auth_key(&self, auth_key: Option<String>) {
        self.inner.executor.config().set_auth_key(auth_key);
    }

    /// Use a granted token as the auth credential of every request.
    pub fn set_token(&self, token: impl Into<String>) {
        self.set_auth_key(Some(token.into()));
    }

    /// Takes effect from the next long poll.
    pub fn set_filter_expression(&self, filter: Option<String>) {
        self.inner.executor.config().set_filter_expression(filter);
    }

    pub fn config(&self) -> &Config {
        self.inner.executor.config().get()
    }

    // -----------------------------------------------------------------------
    // Tokens
    // -----------------------------------------------------------------------

    pub fn parse_token(&self, token: &str) -> Result<Token> {
        parse_token(token)
    }

    /// Typed exact-name permissions carried by `token`.
    pub fn get_permissions(&self, token: &str) -> Result<PermissionsBody> {
        Ok(parse_token(token)?.permissions(token))
    }
}

/// Enqueues a subscribe command.
#[must_use = "subscriptions do nothing until executed"]
pub struct SubscribeBuilder<'a> {
    client: &'a Client,
    channels: Vec<String>,
    groups: Vec<String>,
    with_presence: bool,
    timetoken: Option<i64>,
    cancel: Option<CancellationToken>,
}

impl SubscribeBuilder<'_> {
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels.extend(channels.into_iter().map(Into::into));
        self
    }

    pub fn channel_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Also receive join, leave, timeout and state-change events.
    pub fn with_presence(mut self, with_presence: bool) -> Self {
        self.with_presence = with_presence;
        self
    }

    /// Catch up from `timetoken` instead of starting with a handshake.
    pub fn timetoken(mut self, timetoken: i64) -> Self {
        self.timetoken = Some(timetoken);
        self
    }

    /// Cancelling `token` aborts the long poll and emits a `Cancelled`
    /// status.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Validate and enqueue. Returns as soon as the command is queued.
    pub fn execute(self) -> Result<()> {
        if self.channels.is_empty() && self.groups.is_empty() {
            return Err(Error::validation("at least one channel or channel group is required"));
        }
        if self
            .channels
            .iter()
            .chain(&self.groups)
            .any(|name| name.trim().is_empty())
        {
            return Err(Error::validation("channel and group names must not be empty"));
        }
        if self.timetoken.is_some_and(|tt| tt < 0) {
            return Err(Error::validation("timetoken must not be negative"));
        }
        self.client.command(Command::Subscribe {
            channels: self.channels,
            groups: self.groups,
            with_presence: self.with_presence,
            timetoken: self.timetoken,
            cancel: self.cancel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::testing::NullTransport;

    fn client() -> Client {
        Client::with_transport(Config::new("pub", "sub", "me"), Arc::new(NullTransport)).unwrap()
    }

    #[test]
    fn requires_runtime() {
        let result = Client::with_transport(Config::new("pub", "sub", "me"), Arc::new(NullTransport));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = Client::with_transport(Config::new("pub", "", "me"), Arc::new(NullTransport));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn subscribe_validation() {
        let client = client();
        assert!(matches!(
            client.subscribe().execute(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            client.subscribe().channels([""]).execute(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            client.subscribe().channels(["a"]).timetoken(-1).execute(),
            Err(Error::Validation(_))
        ));
        client.destroy().await;
    }

    #[tokio::test]
    async fn runtime_settings() {
        let client = client();
        assert_eq!(client.uuid(), "me");
        client.set_uuid("other").unwrap();
        assert_eq!(client.uuid(), "other");
        assert!(client.set_uuid(" ").is_err());
        client.set_filter_expression(Some("a == 1".into()));
        client.set_token("tok");
        client.destroy().await;
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_final() {
        let client = client();
        let mut listener = client.add_listener();
        client.destroy().await;
        client.destroy().await;
        assert!(listener.next().await.is_none());
        assert!(matches!(client.unsubscribe_all(), Err(Error::Cancelled)));
        assert!(matches!(client.time().execute().await, Err(Error::Cancelled)));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }
}

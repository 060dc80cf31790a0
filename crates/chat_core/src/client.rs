use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::Result;
use shared::{
    domain::{ConnectionEventKind, GroupId, MessageType, WalletAddress},
    protocol::{CreateGroupRequest, GroupInfo},
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::ChatConfig,
    connection::{ConnectionManager, ConnectionState},
    directory::GroupDirectory,
    error::ChatError,
    identity::Identity,
    lock,
    message::{ChatMessage, GroupEvent},
    registry::{ListenerRegistry, Subscription},
    router::{DispatchOutcome, MessageRouter},
    transport::{SessionOptions, TransportProvider},
};

/// Chat client bound to one identity: one connection, one listener registry
/// and one dedup cache shared by every table the identity is watching.
pub struct ChatClient {
    identity: Identity,
    config: ChatConfig,
    registry: Arc<ListenerRegistry>,
    router: Arc<MessageRouter>,
    connection: Arc<ConnectionManager>,
    group_events: broadcast::Sender<GroupEvent>,
    lifetime: Mutex<CancellationToken>,
    activated: AtomicBool,
}

impl ChatClient {
    pub fn new(
        identity: Identity,
        provider: Arc<dyn TransportProvider>,
        config: ChatConfig,
    ) -> Arc<Self> {
        let config = config.normalized();
        let registry = ListenerRegistry::new();
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            config.dedup_capacity_per_group,
        ));
        let (group_events, _) = broadcast::channel(config.event_buffer);
        let connection = ConnectionManager::new(
            identity.clone(),
            provider,
            SessionOptions {
                reconnect_attempts: config.reconnect_attempts,
                event_buffer: config.event_buffer,
            },
            Arc::clone(&registry),
            Arc::clone(&router),
            group_events.clone(),
        );

        Arc::new(Self {
            identity,
            config,
            registry,
            router,
            connection,
            group_events,
            lifetime: Mutex::new(CancellationToken::new()),
            activated: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> &WalletAddress {
        self.identity.address()
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Registers `on_message` for messages of `group_id`. The first
    /// subscription of any kind opens the connection.
    pub fn subscribe_messages<F>(&self, group_id: impl Into<GroupId>, on_message: F) -> Subscription
    where
        F: Fn(&ChatMessage) -> Result<()> + Send + Sync + 'static,
    {
        let subscription = self
            .registry
            .add_message_listener(group_id.into(), Box::new(on_message));
        self.activate();
        subscription
    }

    /// Registers `on_event` for connection transitions of `kind`. Like
    /// message subscriptions, this opens the connection if it is not open.
    pub fn subscribe_connection<F>(&self, kind: ConnectionEventKind, on_event: F) -> Subscription
    where
        F: Fn(ConnectionEventKind) -> Result<()> + Send + Sync + 'static,
    {
        let subscription = self
            .registry
            .add_connection_listener(kind, Box::new(on_event));
        self.activate();
        subscription
    }

    pub fn subscribe_group_events(&self) -> broadcast::Receiver<GroupEvent> {
        self.group_events.subscribe()
    }

    pub fn remove_all_for_group(&self, group_id: &GroupId) -> usize {
        self.registry.remove_all_for_group(group_id)
    }

    pub fn message_listener_count(&self, group_id: &GroupId) -> usize {
        self.registry.message_listener_count(group_id)
    }

    pub fn listener_count(&self) -> usize {
        self.registry.total_listener_count()
    }

    fn activate(&self) {
        if self.activated.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let connection = Arc::clone(&self.connection);
                runtime.spawn(async move { connection.connect().await });
            }
            Err(_) => {
                self.activated.store(false, Ordering::Release);
                warn!(
                    address = %self.identity.address(),
                    "chat: subscribed outside a tokio runtime; call connect() explicitly"
                );
            }
        }
    }

    pub async fn connect(&self) {
        self.activated.store(true, Ordering::Release);
        self.connection.connect().await;
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.connection.last_error()
    }

    pub fn socket_initialized(&self) -> bool {
        self.connection.socket_initialized()
    }

    pub fn stream_initialized(&self) -> bool {
        self.connection.stream_initialized()
    }

    /// Routes a message through dedup and into the group's listeners, as if
    /// the provider had delivered it.
    pub fn dispatch(&self, message: &ChatMessage) -> DispatchOutcome {
        self.router.dispatch(message)
    }

    pub fn directory(&self) -> GroupDirectory<'_> {
        GroupDirectory::new(&self.connection, self.lifetime_token(), None)
    }

    /// Directory whose calls are also abandoned when `cancel` fires.
    pub fn directory_with_cancel(&self, cancel: CancellationToken) -> GroupDirectory<'_> {
        GroupDirectory::new(&self.connection, self.lifetime_token(), Some(cancel))
    }

    fn lifetime_token(&self) -> CancellationToken {
        lock(&self.lifetime).clone()
    }

    pub async fn create_group(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<GroupId, ChatError> {
        self.directory()
            .create_group(CreateGroupRequest::new(name, description))
            .await
    }

    pub async fn join_group(&self, group_id: &GroupId) -> bool {
        self.directory().join_group(group_id).await
    }

    pub async fn leave_group(&self, group_id: &GroupId) -> bool {
        self.directory().leave_group(group_id).await
    }

    pub async fn remove_member(&self, group_id: &GroupId, member: &WalletAddress) -> bool {
        self.directory().remove_member(group_id, member).await
    }

    pub async fn get_group_info(&self, group_id: &GroupId) -> Option<GroupInfo> {
        self.directory().get_group_info(group_id).await
    }

    pub async fn get_history(&self, group_id: &GroupId) -> Result<Vec<ChatMessage>, ChatError> {
        self.directory().get_history(group_id).await
    }

    pub async fn send_message(&self, group_id: &GroupId, content: &str) -> bool {
        self.directory().send_message(group_id, content).await
    }

    pub async fn send_typed_message(
        &self,
        group_id: &GroupId,
        content: &str,
        message_type: MessageType,
    ) -> bool {
        self.directory()
            .send_typed_message(group_id, content, message_type)
            .await
    }

    /// Returns the client to its pre-subscription state: pending directory
    /// calls are cancelled, every listener is removed, the connection is
    /// closed and the dedup cache is emptied. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let previous = std::mem::replace(&mut *lock(&self.lifetime), CancellationToken::new());
        previous.cancel();

        let removed = self.registry.clear();
        self.connection.disconnect().await;
        self.router.clear_cache();
        self.activated.store(false, Ordering::Release);

        info!(
            address = %self.identity.address(),
            removed_listeners = removed,
            "chat: client cleaned up"
        );
    }
}

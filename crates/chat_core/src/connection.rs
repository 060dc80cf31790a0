use std::sync::{Arc, Mutex, Weak};

use shared::domain::ConnectionEventKind;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::ChatError,
    identity::Identity,
    lock,
    message::{parse_inbound, GroupEvent, InboundEvent},
    registry::ListenerRegistry,
    router::MessageRouter,
    transport::{SessionOptions, TransportEvent, TransportProvider, TransportSession},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventSource {
    Socket,
    Stream,
}

struct ConnectionInner {
    state: ConnectionState,
    session: Option<Arc<dyn TransportSession>>,
    socket_initialized: bool,
    stream_initialized: bool,
    pump: Option<JoinHandle<()>>,
    last_error: Option<String>,
    /// Bumped whenever a pump is started or torn down, so a stale pump that
    /// is still mid-event cannot touch the current state.
    generation: u64,
    /// Bumped by every `disconnect()`. A session initialized across a bump
    /// belongs to a torn-down client and is closed instead of stored.
    teardowns: u64,
}

pub struct ConnectionManager {
    identity: Identity,
    provider: Arc<dyn TransportProvider>,
    options: SessionOptions,
    registry: Arc<ListenerRegistry>,
    router: Arc<MessageRouter>,
    group_events: broadcast::Sender<GroupEvent>,
    inner: Mutex<ConnectionInner>,
    session_init: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        identity: Identity,
        provider: Arc<dyn TransportProvider>,
        options: SessionOptions,
        registry: Arc<ListenerRegistry>,
        router: Arc<MessageRouter>,
        group_events: broadcast::Sender<GroupEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            provider,
            options,
            registry,
            router,
            group_events,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Uninitialized,
                session: None,
                socket_initialized: false,
                stream_initialized: false,
                pump: None,
                last_error: None,
                generation: 0,
                teardowns: 0,
            }),
            session_init: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner).last_error.clone()
    }

    pub fn socket_initialized(&self) -> bool {
        lock(&self.inner).socket_initialized
    }

    pub fn stream_initialized(&self) -> bool {
        lock(&self.inner).stream_initialized
    }

    /// Returns the provider session, initializing it on first use.
    pub(crate) async fn session(&self) -> Result<Arc<dyn TransportSession>, ChatError> {
        let _init = self.session_init.lock().await;
        let teardowns = {
            let inner = lock(&self.inner);
            if let Some(session) = inner.session.clone() {
                return Ok(session);
            }
            inner.teardowns
        };

        let session = self
            .provider
            .initialize(&self.identity, self.options)
            .await
            .map_err(|err| ChatError::Connection(format!("{err:#}")))?;

        let superseded = {
            let mut inner = lock(&self.inner);
            if inner.teardowns == teardowns {
                inner.session = Some(Arc::clone(&session));
                false
            } else {
                true
            }
        };
        if superseded {
            debug!(address = %self.identity.address(), "chat: closing session opened across a teardown");
            if let Err(err) = session.close().await {
                warn!("chat: failed to close superseded session: {err:#}");
            }
            return Err(ChatError::Connection(
                "session superseded by disconnect".to_string(),
            ));
        }

        info!(address = %self.identity.address(), "chat: provider session initialized");
        Ok(session)
    }

    /// Opens the connection. A no-op while connecting or connected.
    ///
    /// Failures are not returned: they leave the connection `Disconnected`,
    /// are recorded in [`ConnectionManager::last_error`] and are announced to
    /// `Disconnected` listeners.
    pub async fn connect(self: &Arc<Self>) {
        let (generation, stale) = {
            let mut inner = lock(&self.inner);
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                debug!(state = ?inner.state, "chat: connect ignored");
                return;
            }
            inner.state = ConnectionState::Connecting;
            inner.generation += 1;
            // A session whose sockets already ran has given up reconnecting;
            // replace it rather than reattach.
            let stale = if inner.socket_initialized {
                inner.socket_initialized = false;
                inner.stream_initialized = false;
                if let Some(pump) = inner.pump.take() {
                    pump.abort();
                }
                inner.session.take()
            } else {
                None
            };
            (inner.generation, stale)
        };

        info!(address = %self.identity.address(), "chat: connecting");
        if let Some(stale) = stale {
            if let Err(err) = stale.close().await {
                warn!("chat: failed to close stale session: {err:#}");
            }
        }

        let session = match self.session().await {
            Ok(session) => session,
            Err(err) => {
                self.fail(generation, err);
                return;
            }
        };

        let socket = session.socket_events();
        let stream = session.stream_events();
        let has_stream = stream.is_some();

        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            debug!("chat: connect superseded before attaching event sources");
            return;
        }
        inner.pump = Some(tokio::spawn(run_event_pump(
            Arc::downgrade(self),
            generation,
            socket,
            stream,
        )));
        inner.socket_initialized = true;
        inner.stream_initialized = has_stream;
    }

    /// Tears down the session. Listeners are kept so a later `connect()`
    /// resumes delivery to them.
    pub async fn disconnect(&self) {
        let (session, was_live) = {
            let mut inner = lock(&self.inner);
            inner.teardowns += 1;
            if inner.state == ConnectionState::Uninitialized && inner.session.is_none() {
                return;
            }
            inner.generation += 1;
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            let was_live = matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected
            );
            inner.state = ConnectionState::Disconnected;
            inner.socket_initialized = false;
            inner.stream_initialized = false;
            (inner.session.take(), was_live)
        };

        if let Some(session) = session {
            if let Err(err) = session.close().await {
                warn!("chat: provider session close failed: {err:#}");
            }
        }

        if was_live {
            info!(address = %self.identity.address(), "chat: disconnected");
            self.registry
                .notify_connection(ConnectionEventKind::Disconnected);
        }
    }

    fn fail(&self, generation: u64, err: ChatError) {
        {
            let mut inner = lock(&self.inner);
            if inner.generation != generation {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.last_error = Some(err.to_string());
        }
        warn!(address = %self.identity.address(), "chat: {err}");
        self.registry
            .notify_connection(ConnectionEventKind::Disconnected);
    }

    /// Applies a connection transition for the pump of `generation`.
    /// Returns `None` when the pump is stale, otherwise whether the state
    /// actually changed.
    fn transition(
        &self,
        generation: u64,
        next: ConnectionState,
        last_error: Option<String>,
    ) -> Option<bool> {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return None;
        }
        let changed = inner.state != next;
        inner.state = next;
        if next == ConnectionState::Connected {
            inner.last_error = None;
        } else if last_error.is_some() {
            inner.last_error = last_error;
        }
        Some(changed)
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.inner).generation == generation
    }

    /// Handles one event. Returns false once the pump should stop.
    fn handle_event(&self, generation: u64, source: EventSource, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Connected if source == EventSource::Socket => {
                match self.transition(generation, ConnectionState::Connected, None) {
                    None => return false,
                    Some(true) => {
                        info!(address = %self.identity.address(), "chat: connected");
                        self.registry
                            .notify_connection(ConnectionEventKind::Connected);
                    }
                    Some(false) => {}
                }
            }
            TransportEvent::Disconnected { reason } if source == EventSource::Socket => {
                match self.transition(generation, ConnectionState::Disconnected, reason.clone()) {
                    None => return false,
                    Some(true) => {
                        warn!(
                            address = %self.identity.address(),
                            reason = reason.as_deref().unwrap_or("unspecified"),
                            "chat: provider reported disconnect"
                        );
                        self.registry
                            .notify_connection(ConnectionEventKind::Disconnected);
                    }
                    Some(false) => {}
                }
            }
            TransportEvent::Connected | TransportEvent::Disconnected { .. } => {
                debug!(?source, "chat: ignoring stream connection event");
            }
            TransportEvent::Payload(value) => {
                if !self.is_current(generation) {
                    return false;
                }
                match parse_inbound(value) {
                    Ok(InboundEvent::Message(message)) => {
                        self.router.dispatch(&message);
                    }
                    Ok(InboundEvent::Group(event)) => {
                        let group_id = event.group_id.clone();
                        debug!(group_id = %group_id, kind = ?event.kind, "chat: group event");
                        if self.group_events.send(event).is_err() {
                            debug!(group_id = %group_id, "chat: group event has no subscribers");
                        }
                    }
                    Err(err) => {
                        warn!(?source, "chat: dropping payload: {err}");
                    }
                }
            }
        }
        true
    }

    fn sources_closed(&self, generation: u64) {
        let changed = self.transition(
            generation,
            ConnectionState::Disconnected,
            Some("provider event sources closed".to_string()),
        );
        if changed == Some(true) {
            warn!(address = %self.identity.address(), "chat: provider event sources closed");
            self.registry
                .notify_connection(ConnectionEventKind::Disconnected);
        }
    }
}

async fn recv_from(
    source: &mut Option<broadcast::Receiver<TransportEvent>>,
) -> Result<TransportEvent, RecvError> {
    match source {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Single consumer for both event sources, so per-group order matches the
/// order events were received.
async fn run_event_pump(
    manager: Weak<ConnectionManager>,
    generation: u64,
    socket: broadcast::Receiver<TransportEvent>,
    stream: Option<broadcast::Receiver<TransportEvent>>,
) {
    let mut socket = Some(socket);
    let mut stream = stream;

    while socket.is_some() || stream.is_some() {
        let (source, received) = tokio::select! {
            received = recv_from(&mut socket) => (EventSource::Socket, received),
            received = recv_from(&mut stream) => (EventSource::Stream, received),
        };

        let Some(strong) = manager.upgrade() else {
            return;
        };

        match received {
            Ok(event) => {
                if !strong.handle_event(generation, source, event) {
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(?source, skipped, "chat: event pump lagged behind provider");
            }
            Err(RecvError::Closed) => {
                debug!(?source, "chat: provider event source closed");
                match source {
                    EventSource::Socket => socket = None,
                    EventSource::Stream => stream = None,
                }
            }
        }
    }

    if let Some(strong) = manager.upgrade() {
        strong.sources_closed(generation);
    }
}

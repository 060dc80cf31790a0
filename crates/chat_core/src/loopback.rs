//! In-process transport provider.
//!
//! Keeps groups and history in memory and fans every sent message back out to
//! the connected sessions of the group's members, the sender included. Used
//! by the `table_chat` binary and by tests that need a provider with real
//! round-trip behavior.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{GroupEventKind, GroupId, WalletAddress},
    error::{ProviderError, ProviderErrorCode},
    protocol::{
        CreateGroupRequest, GroupEventPayload, GroupInfo, InboundPayload, MessagePayload,
        OutboundMessage,
    },
};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::{
    identity::{Identity, Signer},
    lock,
    transport::{SessionOptions, TransportEvent, TransportProvider, TransportSession},
};

const SIGNING_CHALLENGE_PREFIX: &[u8] = b"table-chat/loopback-session/v1:";

/// Signer that "signs" by reversing the payload. Only meaningful against the
/// loopback provider.
pub struct LoopbackSigner;

#[async_trait]
impl Signer for LoopbackSigner {
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.iter().rev().copied().collect())
    }
}

struct LoopbackGroup {
    info: GroupInfo,
    history: Vec<serde_json::Value>,
}

#[derive(Default)]
struct Backend {
    groups: HashMap<GroupId, LoopbackGroup>,
    sessions: Vec<Weak<LoopbackSession>>,
}

impl Backend {
    fn live_sessions(&mut self) -> Vec<Arc<LoopbackSession>> {
        self.sessions.retain(|session| session.strong_count() > 0);
        self.sessions.iter().filter_map(Weak::upgrade).collect()
    }

    fn member_sessions(&mut self, group_id: &GroupId) -> Vec<Arc<LoopbackSession>> {
        let members = match self.groups.get(group_id) {
            Some(group) => group.info.members.clone(),
            None => return Vec::new(),
        };
        self.live_sessions()
            .into_iter()
            .filter(|session| members.contains(&session.address))
            .collect()
    }

    fn group(&self, group_id: &GroupId) -> Result<&LoopbackGroup> {
        self.groups.get(group_id).ok_or_else(|| {
            ProviderError::not_found(format!("group {group_id} does not exist")).into()
        })
    }

    fn group_mut(&mut self, group_id: &GroupId) -> Result<&mut LoopbackGroup> {
        self.groups.get_mut(group_id).ok_or_else(|| {
            ProviderError::not_found(format!("group {group_id} does not exist")).into()
        })
    }
}

pub struct LoopbackProvider {
    backend: Arc<Mutex<Backend>>,
    initializations: AtomicUsize,
    mirror_to_stream: bool,
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(Mutex::new(Backend::default())),
            initializations: AtomicUsize::new(0),
            mirror_to_stream: false,
        }
    }

    /// Sessions also expose a stream source that re-delivers every payload
    /// already sent on the socket.
    pub fn with_stream_mirroring(mut self) -> Self {
        self.mirror_to_stream = true;
        self
    }

    pub fn initialization_count(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    pub fn live_session_count(&self) -> usize {
        lock(&self.backend)
            .live_sessions()
            .iter()
            .filter(|session| !session.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Drops every connected socket. Each session then retries; it recovers
    /// when `failed_attempts` is below its reconnect budget and otherwise
    /// stays disconnected for good.
    pub fn simulate_outage(&self, failed_attempts: u32) {
        let sessions = lock(&self.backend).live_sessions();
        for session in sessions {
            session.drop_socket(failed_attempts);
        }
    }

    /// Delivers a raw payload to every connected member of `group_id`
    /// without recording it in history.
    pub fn inject(&self, group_id: &GroupId, payload: serde_json::Value) {
        let sessions = lock(&self.backend).member_sessions(group_id);
        for session in sessions {
            session.deliver(&payload);
        }
    }

    /// Delivers a raw payload to every connected session.
    pub fn broadcast_raw(&self, payload: serde_json::Value) {
        let sessions = lock(&self.backend).live_sessions();
        for session in sessions {
            session.deliver(&payload);
        }
    }
}

#[async_trait]
impl TransportProvider for LoopbackProvider {
    async fn initialize(
        &self,
        identity: &Identity,
        options: SessionOptions,
    ) -> Result<Arc<dyn TransportSession>> {
        let mut challenge = SIGNING_CHALLENGE_PREFIX.to_vec();
        challenge.extend_from_slice(identity.address().as_str().as_bytes());
        identity
            .signer()
            .sign(&challenge)
            .await
            .context("loopback: signer rejected the session challenge")?;

        let capacity = options.event_buffer.max(1);
        let (socket, _) = broadcast::channel(capacity);
        let stream = self
            .mirror_to_stream
            .then(|| broadcast::channel(capacity).0);
        let session = Arc::new(LoopbackSession {
            address: identity.address().clone(),
            backend: Arc::clone(&self.backend),
            socket,
            stream,
            reconnect_attempts: options.reconnect_attempts,
            connected: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        lock(&self.backend).sessions.push(Arc::downgrade(&session));
        self.initializations.fetch_add(1, Ordering::SeqCst);
        debug!(address = %session.address, "loopback: session initialized");
        Ok(session)
    }
}

pub struct LoopbackSession {
    address: WalletAddress,
    backend: Arc<Mutex<Backend>>,
    socket: broadcast::Sender<TransportEvent>,
    stream: Option<broadcast::Sender<TransportEvent>>,
    reconnect_attempts: u32,
    connected: AtomicBool,
    exhausted: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackSession {
    fn deliver(&self, payload: &serde_json::Value) {
        if self.closed.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.socket.send(TransportEvent::Payload(payload.clone()));
        if let Some(stream) = &self.stream {
            let _ = stream.send(TransportEvent::Payload(payload.clone()));
        }
    }

    fn drop_socket(&self, failed_attempts: u32) {
        if self.closed.load(Ordering::SeqCst) || !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.socket.send(TransportEvent::Disconnected {
            reason: Some("loopback outage".to_string()),
        });

        if failed_attempts < self.reconnect_attempts {
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.socket.send(TransportEvent::Connected);
        } else {
            self.exhausted.store(true, Ordering::SeqCst);
            let _ = self.socket.send(TransportEvent::Disconnected {
                reason: Some(format!(
                    "gave up after {} reconnect attempts",
                    self.reconnect_attempts
                )),
            });
        }
    }

    fn ensure_member(&self, group: &LoopbackGroup) -> Result<()> {
        if group.info.members.contains(&self.address) {
            Ok(())
        } else {
            Err(ProviderError::new(
                ProviderErrorCode::NotMember,
                format!("{} is not a member of {}", self.address, group.info.group_id),
            )
            .into())
        }
    }

    fn notify_group(&self, group_id: &GroupId, kind: GroupEventKind, member: &WalletAddress) {
        let payload = serde_json::to_value(InboundPayload::GroupEvent(GroupEventPayload {
            group_id: group_id.to_string(),
            kind,
            member: Some(member.to_string()),
        }));
        let Ok(payload) = payload else {
            return;
        };
        let sessions = lock(&self.backend).member_sessions(group_id);
        for session in sessions {
            session.deliver(&payload);
        }
    }
}

#[async_trait]
impl TransportSession for LoopbackSession {
    async fn create_group(&self, request: &CreateGroupRequest) -> Result<GroupId> {
        let group_id = GroupId(Uuid::new_v4().to_string());

        let mut members = vec![self.address.clone()];
        for member in &request.members {
            if !members.contains(member) {
                members.push(member.clone());
            }
        }
        let mut admins = vec![self.address.clone()];
        for admin in &request.admins {
            if !admins.contains(admin) {
                admins.push(admin.clone());
            }
        }

        let info = GroupInfo {
            group_id: group_id.clone(),
            name: request.name.clone(),
            description: request.description.clone(),
            members,
            admins,
            is_public: request.is_public,
            created_at: Some(Utc::now()),
        };
        lock(&self.backend).groups.insert(
            group_id.clone(),
            LoopbackGroup {
                info,
                history: Vec::new(),
            },
        );
        Ok(group_id)
    }

    async fn group_info(&self, group_id: &GroupId) -> Result<Option<GroupInfo>> {
        Ok(lock(&self.backend)
            .groups
            .get(group_id)
            .map(|group| group.info.clone()))
    }

    async fn join_group(&self, group_id: &GroupId) -> Result<()> {
        {
            let mut backend = lock(&self.backend);
            let group = backend.group_mut(group_id)?;
            if group.info.members.contains(&self.address) {
                return Err(ProviderError::new(
                    ProviderErrorCode::AlreadyMember,
                    format!("{} already belongs to {group_id}", self.address),
                )
                .into());
            }
            if !group.info.is_public {
                return Err(ProviderError::unauthorized(format!(
                    "group {group_id} is private"
                ))
                .into());
            }
            group.info.members.push(self.address.clone());
        }
        self.notify_group(group_id, GroupEventKind::MemberJoined, &self.address);
        Ok(())
    }

    async fn leave_group(&self, group_id: &GroupId) -> Result<()> {
        {
            let backend = lock(&self.backend);
            self.ensure_member(backend.group(group_id)?)?;
        }
        // Announce before removal so the leaver sees it too.
        self.notify_group(group_id, GroupEventKind::MemberLeft, &self.address);

        let mut backend = lock(&self.backend);
        let group = backend.group_mut(group_id)?;
        group.info.members.retain(|member| member != &self.address);
        group.info.admins.retain(|admin| admin != &self.address);
        Ok(())
    }

    async fn remove_member(&self, group_id: &GroupId, member: &WalletAddress) -> Result<()> {
        {
            let backend = lock(&self.backend);
            let group = backend.group(group_id)?;
            if !group.info.admins.contains(&self.address) {
                return Err(ProviderError::unauthorized(format!(
                    "{} is not an admin of {group_id}",
                    self.address
                ))
                .into());
            }
            if !group.info.members.contains(member) {
                return Err(ProviderError::new(
                    ProviderErrorCode::NotMember,
                    format!("{member} is not a member of {group_id}"),
                )
                .into());
            }
        }
        self.notify_group(group_id, GroupEventKind::MemberRemoved, member);

        let mut backend = lock(&self.backend);
        let group = backend.group_mut(group_id)?;
        group.info.members.retain(|existing| existing != member);
        group.info.admins.retain(|existing| existing != member);
        Ok(())
    }

    async fn send(&self, group_id: &GroupId, message: &OutboundMessage) -> Result<()> {
        let payload = serde_json::to_value(InboundPayload::ChatMessage(MessagePayload {
            group_id: group_id.to_string(),
            message_id: Some(Uuid::new_v4().to_string()),
            from: self.address.to_string(),
            content: message.content.clone(),
            timestamp: Some(Utc::now().timestamp_millis()),
            message_type: message.message_type.clone(),
        }))
        .context("loopback: failed to encode message")?;

        let sessions = {
            let mut backend = lock(&self.backend);
            let group = backend.group(group_id)?;
            self.ensure_member(group)?;
            backend.group_mut(group_id)?.history.push(payload.clone());
            backend.member_sessions(group_id)
        };

        for session in sessions {
            session.deliver(&payload);
        }
        Ok(())
    }

    async fn history(&self, group_id: &GroupId) -> Result<Vec<serde_json::Value>> {
        let backend = lock(&self.backend);
        let group = backend.group(group_id)?;
        if !group.info.is_public {
            self.ensure_member(group)?;
        }
        Ok(group.history.clone())
    }

    fn socket_events(&self) -> broadcast::Receiver<TransportEvent> {
        let receiver = self.socket.subscribe();
        let usable =
            !self.closed.load(Ordering::SeqCst) && !self.exhausted.load(Ordering::SeqCst);
        if usable && !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.socket.send(TransportEvent::Connected);
        }
        receiver
    }

    fn stream_events(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        self.stream.as_ref().map(broadcast::Sender::subscribe)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let this: *const LoopbackSession = self;
        lock(&self.backend)
            .sessions
            .retain(|session| !std::ptr::eq(session.as_ptr(), this));
        debug!(address = %self.address, "loopback: session closed");
        Ok(())
    }
}

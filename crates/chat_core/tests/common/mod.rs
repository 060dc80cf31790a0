#![allow(dead_code)]

use std::{
    future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chat_core::{
    identity::{Identity, Signer},
    loopback::LoopbackSigner,
    transport::{SessionOptions, TransportEvent, TransportProvider, TransportSession},
    ChatMessage, GroupId, WalletAddress,
};
use shared::protocol::{CreateGroupRequest, GroupInfo, OutboundMessage};
use tokio::sync::broadcast;

pub fn identity(address: &str) -> Identity {
    Identity::new(address, Arc::new(LoopbackSigner))
}

/// Polls `condition` for up to two seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Gives spawned pump tasks a chance to deliver anything still queued.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn collector() -> (
    Arc<Mutex<Vec<ChatMessage>>>,
    impl Fn(&ChatMessage) -> Result<()> + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |message: &ChatMessage| {
        sink.lock().expect("collector lock").push(message.clone());
        Ok(())
    })
}

pub fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let bump = Arc::clone(&count);
    (count, move || {
        bump.fetch_add(1, Ordering::SeqCst);
    })
}

/// Signs like [`LoopbackSigner`], after a delay.
pub struct SlowSigner(pub Duration);

#[async_trait]
impl Signer for SlowSigner {
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        tokio::time::sleep(self.0).await;
        LoopbackSigner.sign(payload).await
    }
}

pub struct RejectingSigner;

#[async_trait]
impl Signer for RejectingSigner {
    async fn sign(&self, _payload: &[u8]) -> Result<Vec<u8>> {
        bail!("wallet locked")
    }
}

/// Provider whose sessions connect but never answer directory calls, and
/// whose `send` succeeds without ever delivering anything back.
#[derive(Default)]
pub struct StallingProvider {
    pub started: Arc<AtomicUsize>,
    pub sent: Arc<Mutex<Vec<(GroupId, OutboundMessage)>>>,
}

impl StallingProvider {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportProvider for StallingProvider {
    async fn initialize(
        &self,
        _identity: &Identity,
        options: SessionOptions,
    ) -> Result<Arc<dyn TransportSession>> {
        let (socket, _) = broadcast::channel(options.event_buffer.max(1));
        Ok(Arc::new(StallingSession {
            started: Arc::clone(&self.started),
            sent: Arc::clone(&self.sent),
            socket,
        }))
    }
}

struct StallingSession {
    started: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<(GroupId, OutboundMessage)>>>,
    socket: broadcast::Sender<TransportEvent>,
}

impl StallingSession {
    async fn stall<T>(&self) -> Result<T> {
        self.started.fetch_add(1, Ordering::SeqCst);
        future::pending().await
    }
}

#[async_trait]
impl TransportSession for StallingSession {
    async fn create_group(&self, _request: &CreateGroupRequest) -> Result<GroupId> {
        self.stall().await
    }

    async fn group_info(&self, _group_id: &GroupId) -> Result<Option<GroupInfo>> {
        self.stall().await
    }

    async fn join_group(&self, _group_id: &GroupId) -> Result<()> {
        self.stall().await
    }

    async fn leave_group(&self, _group_id: &GroupId) -> Result<()> {
        self.stall().await
    }

    async fn remove_member(&self, _group_id: &GroupId, _member: &WalletAddress) -> Result<()> {
        self.stall().await
    }

    async fn send(&self, group_id: &GroupId, message: &OutboundMessage) -> Result<()> {
        self.sent
            .lock()
            .expect("sent lock")
            .push((group_id.clone(), message.clone()));
        Ok(())
    }

    async fn history(&self, _group_id: &GroupId) -> Result<Vec<serde_json::Value>> {
        self.stall().await
    }

    fn socket_events(&self) -> broadcast::Receiver<TransportEvent> {
        let receiver = self.socket.subscribe();
        let _ = self.socket.send(TransportEvent::Connected);
        receiver
    }

    fn stream_events(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        None
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedSources {
    socket: Mutex<Option<broadcast::Sender<TransportEvent>>>,
    stream: Mutex<Option<broadcast::Sender<TransportEvent>>>,
}

/// Provider driven by the test: events are pushed onto the current
/// session's socket or stream by hand, and both sources can be closed.
#[derive(Default)]
pub struct ScriptedProvider {
    with_stream: bool,
    sources: Arc<ScriptedSources>,
}

impl ScriptedProvider {
    pub fn with_stream() -> Self {
        Self {
            with_stream: true,
            ..Self::default()
        }
    }

    pub fn push_socket(&self, event: TransportEvent) {
        if let Some(socket) = self.sources.socket.lock().expect("socket lock").as_ref() {
            let _ = socket.send(event);
        }
    }

    pub fn push_stream(&self, event: TransportEvent) {
        if let Some(stream) = self.sources.stream.lock().expect("stream lock").as_ref() {
            let _ = stream.send(event);
        }
    }

    /// Drops every sender, so subscribed receivers observe `Closed`.
    pub fn close_sources(&self) {
        self.sources.socket.lock().expect("socket lock").take();
        self.sources.stream.lock().expect("stream lock").take();
    }
}

#[async_trait]
impl TransportProvider for ScriptedProvider {
    async fn initialize(
        &self,
        _identity: &Identity,
        options: SessionOptions,
    ) -> Result<Arc<dyn TransportSession>> {
        let capacity = options.event_buffer.max(1);
        *self.sources.socket.lock().expect("socket lock") = Some(broadcast::channel(capacity).0);
        *self.sources.stream.lock().expect("stream lock") =
            self.with_stream.then(|| broadcast::channel(capacity).0);
        Ok(Arc::new(ScriptedSession {
            sources: Arc::clone(&self.sources),
        }))
    }
}

struct ScriptedSession {
    sources: Arc<ScriptedSources>,
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn create_group(&self, _request: &CreateGroupRequest) -> Result<GroupId> {
        bail!("scripted session has no directory")
    }

    async fn group_info(&self, _group_id: &GroupId) -> Result<Option<GroupInfo>> {
        bail!("scripted session has no directory")
    }

    async fn join_group(&self, _group_id: &GroupId) -> Result<()> {
        bail!("scripted session has no directory")
    }

    async fn leave_group(&self, _group_id: &GroupId) -> Result<()> {
        bail!("scripted session has no directory")
    }

    async fn remove_member(&self, _group_id: &GroupId, _member: &WalletAddress) -> Result<()> {
        bail!("scripted session has no directory")
    }

    async fn send(&self, _group_id: &GroupId, _message: &OutboundMessage) -> Result<()> {
        Ok(())
    }

    async fn history(&self, _group_id: &GroupId) -> Result<Vec<serde_json::Value>> {
        Ok(Vec::new())
    }

    fn socket_events(&self) -> broadcast::Receiver<TransportEvent> {
        match self.sources.socket.lock().expect("socket lock").as_ref() {
            Some(socket) => {
                let receiver = socket.subscribe();
                let _ = socket.send(TransportEvent::Connected);
                receiver
            }
            None => broadcast::channel(1).1,
        }
    }

    fn stream_events(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        self.sources
            .stream
            .lock()
            .expect("stream lock")
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Wire payload of a chat message, as a provider would deliver it.
pub fn message_payload(group: &str, id: &str, content: &str) -> TransportEvent {
    TransportEvent::Payload(serde_json::json!({
        "event": "chat_message",
        "groupId": group,
        "messageId": id,
        "from": "0xdealer",
        "content": content,
    }))
}

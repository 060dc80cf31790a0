use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{GroupId, WalletAddress},
    protocol::{CreateGroupRequest, GroupInfo, OutboundMessage},
};
use tokio::sync::broadcast;

use crate::identity::Identity;

/// Raw event emitted by a provider event source.
///
/// Payloads stay untyped here; the connection manager parses and validates
/// them before anything reaches the router.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: Option<String> },
    Payload(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub reconnect_attempts: u32,
    pub event_buffer: usize,
}

#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn initialize(
        &self,
        identity: &Identity,
        options: SessionOptions,
    ) -> Result<Arc<dyn TransportSession>>;
}

/// One authenticated session with the provider.
///
/// `socket_events` is the authoritative source for connection state.
/// `stream_events` is an optional second source that may deliver the same
/// messages again; the router deduplicates across both.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn create_group(&self, request: &CreateGroupRequest) -> Result<GroupId>;
    async fn group_info(&self, group_id: &GroupId) -> Result<Option<GroupInfo>>;
    async fn join_group(&self, group_id: &GroupId) -> Result<()>;
    async fn leave_group(&self, group_id: &GroupId) -> Result<()>;
    async fn remove_member(&self, group_id: &GroupId, member: &WalletAddress) -> Result<()>;
    async fn send(&self, group_id: &GroupId, message: &OutboundMessage) -> Result<()>;
    async fn history(&self, group_id: &GroupId) -> Result<Vec<serde_json::Value>>;
    fn socket_events(&self) -> broadcast::Receiver<TransportEvent>;
    fn stream_events(&self) -> Option<broadcast::Receiver<TransportEvent>>;
    async fn close(&self) -> Result<()>;
}

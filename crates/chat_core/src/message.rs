use chrono::{DateTime, Utc};
use shared::{
    domain::{GroupEventKind, GroupId, MessageId, MessageType, WalletAddress},
    protocol::{GroupEventPayload, InboundPayload, MessagePayload},
};

use crate::error::ChatError;

/// A validated chat message routed to a table's listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub group_id: GroupId,
    pub message_id: Option<MessageId>,
    pub sender: WalletAddress,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
}

impl ChatMessage {
    pub fn new(
        group_id: impl Into<GroupId>,
        sender: impl Into<WalletAddress>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            message_id: None,
            sender: sender.into(),
            content: content.into(),
            timestamp: Utc::now(),
            message_type: MessageType::Text,
        }
    }

    pub fn with_id(mut self, message_id: impl Into<MessageId>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    /// Id used for deduplication. Absent or blank ids are never deduplicated.
    pub fn dedup_key(&self) -> Option<&MessageId> {
        self.message_id.as_ref().filter(|id| !id.is_empty())
    }
}

impl TryFrom<MessagePayload> for ChatMessage {
    type Error = ChatError;

    fn try_from(payload: MessagePayload) -> Result<Self, Self::Error> {
        if payload.group_id.trim().is_empty() {
            return Err(ChatError::InvalidPayload(
                "message payload is missing a group id".to_string(),
            ));
        }
        if payload.from.trim().is_empty() {
            return Err(ChatError::InvalidPayload(format!(
                "message payload for group {} is missing a sender",
                payload.group_id
            )));
        }

        let timestamp = match payload.timestamp {
            Some(millis) => DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                ChatError::InvalidPayload(format!("timestamp out of range: {millis}"))
            })?,
            None => Utc::now(),
        };

        Ok(Self {
            group_id: GroupId(payload.group_id),
            message_id: payload.message_id.map(MessageId),
            sender: WalletAddress::new(payload.from),
            content: payload.content,
            timestamp,
            message_type: payload.message_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEvent {
    pub group_id: GroupId,
    pub kind: GroupEventKind,
    pub member: Option<WalletAddress>,
}

impl TryFrom<GroupEventPayload> for GroupEvent {
    type Error = ChatError;

    fn try_from(payload: GroupEventPayload) -> Result<Self, Self::Error> {
        if payload.group_id.trim().is_empty() {
            return Err(ChatError::InvalidPayload(
                "group event payload is missing a group id".to_string(),
            ));
        }
        Ok(Self {
            group_id: GroupId(payload.group_id),
            kind: payload.kind,
            member: payload
                .member
                .filter(|member| !member.trim().is_empty())
                .map(WalletAddress::new),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(ChatMessage),
    Group(GroupEvent),
}

pub fn parse_inbound(value: serde_json::Value) -> Result<InboundEvent, ChatError> {
    let payload: InboundPayload = serde_json::from_value(value)
        .map_err(|err| ChatError::InvalidPayload(err.to_string()))?;
    match payload {
        InboundPayload::ChatMessage(message) => message.try_into().map(InboundEvent::Message),
        InboundPayload::GroupEvent(event) => event.try_into().map(InboundEvent::Group),
    }
}

pub fn parse_history_entry(value: serde_json::Value) -> Result<ChatMessage, ChatError> {
    let payload: MessagePayload = serde_json::from_value(value)
        .map_err(|err| ChatError::InvalidPayload(err.to_string()))?;
    payload.try_into()
}

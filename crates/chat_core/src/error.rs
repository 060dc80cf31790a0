use std::fmt;

use shared::domain::GroupId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOperation {
    Join,
    Leave,
    RemoveMember,
    Info,
    History,
}

impl fmt::Display for GroupOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::RemoveMember => "remove member",
            Self::Info => "group info",
            Self::History => "history",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("group creation failed: {0}")]
    GroupCreationFailed(String),
    #[error("{operation} failed for group {group_id}: {reason}")]
    GroupOperation {
        operation: GroupOperation,
        group_id: GroupId,
        reason: String,
    },
    #[error("send to group {group_id} failed: {reason}")]
    Send { group_id: GroupId, reason: String },
    #[error("listener on group {group_id} failed for message {message_id}: {reason}")]
    Listener {
        group_id: GroupId,
        message_id: String,
        reason: String,
    },
    #[error("invalid provider payload: {0}")]
    InvalidPayload(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl ChatError {
    pub(crate) fn group_operation(
        operation: GroupOperation,
        group_id: &GroupId,
        source: anyhow::Error,
    ) -> Self {
        Self::GroupOperation {
            operation,
            group_id: group_id.clone(),
            reason: format!("{source:#}"),
        }
    }
}

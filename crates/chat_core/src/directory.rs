use std::future::Future;

use shared::{
    domain::{GroupId, MessageType, WalletAddress},
    protocol::{CreateGroupRequest, GroupInfo, OutboundMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::ConnectionManager,
    error::{ChatError, GroupOperation},
    message::{parse_history_entry, ChatMessage},
};

/// Group operations delegated to the provider session.
///
/// Every call is abandoned when the owning client is cleaned up, and also
/// when the optional caller token fires. Cancellation never touches the
/// connection state.
pub struct GroupDirectory<'a> {
    connection: &'a ConnectionManager,
    lifetime: CancellationToken,
    cancel: Option<CancellationToken>,
}

impl<'a> GroupDirectory<'a> {
    pub(crate) fn new(
        connection: &'a ConnectionManager,
        lifetime: CancellationToken,
        cancel: Option<CancellationToken>,
    ) -> Self {
        Self {
            connection,
            lifetime,
            cancel,
        }
    }

    async fn cancellable<T>(
        &self,
        work: impl Future<Output = Result<T, ChatError>>,
    ) -> Result<T, ChatError> {
        let caller = self.cancel.clone().unwrap_or_default();
        tokio::select! {
            biased;
            _ = self.lifetime.cancelled() => Err(ChatError::Cancelled),
            _ = caller.cancelled() => Err(ChatError::Cancelled),
            result = work => result,
        }
    }

    pub async fn create_group(&self, request: CreateGroupRequest) -> Result<GroupId, ChatError> {
        if request.name.trim().is_empty() {
            return Err(ChatError::GroupCreationFailed(
                "group name must not be empty".to_string(),
            ));
        }

        let group_id = self
            .cancellable(async {
                let session = self.connection.session().await?;
                session
                    .create_group(&request)
                    .await
                    .map_err(|err| ChatError::GroupCreationFailed(format!("{err:#}")))
            })
            .await?;

        if group_id.is_empty() {
            return Err(ChatError::GroupCreationFailed(
                "provider returned an empty group id".to_string(),
            ));
        }
        info!(group_id = %group_id, name = %request.name, "chat: group created");
        Ok(group_id)
    }

    pub async fn join_group(&self, group_id: &GroupId) -> bool {
        let result = self
            .cancellable(async {
                let session = self.connection.session().await?;
                session
                    .join_group(group_id)
                    .await
                    .map_err(|err| ChatError::group_operation(GroupOperation::Join, group_id, err))
            })
            .await;
        report_outcome(group_id, GroupOperation::Join, result)
    }

    pub async fn leave_group(&self, group_id: &GroupId) -> bool {
        let result = self
            .cancellable(async {
                let session = self.connection.session().await?;
                session
                    .leave_group(group_id)
                    .await
                    .map_err(|err| ChatError::group_operation(GroupOperation::Leave, group_id, err))
            })
            .await;
        report_outcome(group_id, GroupOperation::Leave, result)
    }

    pub async fn remove_member(&self, group_id: &GroupId, member: &WalletAddress) -> bool {
        let result = self
            .cancellable(async {
                let session = self.connection.session().await?;
                session
                    .remove_member(group_id, member)
                    .await
                    .map_err(|err| {
                        ChatError::group_operation(GroupOperation::RemoveMember, group_id, err)
                    })
            })
            .await;
        report_outcome(group_id, GroupOperation::RemoveMember, result)
    }

    pub async fn get_group_info(&self, group_id: &GroupId) -> Option<GroupInfo> {
        let result = self
            .cancellable(async {
                let session = self.connection.session().await?;
                session
                    .group_info(group_id)
                    .await
                    .map_err(|err| ChatError::group_operation(GroupOperation::Info, group_id, err))
            })
            .await;

        match result {
            Ok(info) => info,
            Err(err) => {
                warn!(group_id = %group_id, "chat: {err}");
                None
            }
        }
    }

    /// Fetches the whole available history, oldest first.
    ///
    /// There is no pagination: every call pulls everything the provider
    /// holds for the group.
    pub async fn get_history(&self, group_id: &GroupId) -> Result<Vec<ChatMessage>, ChatError> {
        let raw = self
            .cancellable(async {
                let session = self.connection.session().await?;
                session.history(group_id).await.map_err(|err| {
                    ChatError::group_operation(GroupOperation::History, group_id, err)
                })
            })
            .await?;

        let mut messages = Vec::with_capacity(raw.len());
        for value in raw {
            match parse_history_entry(value) {
                Ok(message) if message.group_id == *group_id => messages.push(message),
                Ok(message) => {
                    warn!(
                        group_id = %group_id,
                        other_group_id = %message.group_id,
                        "chat: skipping history entry for another group"
                    );
                }
                Err(err) => warn!(group_id = %group_id, "chat: skipping history entry: {err}"),
            }
        }
        messages.sort_by_key(|message| message.timestamp);
        debug!(group_id = %group_id, count = messages.len(), "chat: history fetched");
        Ok(messages)
    }

    /// Sends text to the group. The sender's own listeners only see the
    /// message once the provider delivers it back.
    pub async fn send_message(&self, group_id: &GroupId, content: &str) -> bool {
        self.send_typed_message(group_id, content, MessageType::Text)
            .await
    }

    pub async fn send_typed_message(
        &self,
        group_id: &GroupId,
        content: &str,
        message_type: MessageType,
    ) -> bool {
        let message = OutboundMessage {
            content: content.to_string(),
            message_type,
        };
        let result = self
            .cancellable(async {
                let session = self.connection.session().await?;
                session
                    .send(group_id, &message)
                    .await
                    .map_err(|err| ChatError::Send {
                        group_id: group_id.clone(),
                        reason: format!("{err:#}"),
                    })
            })
            .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(group_id = %group_id, "chat: {err}");
                false
            }
        }
    }
}

fn report_outcome(group_id: &GroupId, operation: GroupOperation, result: Result<(), ChatError>) -> bool {
    match result {
        Ok(()) => {
            info!(group_id = %group_id, %operation, "chat: group operation succeeded");
            true
        }
        Err(err) => {
            warn!(group_id = %group_id, %operation, "chat: {err}");
            false
        }
    }
}

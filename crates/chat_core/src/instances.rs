use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::{
    client::ChatClient, config::ChatConfig, identity::Identity, transport::TransportProvider,
};

/// Hands out the single live [`ChatClient`] for the current identity.
///
/// The host owns the registry (typically one per process). Asking for a
/// different identity tears the previous client down completely before the
/// new one is returned.
pub struct ChatClientRegistry {
    provider: Arc<dyn TransportProvider>,
    config: ChatConfig,
    current: Mutex<Option<Arc<ChatClient>>>,
}

impl ChatClientRegistry {
    pub fn new(provider: Arc<dyn TransportProvider>, config: ChatConfig) -> Self {
        Self {
            provider,
            config,
            current: Mutex::new(None),
        }
    }

    pub async fn get_instance(&self, identity: Identity) -> Arc<ChatClient> {
        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref() {
            if existing.identity() == &identity {
                return Arc::clone(existing);
            }
        }

        if let Some(previous) = current.take() {
            info!(
                previous = %previous.address(),
                next = %identity.address(),
                "chat: identity changed, tearing down previous client"
            );
            previous.cleanup().await;
        }

        let client = ChatClient::new(identity, Arc::clone(&self.provider), self.config.clone());
        *current = Some(Arc::clone(&client));
        client
    }

    pub async fn current(&self) -> Option<Arc<ChatClient>> {
        self.current.lock().await.clone()
    }

    /// Tears down and forgets the live client, if any.
    pub async fn dispose(&self) {
        let previous = self.current.lock().await.take();
        if let Some(previous) = previous {
            previous.cleanup().await;
        }
    }
}

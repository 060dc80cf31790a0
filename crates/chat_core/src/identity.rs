use std::{fmt, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::WalletAddress;

/// Signing capability supplied by the host wallet integration.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Wallet address plus the signer that authenticates it.
///
/// Two identities are equal when their addresses match and they share the
/// same signer instance. A host that rebuilds its signer object is treated as
/// a new identity, which replaces the live chat client.
#[derive(Clone)]
pub struct Identity {
    address: WalletAddress,
    signer: Arc<dyn Signer>,
}

impl Identity {
    pub fn new(address: impl Into<WalletAddress>, signer: Arc<dyn Signer>) -> Self {
        Self {
            address: address.into(),
            signer,
        }
    }

    pub fn address(&self) -> &WalletAddress {
        &self.address
    }

    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    fn signer_ptr(&self) -> *const () {
        Arc::as_ptr(&self.signer) as *const ()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.signer_ptr() == other.signer_ptr()
    }
}

impl Eq for Identity {}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("signer", &self.signer_ptr())
            .finish()
    }
}

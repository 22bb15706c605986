// File: dropminer-common/src/traits/credential_store.rs

use async_trait::async_trait;

use crate::Error;

/// Persists the session blob. The store treats it as opaque bytes.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Vec<u8>>, Error>;

    async fn save(&self, blob: &[u8]) -> Result<(), Error>;

    async fn clear(&self) -> Result<(), Error>;
}

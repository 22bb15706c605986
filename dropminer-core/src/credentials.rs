//! Credential store implementations for the session blob.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use keyring::Entry;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use dropminer_common::traits::CredentialStore;

use crate::crypto::Encryptor;
use crate::Error;

/// Reads the master key from the OS keyring, creating it on first use.
pub fn master_key_from_keyring(service_name: &str) -> Result<[u8; 32], Error> {
    let entry = Entry::new(service_name, "master-key")?;

    match entry.get_password() {
        Ok(encoded) => {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| Error::Keyring(format!("master key is not base64: {e}")))?;
            bytes
                .try_into()
                .map_err(|_| Error::Keyring("master key must be 32 bytes".into()))
        }
        Err(keyring::Error::NoEntry) => {
            let key = Encryptor::generate_key()?;
            entry.set_password(&BASE64.encode(key))?;
            info!("Created new master key in keyring service '{}'", service_name);
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Encrypted single-file store.
pub struct EncryptedFileStore {
    path: PathBuf,
    encryptor: Encryptor,
}

impl EncryptedFileStore {
    pub fn new(path: impl Into<PathBuf>, encryptor: Encryptor) -> Self {
        Self { path: path.into(), encryptor }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for EncryptedFileStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, Error> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(sealed) => Ok(Some(self.encryptor.open(&sealed)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, blob: &[u8]) -> Result<(), Error> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let sealed = self.encryptor.seal(blob)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, sealed).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Session saved to {}", self.path.display());
        Ok(())
    }

    async fn clear(&self) -> Result<(), Error> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryCredentialStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: Vec<u8>) -> Self {
        Self { blob: Mutex::new(Some(blob)) }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.blob.lock().await.clone())
    }

    async fn save(&self, blob: &[u8]) -> Result<(), Error> {
        *self.blob.lock().await = Some(blob.to_vec());
        Ok(())
    }

    async fn clear(&self) -> Result<(), Error> {
        *self.blob.lock().await = None;
        Ok(())
    }
}

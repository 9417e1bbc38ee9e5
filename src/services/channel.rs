//! Channel configuration.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::session::Session;
use crate::store::Store;
use crate::types::ChannelInfo;

/// Reads and writes channel slots; derives secrets from passphrases.
pub struct ChannelService {
    session: Session,
    store: Arc<dyn Store>,
}

impl ChannelService {
    /// Creates the service.
    #[must_use]
    pub fn new(session: Session, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self { session, store })
    }

    /// Derives a channel secret from a passphrase: the first 16 bytes of
    /// its SHA-256.
    #[must_use]
    pub fn hash_secret(passphrase: &str) -> [u8; 16] {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut secret = [0u8; 16];
        secret.copy_from_slice(&digest[..16]);
        secret
    }

    /// True when the bytes are a well-formed channel secret.
    #[must_use]
    pub fn validate_secret(secret: &[u8]) -> bool {
        secret.len() == 16
    }

    /// Reads one channel slot from the device and mirrors it in the
    /// store.
    pub async fn get_channel(&self, index: u8) -> Result<ChannelInfo> {
        let channel = self.session.get_channel(index).await?;
        self.store.save_channel(channel.clone()).await?;
        Ok(channel)
    }

    /// Writes one channel slot with an explicit 16-byte secret.
    pub async fn set_channel(&self, index: u8, name: &str, secret: &[u8]) -> Result<()> {
        if !Self::validate_secret(secret) {
            return Err(Error::BadArgument {
                reason: format!("channel secret must be 16 bytes, got {}", secret.len()),
            });
        }
        let mut fixed = [0u8; 16];
        fixed.copy_from_slice(secret);

        self.session.set_channel(index, name, &fixed).await?;
        self.store
            .save_channel(ChannelInfo {
                index,
                name: name.to_string(),
                secret: fixed,
            })
            .await
    }

    /// Writes one channel slot, deriving the secret from a passphrase.
    pub async fn set_channel_passphrase(
        &self,
        index: u8,
        name: &str,
        passphrase: &str,
    ) -> Result<()> {
        let secret = Self::hash_secret(passphrase);
        self.set_channel(index, name, &secret).await
    }
}

//! Persistence contract and an in-memory reference store.
//!
//! The store is the authoritative home of contacts, channels and
//! messages; engine state is only a soft cache over it. Implementations
//! serialize their own writes; callers never coordinate.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{ChannelInfo, Contact, Message, MessageStatus, PublicKey};

/// Device-scoped persistence consumed by the services.
///
/// One store instance belongs to one local device; scoping is fixed at
/// construction.
#[async_trait]
pub trait Store: Send + Sync {
    /// All contacts known for this device.
    async fn fetch_contacts(&self) -> Result<Vec<Contact>>;

    /// Fetches one contact by public key.
    async fn fetch_contact(&self, public_key: &PublicKey) -> Result<Option<Contact>>;

    /// Fetches the contact whose key begins with `prefix`.
    async fn fetch_contact_by_prefix(&self, prefix: &[u8]) -> Result<Option<Contact>>;

    /// Inserts or updates a contact.
    async fn save_contact(&self, contact: Contact) -> Result<()>;

    /// Deletes a contact.
    async fn delete_contact(&self, public_key: &PublicKey) -> Result<()>;

    /// Messages for a direct conversation, newest first.
    async fn fetch_messages(
        &self,
        contact: &PublicKey,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>>;

    /// Messages on a channel, newest first.
    async fn fetch_channel_messages(
        &self,
        channel: u8,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>>;

    /// Fetches one message by id.
    async fn fetch_message(&self, id: Uuid) -> Result<Option<Message>>;

    /// Persists a message.
    async fn save_message(&self, message: Message) -> Result<()>;

    /// Updates a message's delivery status.
    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<()>;

    /// Records the ack outcome for a message.
    async fn update_message_ack(
        &self,
        id: Uuid,
        ack_code: u32,
        status: MessageStatus,
        rtt_ms: Option<u32>,
    ) -> Result<()>;

    /// True when a message with this dedup key is already persisted.
    async fn is_duplicate(&self, dedup_key: &str) -> Result<bool>;

    /// Persisted channel configurations.
    async fn fetch_channels(&self) -> Result<Vec<ChannelInfo>>;

    /// Inserts or updates a channel configuration.
    async fn save_channel(&self, channel: ChannelInfo) -> Result<()>;

    /// Timestamp of the last full contact sync, if any.
    async fn last_contact_sync(&self) -> Result<Option<u32>>;

    /// Records the last contact sync timestamp.
    async fn set_last_contact_sync(&self, ts: u32) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    contacts: HashMap<Vec<u8>, Contact>,
    messages: Vec<Message>,
    dedup_keys: HashMap<String, Uuid>,
    channels: HashMap<u8, ChannelInfo>,
    last_contact_sync: Option<u32>,
}

/// In-memory [`Store`]: the reference implementation, also used by the
/// test suite.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_contacts(&self) -> Result<Vec<Contact>> {
        let state = self.state.lock().await;
        Ok(state.contacts.values().cloned().collect())
    }

    async fn fetch_contact(&self, public_key: &PublicKey) -> Result<Option<Contact>> {
        let state = self.state.lock().await;
        Ok(state.contacts.get(public_key.as_bytes()).cloned())
    }

    async fn fetch_contact_by_prefix(&self, prefix: &[u8]) -> Result<Option<Contact>> {
        let state = self.state.lock().await;
        Ok(state
            .contacts
            .values()
            .find(|c| c.public_key.as_bytes().starts_with(prefix))
            .cloned())
    }

    async fn save_contact(&self, contact: Contact) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .contacts
            .insert(contact.public_key.as_bytes().to_vec(), contact);
        Ok(())
    }

    async fn delete_contact(&self, public_key: &PublicKey) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .contacts
            .remove(public_key.as_bytes())
            .map(|_| ())
            .ok_or(Error::ContactNotFound)
    }

    async fn fetch_messages(
        &self,
        contact: &PublicKey,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let state = self.state.lock().await;
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| {
                matches!(&m.kind, crate::types::MessageKind::Direct(pk) if pk == contact)
            })
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.sender_ts.cmp(&a.sender_ts));
        Ok(messages.into_iter().skip(offset).take(limit).collect())
    }

    async fn fetch_channel_messages(
        &self,
        channel: u8,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let state = self.state.lock().await;
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| matches!(&m.kind, crate::types::MessageKind::Channel(c) if *c == channel))
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.sender_ts.cmp(&a.sender_ts));
        Ok(messages.into_iter().skip(offset).take(limit).collect())
    }

    async fn fetch_message(&self, id: Uuid) -> Result<Option<Message>> {
        let state = self.state.lock().await;
        Ok(state.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn save_message(&self, message: Message) -> Result<()> {
        let mut state = self.state.lock().await;
        state.dedup_keys.insert(message.dedup_key.clone(), message.id);
        state.messages.push(message);
        Ok(())
    }

    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::Store {
                reason: format!("no message {id}"),
            })?;
        message.status = status;
        Ok(())
    }

    async fn update_message_ack(
        &self,
        id: Uuid,
        ack_code: u32,
        status: MessageStatus,
        rtt_ms: Option<u32>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::Store {
                reason: format!("no message {id}"),
            })?;
        message.ack_code = Some(ack_code);
        message.status = status;
        message.rtt_ms = rtt_ms;
        Ok(())
    }

    async fn is_duplicate(&self, dedup_key: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.dedup_keys.contains_key(dedup_key))
    }

    async fn fetch_channels(&self) -> Result<Vec<ChannelInfo>> {
        let state = self.state.lock().await;
        let mut channels: Vec<ChannelInfo> = state.channels.values().cloned().collect();
        channels.sort_by_key(|c| c.index);
        Ok(channels)
    }

    async fn save_channel(&self, channel: ChannelInfo) -> Result<()> {
        let mut state = self.state.lock().await;
        state.channels.insert(channel.index, channel);
        Ok(())
    }

    async fn last_contact_sync(&self) -> Result<Option<u32>> {
        let state = self.state.lock().await;
        Ok(state.last_contact_sync)
    }

    async fn set_last_contact_sync(&self, ts: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.last_contact_sync = Some(ts);
        Ok(())
    }
}

//! Contact synchronization and management.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::Result;
use crate::event::{Event, Filter};
use crate::session::Session;
use crate::store::Store;
use crate::types::{Contact, PublicKey};

/// Result of a contact sync pass.
#[derive(Debug, Clone, Copy)]
pub struct SyncReport {
    /// Contacts received from the device.
    pub received: usize,
    /// Device-side last-modified timestamp at sync end.
    pub last_sync_ts: u32,
    /// True when the request was incremental (`since` was sent).
    pub incremental: bool,
    /// True when the envelope closed early; the store holds a partial
    /// update and the caller may retry.
    pub interrupted: bool,
}

/// Keeps the store's contact table in step with the device.
pub struct ContactService {
    session: Session,
    store: Arc<dyn Store>,
}

impl ContactService {
    /// Creates the service.
    #[must_use]
    pub fn new(session: Session, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self { session, store })
    }

    /// Syncs contacts from the device into the store.
    ///
    /// Incremental by default (from the stored last-sync timestamp);
    /// `force` requests the full table. Removals are only applied on a
    /// complete full sync, since an incremental response cannot distinguish
    /// "unchanged" from "deleted".
    pub async fn sync_contacts(&self, force: bool, since: Option<u32>) -> Result<SyncReport> {
        let since = if force {
            None
        } else {
            match since {
                Some(ts) => Some(ts),
                None => self.store.last_contact_sync().await?,
            }
        };
        let incremental = since.is_some();

        let sync = self.session.get_contacts(since).await?;
        tracing::info!(
            received = sync.contacts.len(),
            incremental,
            interrupted = sync.interrupted,
            "contact sync"
        );

        for contact in &sync.contacts {
            self.store.save_contact(contact.clone()).await?;
        }

        if !incremental && !sync.interrupted {
            let device_keys: HashSet<&[u8]> = sync
                .contacts
                .iter()
                .map(|c| c.public_key.as_bytes())
                .collect();
            for stored in self.store.fetch_contacts().await? {
                if !device_keys.contains(stored.public_key.as_bytes()) {
                    tracing::debug!(contact = %stored.public_key, "removing contact absent from device");
                    self.store.delete_contact(&stored.public_key).await?;
                }
            }
        }

        if !sync.interrupted {
            self.store.set_last_contact_sync(sync.last_modified).await?;
        }

        Ok(SyncReport {
            received: sync.contacts.len(),
            last_sync_ts: sync.last_modified,
            incremental,
            interrupted: sync.interrupted,
        })
    }

    /// Adds or updates a contact on the device and in the store.
    pub async fn add_or_update(&self, contact: Contact) -> Result<()> {
        self.session.add_update_contact(&contact).await?;
        self.store.save_contact(contact).await
    }

    /// Removes a contact from the device and the store.
    pub async fn remove(&self, public_key: &PublicKey) -> Result<()> {
        self.session.remove_contact(public_key).await?;
        self.store.delete_contact(public_key).await
    }

    /// Clears a contact's outbound path so it floods again.
    pub async fn reset_path(&self, public_key: &PublicKey) -> Result<()> {
        self.session.reset_path(public_key).await?;
        if let Some(mut contact) = self.store.fetch_contact(public_key).await? {
            contact.out_path_len = -1;
            contact.out_path = bytes::Bytes::new();
            self.store.save_contact(contact).await?;
        }
        Ok(())
    }

    /// Asks the device to share a contact over the mesh.
    pub async fn share(&self, public_key: &PublicKey) -> Result<()> {
        self.session.share_contact(public_key).await
    }

    /// Spawns the advert listener: full-contact adverts upsert the store
    /// directly, bare key adverts fetch the record from the device first.
    #[must_use]
    pub fn run_adverts(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut adverts = service.session.bus().subscribe(Filter::advertisement(None));
        tokio::spawn(async move {
            while let Some(event) = adverts.recv().await {
                if let Err(e) = service.on_advert(event).await {
                    tracing::warn!("advert handling failed: {e}");
                }
            }
        })
    }

    async fn on_advert(&self, event: Event) -> Result<()> {
        match event {
            Event::NewAdvert(contact) => {
                tracing::debug!(name = %contact.name, "contact advert");
                self.store.save_contact(*contact).await
            }
            Event::Advertisement {
                public_key: Some(key),
                ..
            } => match self.session.get_contact_by_key(&key).await {
                Ok(contact) => self.store.save_contact(contact).await,
                Err(crate::error::Error::ContactNotFound) => Ok(()),
                Err(e) => Err(e),
            },
            _ => Ok(()),
        }
    }
}

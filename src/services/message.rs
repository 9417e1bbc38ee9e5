//! Message sending and inbound persistence.

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::reliability::ack::SendKind;
use crate::reliability::reaction::compose_reaction;
use crate::reliability::{Engine, Notification, TrackSend};
use crate::services::now_ts;
use crate::session::Session;
use crate::store::Store;
use crate::types::{
    ChannelMessage, ContactMessage, Direction, Message, MessageKind, MessageStatus, PublicKey,
    TextType,
};

/// Sends messages and persists engine-accepted inbound traffic.
pub struct MessageService {
    session: Session,
    store: Arc<dyn Store>,
    engine: Engine,
}

impl MessageService {
    /// Creates the service.
    #[must_use]
    pub fn new(session: Session, store: Arc<dyn Store>, engine: Engine) -> Arc<Self> {
        Arc::new(Self {
            session,
            store,
            engine,
        })
    }

    fn device_id(&self) -> PublicKey {
        self.session.info().node.public_key.clone()
    }

    fn node_name(&self) -> String {
        self.session.info().node.name.clone()
    }

    /// Sends a direct message: persists it pending, submits it, and
    /// registers the pending ack with the engine. Returns the persisted
    /// message in its post-submit state.
    pub async fn send_direct(&self, contact: &PublicKey, text: &str) -> Result<Message> {
        if self
            .store
            .fetch_contact(contact)
            .await?
            .is_none()
        {
            return Err(Error::ContactNotFound);
        }

        let sender_ts = now_ts();
        let mut message = Message {
            id: Uuid::new_v4(),
            device_id: self.device_id(),
            direction: Direction::Sent,
            kind: MessageKind::Direct(contact.clone()),
            text_type: TextType::Plain,
            sender_ts,
            text: text.to_string(),
            snr: None,
            path_len: None,
            status: MessageStatus::Pending,
            ack_code: None,
            rtt_ms: None,
            dedup_key: Message::direct_dedup_key(contact, sender_ts, text),
        };
        self.store.save_message(message.clone()).await?;

        match self.session.send_text(contact, text, 0, sender_ts).await {
            Ok(receipt) => {
                message.status = MessageStatus::Sent;
                message.ack_code = Some(receipt.ack_code());
                self.store
                    .update_message_status(message.id, MessageStatus::Sent)
                    .await?;
                self.engine.track_send(TrackSend {
                    message_id: message.id,
                    kind: SendKind::Direct {
                        recipient: contact.clone(),
                    },
                    text: text.to_string(),
                    sender_ts,
                    receipt,
                });
                Ok(message)
            }
            Err(e) => {
                self.store
                    .update_message_status(message.id, MessageStatus::Failed)
                    .await?;
                Err(e)
            }
        }
    }

    /// Sends a channel message and registers it for ack tracking and
    /// reaction targeting.
    pub async fn send_channel(&self, channel: u8, text: &str) -> Result<Message> {
        let sender_ts = now_ts();
        let sender_name = self.node_name();
        let mut message = Message {
            id: Uuid::new_v4(),
            device_id: self.device_id(),
            direction: Direction::Sent,
            kind: MessageKind::Channel(channel),
            text_type: TextType::Plain,
            sender_ts,
            text: text.to_string(),
            snr: None,
            path_len: None,
            status: MessageStatus::Pending,
            ack_code: None,
            rtt_ms: None,
            dedup_key: Message::channel_dedup_key(channel, sender_ts, &sender_name, text),
        };
        self.store.save_message(message.clone()).await?;

        match self.session.send_chan_text(channel, text, sender_ts).await {
            Ok(receipt) => {
                message.status = MessageStatus::Sent;
                message.ack_code = Some(receipt.ack_code());
                self.store
                    .update_message_status(message.id, MessageStatus::Sent)
                    .await?;
                self.engine
                    .index_outbound(message.id, channel, &sender_name, text, sender_ts);
                self.engine.track_send(TrackSend {
                    message_id: message.id,
                    kind: SendKind::Channel { index: channel },
                    text: text.to_string(),
                    sender_ts,
                    receipt,
                });
                Ok(message)
            }
            Err(e) => {
                self.store
                    .update_message_status(message.id, MessageStatus::Failed)
                    .await?;
                Err(e)
            }
        }
    }

    /// Sends an emoji reaction to a previously seen channel message.
    ///
    /// The reaction is addressed by content: the target's sender name,
    /// text and timestamp produce the preview and hash receivers match
    /// against their own index.
    pub async fn send_reaction(
        &self,
        channel: u8,
        emoji: &str,
        target_sender: &str,
        target_text: &str,
        target_ts: u32,
    ) -> Result<Message> {
        let text = compose_reaction(emoji, target_sender, target_text, target_ts);
        self.send_channel(channel, &text).await
    }

    /// Spawns the inbound persistence loop: every engine-accepted message
    /// becomes a stored [`Message`].
    #[must_use]
    pub fn run_inbound(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut notifications = service.engine.subscribe();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(Notification::InboundDirect {
                        message_id,
                        message,
                    }) => {
                        if let Err(e) = service.persist_direct(message_id, &message).await {
                            tracing::warn!("inbound direct persist failed: {e}");
                        }
                    }
                    Ok(Notification::InboundChannel {
                        message_id,
                        message,
                        sender_name,
                        ..
                    }) => {
                        if let Err(e) = service
                            .persist_channel(message_id, &message, &sender_name)
                            .await
                        {
                            tracing::warn!("inbound channel persist failed: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "inbound persistence lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn persist_direct(&self, message_id: Uuid, message: &ContactMessage) -> Result<()> {
        let Some(contact) = self
            .store
            .fetch_contact_by_prefix(message.sender_prefix.as_bytes())
            .await?
        else {
            tracing::debug!(sender = %message.sender_prefix, "message from unknown contact dropped");
            return Ok(());
        };

        let dedup_key =
            Message::direct_dedup_key(&contact.public_key, message.sender_ts, &message.text);
        if self.store.is_duplicate(&dedup_key).await? {
            return Ok(());
        }

        self.store
            .save_message(Message {
                id: message_id,
                device_id: self.device_id(),
                direction: Direction::Received,
                kind: MessageKind::Direct(contact.public_key),
                text_type: message.text_type,
                sender_ts: message.sender_ts,
                text: message.text.clone(),
                snr: message.snr,
                path_len: Some(message.path_len),
                status: MessageStatus::Acked,
                ack_code: None,
                rtt_ms: None,
                dedup_key,
            })
            .await
    }

    async fn persist_channel(
        &self,
        message_id: Uuid,
        message: &ChannelMessage,
        sender_name: &str,
    ) -> Result<()> {
        let dedup_key = Message::channel_dedup_key(
            message.channel_index,
            message.sender_ts,
            sender_name,
            &message.text,
        );
        if self.store.is_duplicate(&dedup_key).await? {
            return Ok(());
        }

        self.store
            .save_message(Message {
                id: message_id,
                device_id: self.device_id(),
                direction: Direction::Received,
                kind: MessageKind::Channel(message.channel_index),
                text_type: message.text_type,
                sender_ts: message.sender_ts,
                text: message.text.clone(),
                snr: message.snr,
                path_len: Some(message.path_len),
                status: MessageStatus::Acked,
                ack_code: None,
                rtt_ms: None,
                dedup_key,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reliability::Engine;
    use crate::store::MemoryStore;
    use crate::testutil::{
        ack_frame, channel_message_frame, contact_message_frame, message_sent_frame, ready_session,
    };
    use crate::types::{Contact, ContactFlags, ContactType};

    fn contact(byte: u8) -> Contact {
        Contact {
            public_key: PublicKey::from_bytes(&[byte; 32]),
            contact_type: ContactType::Chat,
            flags: ContactFlags::NONE,
            out_path_len: -1,
            out_path: bytes::Bytes::new(),
            name: "Peer".into(),
            last_advert: 0,
            latitude: None,
            longitude: None,
            last_modified: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_direct_persists_and_tracks() {
        let (session, mut device) = ready_session(240, Config::default()).await;
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::spawn(session.clone(), Arc::clone(&store) as Arc<dyn Store>);
        let service = MessageService::new(session, Arc::clone(&store) as Arc<dyn Store>, engine.clone());

        let peer = contact(7);
        store.save_contact(peer.clone()).await.unwrap();

        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame[0], 0x02);
            assert_eq!(frame[2], 0, "initial send is attempt byte 0");
            device
                .push_frame(message_sent_frame([0xAA, 0, 0, 0], 1000))
                .await;
            device
        };
        let (sent, device) = tokio::join!(service.send_direct(&peer.public_key, "hello"), script);
        let sent = sent.unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.ack_code, Some(0xAA));

        let stored = store.fetch_message(sent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);

        // The engine tracked the ack: acknowledge and observe the
        // transition.
        let mut notes = engine.subscribe();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        device.push_frame(ack_frame([0xAA, 0, 0, 0])).await;
        loop {
            if let Ok(Notification::MessageAcked { message_id, .. }) = notes.recv().await {
                assert_eq!(message_id, sent.id);
                break;
            }
        }
        let stored = store.fetch_message(sent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Acked);
        assert!(stored.rtt_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_direct_requires_known_contact() {
        let (session, _device) = ready_session(240, Config::default()).await;
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::spawn(session.clone(), Arc::clone(&store) as Arc<dyn Store>);
        let service = MessageService::new(session, store, engine);

        let unknown = PublicKey::from_bytes(&[9; 32]);
        assert!(matches!(
            service.send_direct(&unknown, "hi").await,
            Err(Error::ContactNotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_marks_message_failed() {
        let (session, mut device) = ready_session(240, Config::default()).await;
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::spawn(session.clone(), Arc::clone(&store) as Arc<dyn Store>);
        let service = MessageService::new(session, Arc::clone(&store) as Arc<dyn Store>, engine);

        let peer = contact(7);
        store.save_contact(peer.clone()).await.unwrap();

        let script = async {
            let _ = device.next_write().await;
            device.push_frame(vec![0x01, 0x02]).await; // device error
        };
        let (result, ()) = tokio::join!(service.send_direct(&peer.public_key, "hello"), script);
        assert!(matches!(result, Err(Error::Device { code: Some(2) })));

        let messages = store.fetch_messages(&peer.public_key, 10, 0).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_messages_are_persisted_once() {
        let (session, device) = ready_session(240, Config::default()).await;
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::spawn(session.clone(), Arc::clone(&store) as Arc<dyn Store>);
        let service = MessageService::new(session, Arc::clone(&store) as Arc<dyn Store>, engine.clone());
        let _persist = service.run_inbound();

        let peer = contact(7);
        store.save_contact(peer.clone()).await.unwrap();

        // Same direct message twice (mesh redundancy), then a channel
        // message.
        let direct = contact_message_frame([7, 7, 7, 7, 7, 7], 100, "direct hello");
        device.push_frame(direct.clone()).await;
        device.push_frame(direct).await;
        device
            .push_frame(channel_message_frame(2, 100, "Alice: channel hello"))
            .await;

        // Wait for the channel message to land, then check the store.
        let mut notes = engine.subscribe();
        loop {
            if let Ok(Notification::InboundChannel { .. }) = notes.recv().await {
                break;
            }
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let direct_stored = store.fetch_messages(&peer.public_key, 10, 0).await.unwrap();
        assert_eq!(direct_stored.len(), 1);
        assert_eq!(direct_stored[0].text, "direct hello");
        assert_eq!(direct_stored[0].direction, Direction::Received);

        let channel_stored = store.fetch_channel_messages(2, 10, 0).await.unwrap();
        assert_eq!(channel_stored.len(), 1);
        assert_eq!(channel_stored[0].text, "Alice: channel hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reaction_targets_without_reindexing() {
        let (session, mut device) = ready_session(240, Config::default()).await;
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::spawn(session.clone(), Arc::clone(&store) as Arc<dyn Store>);
        let service =
            MessageService::new(session, Arc::clone(&store) as Arc<dyn Store>, engine.clone());

        // Original channel message; the engine indexes it as a target.
        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame[0], 0x03);
            device
                .push_frame(message_sent_frame([0xC1, 0, 0, 0], 1000))
                .await;
            device
        };
        let (target, mut device) = tokio::join!(service.send_channel(4, "announce"), script);
        let target = target.unwrap();

        // The reaction goes out as ordinary channel text in the grammar.
        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame[0], 0x03);
            assert_eq!(frame[2], 4, "channel index");
            device
                .push_frame(message_sent_frame([0xC2, 0, 0, 0], 1000))
                .await;
            device
        };
        let (reaction, device) = tokio::join!(
            service.send_reaction(4, "👍", "TestNode", "announce", target.sender_ts),
            script
        );
        let reaction = reaction.unwrap();

        let parsed = crate::reliability::reaction::parse_reaction(&reaction.text).unwrap();
        assert_eq!(parsed.emoji, "👍");
        assert_eq!(parsed.target_sender, "TestNode");
        assert_eq!(parsed.content_preview, "announce");
        assert_eq!(
            parsed.message_hash,
            crate::reliability::reaction::message_hash("announce", target.sender_ts)
        );

        let mut notes = engine.subscribe();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // A reaction aimed at the reaction itself finds no target: the
        // outbound reaction was never indexed.
        let to_reaction = crate::reliability::reaction::compose_reaction(
            "🔥",
            "TestNode",
            &reaction.text,
            reaction.sender_ts,
        );
        device
            .push_frame(channel_message_frame(4, 900, &format!("Bob: {to_reaction}")))
            .await;
        // One aimed at the original resolves.
        let to_original = crate::reliability::reaction::compose_reaction(
            "🔥",
            "TestNode",
            "announce",
            target.sender_ts,
        );
        device
            .push_frame(channel_message_frame(4, 901, &format!("Bob: {to_original}")))
            .await;

        loop {
            if let Ok(Notification::ReactionResolved {
                target_message_id, ..
            }) = notes.recv().await
            {
                assert_eq!(
                    target_message_id, target.id,
                    "only the original message is a target"
                );
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_channel_indexes_for_reactions() {
        let (session, mut device) = ready_session(240, Config::default()).await;
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::spawn(session.clone(), Arc::clone(&store) as Arc<dyn Store>);
        let service = MessageService::new(session, Arc::clone(&store) as Arc<dyn Store>, engine.clone());

        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame[0], 0x03);
            assert_eq!(frame[2], 4, "channel index");
            device
                .push_frame(message_sent_frame([0xBB, 0, 0, 0], 1000))
                .await;
            device
        };
        let (sent, device) = tokio::join!(service.send_channel(4, "announce"), script);
        let sent = sent.unwrap();

        // A reaction to our own message resolves against the outbound
        // index ("TestNode" is the handshake identity).
        let mut notes = engine.subscribe();
        let hash = crate::reliability::reaction::message_hash("announce", sent.sender_ts);
        let text = format!("Bob: 👍 @[TestNode] announce [{hash}]");
        device.push_frame(channel_message_frame(4, 999, &text)).await;

        loop {
            if let Ok(Notification::ReactionResolved {
                target_message_id, ..
            }) = notes.recv().await
            {
                assert_eq!(target_message_id, sent.id);
                break;
            }
        }
    }
}

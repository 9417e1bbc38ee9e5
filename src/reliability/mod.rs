//! Retry, deduplication and reaction engine.
//!
//! The [`Engine`] is a handle to a single-owner task layered over a
//! [`Session`]. It tracks every outbound send by its expected ack code,
//! walks the direct→flood retry ladder on expiry, deduplicates inbound
//! messages per peer, indexes channel messages so emoji reactions can be
//! resolved to their targets, and drains the device queue whenever the
//! node signals waiting messages. Outcomes fan out to services as
//! [`Notification`]s.

pub mod ack;
pub mod dedup;
pub mod reaction;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::event::{Event, Filter};
use crate::session::{SendReceipt, Session, SyncedMessage};
use crate::store::Store;
use crate::types::{ChannelMessage, ContactMessage, MessageStatus, split_channel_text};

use ack::{AckTracker, PendingSend, SendKind, SendPhase};
use dedup::{DedupCache, Peer};
use reaction::{IndexedMessage, ReactionIndex, Resolution};

/// Sweeper period for ack expiry and pending-reaction TTLs.
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Engine outcomes delivered to services.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A tracked send was acknowledged.
    MessageAcked {
        message_id: Uuid,
        ack_code: u32,
        rtt_ms: u32,
    },
    /// A tracked send expired and will be retried.
    MessageRetrying {
        message_id: Uuid,
        next_attempt: u8,
        flood: bool,
    },
    /// The retry ladder is exhausted.
    MessageFailed { message_id: Uuid },
    /// A fresh (non-duplicate) direct message arrived.
    InboundDirect {
        message_id: Uuid,
        message: ContactMessage,
    },
    /// A fresh (non-duplicate, non-reaction) channel message arrived.
    InboundChannel {
        message_id: Uuid,
        message: ChannelMessage,
        sender_name: String,
        body: String,
    },
    /// A reaction resolved to an indexed message.
    ReactionResolved {
        target_message_id: Uuid,
        channel_index: u8,
        emoji: String,
        sender_name: String,
    },
    /// A queued reaction expired without finding its target.
    ReactionExpired {
        channel_index: u8,
        emoji: String,
        sender_name: String,
    },
    /// An auto-fetch pass drained the device queue.
    FetchCompleted { fetched: usize },
}

/// Registration for a send the device just accepted.
#[derive(Debug, Clone)]
pub struct TrackSend {
    /// Persisted message id.
    pub message_id: Uuid,
    /// Addressing for resends.
    pub kind: SendKind,
    /// Message text for resends.
    pub text: String,
    /// Original sender timestamp.
    pub sender_ts: u32,
    /// The device's send receipt.
    pub receipt: SendReceipt,
}

enum EngineCmd {
    Track(TrackSend),
    IndexOutbound {
        message_id: Uuid,
        channel_index: u8,
        sender_name: String,
        body: String,
        sender_ts: u32,
    },
    Inbound(SyncedMessage),
    FetchDone {
        fetched: usize,
    },
    RetryDue {
        ack_code: u32,
    },
    Resent {
        old_code: u32,
        result: Result<SendReceipt>,
    },
    Shutdown,
}

/// Handle to the reliability engine task.
#[derive(Clone)]
pub struct Engine {
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
    notify_tx: broadcast::Sender<Notification>,
}

impl Engine {
    /// Spawns the engine over a ready session and its store.
    #[must_use]
    pub fn spawn(session: Session, store: Arc<dyn Store>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (notify_tx, _) = broadcast::channel(256);
        let config = session.config().clone();

        let bus_events = session.bus().subscribe(
            Filter::any_acknowledgement()
                .or(Filter::messages_waiting())
                .or(Filter::contact_message(None))
                .or(Filter::channel_message(None)),
        );

        let task = EngineTask {
            session,
            store,
            acks: AckTracker::new(),
            dedup: DedupCache::new(
                usize::from(config.direct_dedup_cap),
                usize::from(config.channel_dedup_cap),
            ),
            reactions: ReactionIndex::new(
                usize::from(config.reaction_index_cap),
                config.pending_reaction_ttl,
            ),
            config,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            notify_tx: notify_tx.clone(),
            fetch_task: None,
        };
        tokio::spawn(task.run(bus_events));

        Self { cmd_tx, notify_tx }
    }

    /// Subscribes to engine notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    /// Registers an accepted send for ack tracking and retries.
    pub fn track_send(&self, send: TrackSend) {
        let _ = self.cmd_tx.send(EngineCmd::Track(send));
    }

    /// Indexes an outbound channel message for reaction targeting.
    pub fn index_outbound(
        &self,
        message_id: Uuid,
        channel_index: u8,
        sender_name: &str,
        body: &str,
        sender_ts: u32,
    ) {
        let _ = self.cmd_tx.send(EngineCmd::IndexOutbound {
            message_id,
            channel_index,
            sender_name: sender_name.to_string(),
            body: body.to_string(),
            sender_ts,
        });
    }

    /// Stops the engine task.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCmd::Shutdown);
    }
}

struct EngineTask {
    session: Session,
    store: Arc<dyn Store>,
    config: Config,
    acks: AckTracker,
    dedup: DedupCache,
    reactions: ReactionIndex,
    cmd_rx: mpsc::UnboundedReceiver<EngineCmd>,
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
    notify_tx: broadcast::Sender<Notification>,
    fetch_task: Option<JoinHandle<()>>,
}

impl EngineTask {
    async fn run(mut self, mut bus_events: crate::event::Subscription) {
        let mut sweeper = tokio::time::interval(SWEEP_PERIOD);
        sweeper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(EngineCmd::Shutdown) | None => break,
                        Some(cmd) => self.handle_cmd(cmd).await,
                    }
                }
                maybe_event = bus_events.recv() => {
                    let Some(event) = maybe_event else {
                        tracing::debug!("event bus closed, stopping engine");
                        break;
                    };
                    self.handle_event(event).await;
                }
                _ = sweeper.tick() => self.sweep().await,
            }
        }

        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        tracing::debug!("engine stopped");
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notify_tx.send(notification);
    }

    async fn handle_cmd(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::Track(send) => self.on_track(send),
            EngineCmd::IndexOutbound {
                message_id,
                channel_index,
                sender_name,
                body,
                sender_ts,
            } => {
                // Reactions target messages; they are never targets.
                if reaction::parse_reaction(&body).is_none() {
                    self.index_message(IndexedMessage::new(
                        message_id,
                        channel_index,
                        &sender_name,
                        &body,
                        sender_ts,
                    ));
                }
            }
            EngineCmd::Inbound(synced) => match synced {
                SyncedMessage::Direct(msg) => self.on_direct_message(msg),
                SyncedMessage::Channel(msg) => self.on_channel_message(msg),
                SyncedMessage::NoMore => {}
            },
            EngineCmd::FetchDone { fetched } => {
                self.fetch_task = None;
                self.notify(Notification::FetchCompleted { fetched });
            }
            EngineCmd::RetryDue { ack_code } => self.on_retry_due(ack_code).await,
            EngineCmd::Resent { old_code, result } => self.on_resent(old_code, result).await,
            EngineCmd::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Acknowledgement(ack) => self.on_ack(ack.code_u32()).await,
            Event::MessagesWaiting => self.start_fetch(),
            // Unsolicited message pushes take the same path as fetched
            // ones; dedup makes the overlap harmless.
            Event::ContactMessage(msg) => self.on_direct_message(*msg),
            Event::ChannelMessage(msg) => self.on_channel_message(*msg),
            _ => {}
        }
    }

    // ==================== Ack tracking & retry ====================

    fn on_track(&mut self, send: TrackSend) {
        let timeout = ack::buffered_timeout(&self.config, send.receipt.suggested_timeout_ms);
        tracing::debug!(
            message = %send.message_id,
            ack = send.receipt.ack_code(),
            ?timeout,
            "tracking send"
        );
        self.acks.track(PendingSend {
            message_id: send.message_id,
            kind: send.kind,
            text: send.text,
            sender_ts: send.sender_ts,
            attempt: 1,
            ack_code: send.receipt.ack_code(),
            sent_at: Instant::now(),
            timeout,
            phase: SendPhase::AwaitingAck,
        });
    }

    async fn on_ack(&mut self, code: u32) {
        let Some(send) = self.acks.resolve(code) else {
            tracing::trace!(code, "ack with no pending send");
            return;
        };

        let rtt_ms =
            u32::try_from(Instant::now().duration_since(send.sent_at).as_millis()).unwrap_or(u32::MAX);
        tracing::debug!(message = %send.message_id, code, rtt_ms, "send acknowledged");

        if let Err(e) = self
            .store
            .update_message_ack(send.message_id, code, MessageStatus::Acked, Some(rtt_ms))
            .await
        {
            tracing::warn!(message = %send.message_id, "ack store update failed: {e}");
        }
        self.notify(Notification::MessageAcked {
            message_id: send.message_id,
            ack_code: code,
            rtt_ms,
        });
    }

    async fn sweep(&mut self) {
        let now = Instant::now();

        for code in self.acks.expired(now) {
            self.start_backoff(code, now).await;
        }

        for expired in self.reactions.sweep_expired(now) {
            tracing::debug!(
                channel = expired.channel_index,
                sender = %expired.sender_name,
                "pending reaction expired"
            );
            self.notify(Notification::ReactionExpired {
                channel_index: expired.channel_index,
                emoji: expired.parsed.emoji,
                sender_name: expired.sender_name,
            });
        }
    }

    /// Attempt expired: hold for the ladder backoff, then retry or fail.
    async fn start_backoff(&mut self, code: u32, now: Instant) {
        let (message_id, attempt, kind, until, backoff) = {
            let Some(send) = self.acks.get_mut(code) else {
                return;
            };
            let backoff = ack::backoff_after(send.attempt);
            let until = now + backoff;
            send.phase = SendPhase::BackingOff { until };
            (send.message_id, send.attempt, send.kind.clone(), until, backoff)
        };

        let max = ack::max_ladder_attempts(&self.config, &kind);
        if attempt < max {
            let next_attempt = attempt + 1;
            let flood = ack::is_flood_attempt(&self.config, &kind, next_attempt);
            tracing::debug!(
                message = %message_id,
                next_attempt,
                flood,
                ?backoff,
                "attempt expired, backing off"
            );
            self.notify(Notification::MessageRetrying {
                message_id,
                next_attempt,
                flood,
            });
            if let Err(e) = self
                .store
                .update_message_status(message_id, MessageStatus::Retrying)
                .await
            {
                tracing::warn!(message = %message_id, "status update failed: {e}");
            }
        }

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(until).await;
            let _ = cmd_tx.send(EngineCmd::RetryDue { ack_code: code });
        });
    }

    async fn on_retry_due(&mut self, code: u32) {
        let (attempt, kind, text, sender_ts, in_backoff) = {
            let Some(send) = self.acks.get_mut(code) else {
                // Acked during the backoff: short-circuit.
                return;
            };
            (
                send.attempt,
                send.kind.clone(),
                send.text.clone(),
                send.sender_ts,
                matches!(send.phase, SendPhase::BackingOff { .. }),
            )
        };
        if !in_backoff {
            return;
        }

        let max = ack::max_ladder_attempts(&self.config, &kind);
        if attempt >= max {
            if let Some(send) = self.acks.resolve(code) {
                self.fail_send(send).await;
            }
            return;
        }

        if let Some(send) = self.acks.get_mut(code) {
            send.phase = SendPhase::Resending;
        }
        let next_attempt = attempt + 1;
        let entering_flood = ack::is_flood_attempt(&self.config, &kind, next_attempt)
            && !ack::is_flood_attempt(&self.config, &kind, attempt);
        let session = self.session.clone();
        let cmd_tx = self.cmd_tx.clone();

        tokio::spawn(async move {
            let result = match &kind {
                SendKind::Direct { recipient } => {
                    if entering_flood {
                        // Clearing the path forces the device to flood.
                        if let Err(e) = session.reset_path(recipient).await {
                            tracing::warn!("path reset before flood retry failed: {e}");
                        }
                    }
                    session
                        .send_text(recipient, &text, next_attempt - 1, sender_ts)
                        .await
                }
                SendKind::Channel { index } => {
                    session.send_chan_text(*index, &text, sender_ts).await
                }
            };
            let _ = cmd_tx.send(EngineCmd::Resent {
                old_code: code,
                result,
            });
        });
    }

    async fn on_resent(&mut self, old_code: u32, result: Result<SendReceipt>) {
        match result {
            Ok(receipt) => {
                let message_id = {
                    let Some(send) = self.acks.get_mut(old_code) else {
                        // Acked (by the original attempt) while the resend
                        // was in flight; the duplicate's ack is stale.
                        return;
                    };
                    send.attempt += 1;
                    send.ack_code = receipt.ack_code();
                    send.sent_at = Instant::now();
                    send.timeout =
                        ack::buffered_timeout(&self.config, receipt.suggested_timeout_ms);
                    send.phase = SendPhase::AwaitingAck;
                    tracing::debug!(
                        message = %send.message_id,
                        attempt = send.attempt,
                        ack = send.ack_code,
                        "resent"
                    );
                    send.message_id
                };
                if let Some(send) = self.acks.resolve(old_code) {
                    self.acks.track(send);
                }
                if let Err(e) = self
                    .store
                    .update_message_status(message_id, MessageStatus::Sent)
                    .await
                {
                    tracing::warn!(message = %message_id, "status update failed: {e}");
                }
            }
            Err(e) => {
                let Some(send) = self.acks.get_mut(old_code) else {
                    return;
                };
                // The attempt was consumed even though the device refused
                // it; walk the ladder forward.
                tracing::warn!(message = %send.message_id, "resend failed: {e}");
                send.attempt += 1;
                let until = Instant::now() + ack::backoff_after(send.attempt);
                send.phase = SendPhase::BackingOff { until };
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(until).await;
                    let _ = cmd_tx.send(EngineCmd::RetryDue { ack_code: old_code });
                });
            }
        }
    }

    async fn fail_send(&mut self, send: PendingSend) {
        tracing::info!(message = %send.message_id, attempts = send.attempt, "send failed");
        if let Err(e) = self
            .store
            .update_message_status(send.message_id, MessageStatus::Failed)
            .await
        {
            tracing::warn!(message = %send.message_id, "status update failed: {e}");
        }
        self.notify(Notification::MessageFailed {
            message_id: send.message_id,
        });

        let ended_in_flood = ack::is_flood_attempt(&self.config, &send.kind, send.attempt);
        if ended_in_flood && self.config.trigger_path_discovery_after_flood {
            if let SendKind::Direct { recipient } = send.kind {
                let session = self.session.clone();
                tokio::spawn(async move {
                    tracing::debug!(recipient = %recipient, "path discovery after flood failure");
                    if let Err(e) = session.send_path_discovery(&recipient).await {
                        tracing::debug!("path discovery failed: {e}");
                    }
                });
            }
        }
    }

    // ==================== Inbound messages ====================

    fn on_direct_message(&mut self, message: ContactMessage) {
        let key = dedup::direct_key(message.sender_ts, &message.text);
        if !self
            .dedup
            .observe(Peer::Direct(message.sender_prefix), &key)
        {
            tracing::debug!(sender = %message.sender_prefix, "duplicate direct message dropped");
            return;
        }
        self.notify(Notification::InboundDirect {
            message_id: Uuid::new_v4(),
            message,
        });
    }

    fn on_channel_message(&mut self, message: ChannelMessage) {
        let (sender_name, body) = split_channel_text(&message.text);
        let sender_name = sender_name.to_string();
        let body = body.to_string();

        let key = dedup::channel_key(message.sender_ts, &sender_name, &body);
        if !self
            .dedup
            .observe(Peer::Channel(message.channel_index), &key)
        {
            tracing::debug!(channel = message.channel_index, "duplicate channel message dropped");
            return;
        }

        if let Some(parsed) = reaction::parse_reaction(&body) {
            match self
                .reactions
                .resolve(&parsed, message.channel_index, &sender_name, &body)
            {
                Resolution::Resolved { target } => {
                    self.notify(Notification::ReactionResolved {
                        target_message_id: target,
                        channel_index: message.channel_index,
                        emoji: parsed.emoji,
                        sender_name,
                    });
                }
                Resolution::Deferred => {
                    tracing::debug!(
                        channel = message.channel_index,
                        "reaction target unknown, queued"
                    );
                }
                Resolution::Unresolvable => {
                    tracing::debug!(
                        channel = message.channel_index,
                        "reaction preview mismatch, dropped"
                    );
                }
            }
            return;
        }

        let message_id = Uuid::new_v4();
        self.index_message(IndexedMessage::new(
            message_id,
            message.channel_index,
            &sender_name,
            &body,
            message.sender_ts,
        ));
        self.notify(Notification::InboundChannel {
            message_id,
            message,
            sender_name,
            body,
        });
    }

    fn index_message(&mut self, indexed: IndexedMessage) {
        let channel_index = indexed.channel_index;
        for (pending, target) in self.reactions.insert(indexed) {
            self.notify(Notification::ReactionResolved {
                target_message_id: target,
                channel_index,
                emoji: pending.parsed.emoji,
                sender_name: pending.sender_name,
            });
        }
    }

    // ==================== Auto-fetch ====================

    /// Drains the device message queue. One pass at a time; repeat
    /// signals while a pass runs are ignored.
    fn start_fetch(&mut self) {
        if self.fetch_task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::trace!("fetch already running");
            return;
        }

        let session = self.session.clone();
        let cmd_tx = self.cmd_tx.clone();
        self.fetch_task = Some(tokio::spawn(async move {
            let mut fetched = 0usize;
            loop {
                match session.sync_next_message().await {
                    Ok(SyncedMessage::NoMore) => break,
                    Ok(synced) => {
                        fetched += 1;
                        if cmd_tx.send(EngineCmd::Inbound(synced)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("message fetch aborted: {e}");
                        break;
                    }
                }
            }
            tracing::debug!(fetched, "message fetch complete");
            let _ = cmd_tx.send(EngineCmd::FetchDone { fetched });
        }));
    }
}

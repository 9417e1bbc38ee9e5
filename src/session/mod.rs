//! The session actor: exclusive owner of a transport.
//!
//! A [`Session`] is a cloneable handle to a single-owner task that holds
//! the transport for the lifetime of one connection. The task linearizes
//! command submissions, correlates each with the next inbound response of
//! the expected category, chunks writes to the transport MTU, enforces
//! per-operation timeouts, and forwards everything unsolicited to the
//! [`EventBus`].
//!
//! Lifecycle: `disconnected -> connecting -> connected -> ready`. The
//! handshake (`deviceQuery` then `appStart`) runs inside
//! [`Session::connect`]; failure tears the connection down with
//! [`Error::HandshakeFailed`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::protocol::command;
use crate::transport::Transport;
use crate::types::{
    BatteryStatus, ChannelInfo, ChannelMessage, Contact, ContactMessage, DeviceInfo, DeviceStats,
    PublicKey, SelfInfo, TelemetryReading,
};

/// Consecutive parse failures after which the link is considered dead.
const MAX_CONSECUTIVE_PARSE_FAILURES: u32 = 5;

/// Protocol version advertised in the handshake `deviceQuery`.
const PROTOCOL_VERSION: u8 = 3;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport link.
    Disconnected,
    /// Transport link being established.
    Connecting,
    /// Link up, handshake not yet complete.
    Connected,
    /// Handshake complete; commands accepted.
    Ready,
}

/// Identity captured during the handshake.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Device info from `deviceQuery`.
    pub device: DeviceInfo,
    /// Node self info from `appStart`.
    pub node: SelfInfo,
}

/// Device receipt for an accepted send.
#[derive(Debug, Clone, Copy)]
pub struct SendReceipt {
    /// Message type echo.
    pub text_type: u8,
    /// Raw expected ack bytes.
    pub expected_ack: [u8; 4],
    /// Device-suggested ack timeout in milliseconds.
    pub suggested_timeout_ms: u32,
}

impl SendReceipt {
    /// The expected ack decoded as the little-endian tracking key.
    #[must_use]
    pub const fn ack_code(&self) -> u32 {
        u32::from_le_bytes(self.expected_ack)
    }
}

/// One message popped by `syncNextMessage`.
#[derive(Debug, Clone)]
pub enum SyncedMessage {
    /// A direct message.
    Direct(ContactMessage),
    /// A channel message.
    Channel(ChannelMessage),
    /// The device queue is empty.
    NoMore,
}

/// Assembled result of a `getContacts` envelope.
#[derive(Debug, Clone)]
pub struct ContactSync {
    /// Contacts received, in arrival order.
    pub contacts: Vec<Contact>,
    /// Device-side last modification timestamp.
    pub last_modified: u32,
    /// True when fewer contacts arrived than the envelope announced.
    pub interrupted: bool,
}

/// Response category a submitted command waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// `ok`/`disabled` (or an error reply).
    Status,
    DeviceInfo,
    SelfInfo,
    CurrentTime,
    Battery,
    ChannelInfo,
    MessageSent,
    /// One synced message or the end-of-queue marker.
    SyncedMessage,
    /// A single contact record.
    Contact,
    Stats,
    Telemetry,
    /// The `contactsStart .. contactsEnd` envelope.
    Contacts,
}

impl Expect {
    /// Whether an event belongs to this category. Error replies satisfy
    /// every category.
    fn matches(self, event: &Event) -> bool {
        if matches!(event, Event::Error { .. }) {
            return true;
        }
        match self {
            Self::Status => matches!(event, Event::Ok { .. } | Event::Disabled),
            Self::DeviceInfo => matches!(event, Event::DeviceInfo(_)),
            Self::SelfInfo => matches!(event, Event::SelfInfo(_)),
            Self::CurrentTime => matches!(event, Event::CurrentTime(_)),
            Self::Battery => matches!(event, Event::Battery(_)),
            Self::ChannelInfo => matches!(event, Event::ChannelInfo(_)),
            Self::MessageSent => matches!(event, Event::MessageSent { .. }),
            Self::SyncedMessage => matches!(
                event,
                Event::ContactMessage(_) | Event::ChannelMessage(_) | Event::NoMoreMessages
            ),
            Self::Contact => matches!(event, Event::Contact(_)),
            Self::Stats => matches!(event, Event::Stats(_) | Event::Disabled),
            Self::Telemetry => matches!(event, Event::TelemetryResponse { .. }),
            Self::Contacts => matches!(
                event,
                Event::ContactsStart { .. } | Event::Contact(_) | Event::ContactsEnd { .. }
            ),
        }
    }
}

/// Typed result of a completed waiter.
enum Outcome {
    Event(Event),
    Contacts(ContactSync),
}

struct Submit {
    frame: Bytes,
    expect: Expect,
    timeout: Duration,
    reply: oneshot::Sender<Result<Outcome>>,
}

/// Handle to a connected session.
#[derive(Clone)]
pub struct Session {
    submit_tx: mpsc::Sender<Submit>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<SessionState>,
    bus: EventBus,
    config: Arc<Config>,
    info: Arc<SessionInfo>,
}

impl Session {
    /// Connects over the given transport, runs the handshake, and returns
    /// a ready session.
    ///
    /// The transport is owned by the session task until disconnect.
    pub async fn connect<T: Transport>(
        mut transport: T,
        config: Config,
        bus: EventBus,
    ) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        state_tx.send_replace(SessionState::Connecting);
        transport.connect().await?;
        let frames = transport.frames()?;
        state_tx.send_replace(SessionState::Connected);

        let (submit_tx, submit_rx) = mpsc::channel(32);
        let task = SessionTask {
            transport,
            frames,
            submit_rx,
            shutdown_rx,
            state_tx: Arc::clone(&state_tx),
            bus: bus.clone(),
            consecutive_parse_failures: 0,
        };
        tokio::spawn(task.run());

        let config = Arc::new(config);
        let info = match handshake(&submit_tx, &config).await {
            Ok(info) => info,
            Err(e) => {
                let _ = shutdown_tx.send(true);
                return Err(Error::HandshakeFailed {
                    reason: e.to_string(),
                });
            }
        };

        state_tx.send_replace(SessionState::Ready);
        tracing::info!(node = %info.node.name, "session ready");
        Ok(Self {
            submit_tx,
            shutdown_tx,
            state_rx,
            bus,
            config,
            info: Arc::new(info),
        })
    }

    /// The event bus this session publishes pushes to.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Identity captured during the handshake.
    #[must_use]
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// The configuration this session runs with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Disconnects, cancelling all in-flight waiters.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx
            .wait_for(|state| *state == SessionState::Disconnected)
            .await;
    }

    async fn submit(&self, frame: Bytes, expect: Expect, timeout: Duration) -> Result<Outcome> {
        submit_on(&self.submit_tx, frame, expect, timeout).await
    }

    async fn submit_event(&self, frame: Bytes, expect: Expect) -> Result<Event> {
        match self
            .submit(frame, expect, self.config.default_timeout)
            .await?
        {
            Outcome::Event(event) => Ok(event),
            Outcome::Contacts(_) => Err(Error::InvalidResponse {
                reason: "unexpected contact list".into(),
            }),
        }
    }

    /// Submits a command that answers with `ok`.
    async fn submit_status(&self, frame: Bytes) -> Result<Option<u32>> {
        match self.submit_event(frame, Expect::Status).await? {
            Event::Ok { value } => Ok(value),
            Event::Disabled => Err(Error::Device { code: None }),
            other => Err(unexpected(&other)),
        }
    }

    // ==================== Device ====================

    /// Reads the device clock.
    pub async fn get_device_time(&self) -> Result<u32> {
        match self
            .submit_event(command::get_device_time(), Expect::CurrentTime)
            .await?
        {
            Event::CurrentTime(ts) => Ok(ts),
            other => Err(unexpected(&other)),
        }
    }

    /// Sets the device clock.
    pub async fn set_device_time(&self, timestamp: u32) -> Result<()> {
        self.submit_status(command::set_device_time(timestamp))
            .await
            .map(|_| ())
    }

    /// Reads battery and storage status.
    pub async fn get_battery(&self) -> Result<BatteryStatus> {
        match self
            .submit_event(command::get_battery_and_storage(), Expect::Battery)
            .await?
        {
            Event::Battery(status) => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    /// Reboots the device.
    pub async fn reboot(&self) -> Result<()> {
        self.submit_status(command::reboot()).await.map(|_| ())
    }

    /// Factory-resets the device.
    pub async fn factory_reset(&self) -> Result<()> {
        self.submit_status(command::factory_reset())
            .await
            .map(|_| ())
    }

    /// Reads device statistics.
    pub async fn get_stats(&self) -> Result<DeviceStats> {
        match self.submit_event(command::get_stats(), Expect::Stats).await? {
            Event::Stats(stats) => Ok(stats),
            Event::Disabled => Err(Error::Device { code: None }),
            other => Err(unexpected(&other)),
        }
    }

    // ==================== Radio ====================

    /// Sets radio parameters.
    pub async fn set_radio_params(&self, freq_khz: u32, bw_hz: u32, sf: u8, cr: u8) -> Result<()> {
        self.submit_status(command::set_radio_params(freq_khz, bw_hz, sf, cr))
            .await
            .map(|_| ())
    }

    /// Sets TX power in dBm.
    pub async fn set_radio_tx_power(&self, dbm: i8) -> Result<()> {
        self.submit_status(command::set_radio_tx_power(dbm))
            .await
            .map(|_| ())
    }

    /// Sends a self advertisement, flooded when requested.
    pub async fn send_self_advert(&self, flood: bool) -> Result<()> {
        self.submit_status(command::send_self_advert(flood))
            .await
            .map(|_| ())
    }

    /// Sets the advertised node name.
    pub async fn set_advert_name(&self, name: &str) -> Result<()> {
        self.submit_status(command::set_advert_name(name))
            .await
            .map(|_| ())
    }

    /// Sets the advertised coordinates in degrees.
    pub async fn set_advert_lat_lon(&self, latitude: f64, longitude: f64) -> Result<()> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::BadArgument {
                reason: format!("latitude {latitude} out of range"),
            });
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::BadArgument {
                reason: format!("longitude {longitude} out of range"),
            });
        }
        self.submit_status(command::set_advert_lat_lon(latitude, longitude))
            .await
            .map(|_| ())
    }

    /// Reads tuning parameters.
    pub async fn get_tuning_params(&self) -> Result<Option<u32>> {
        self.submit_status(command::get_tuning_params()).await
    }

    // ==================== Messaging ====================

    /// Sends a direct text message; returns the device's send receipt.
    pub async fn send_text(
        &self,
        recipient: &PublicKey,
        text: &str,
        attempt: u8,
        sender_ts: u32,
    ) -> Result<SendReceipt> {
        let frame = command::send_text(0, attempt, sender_ts, recipient, text);
        self.expect_receipt(frame).await
    }

    /// Sends a channel text message; returns the device's send receipt.
    pub async fn send_chan_text(
        &self,
        channel: u8,
        text: &str,
        sender_ts: u32,
    ) -> Result<SendReceipt> {
        let frame = command::send_chan_text(0, channel, sender_ts, text);
        self.expect_receipt(frame).await
    }

    /// Pops the next queued inbound message.
    pub async fn sync_next_message(&self) -> Result<SyncedMessage> {
        match self
            .submit_event(command::sync_next_message(), Expect::SyncedMessage)
            .await?
        {
            Event::ContactMessage(msg) => Ok(SyncedMessage::Direct(*msg)),
            Event::ChannelMessage(msg) => Ok(SyncedMessage::Channel(*msg)),
            Event::NoMoreMessages => Ok(SyncedMessage::NoMore),
            other => Err(unexpected(&other)),
        }
    }

    async fn expect_receipt(&self, frame: Bytes) -> Result<SendReceipt> {
        match self.submit_event(frame, Expect::MessageSent).await? {
            Event::MessageSent {
                text_type,
                expected_ack,
                suggested_timeout_ms,
            } => Ok(SendReceipt {
                text_type,
                expected_ack,
                suggested_timeout_ms,
            }),
            other => Err(unexpected(&other)),
        }
    }

    // ==================== Contacts ====================

    /// Requests the contact list and assembles the multi-frame envelope.
    ///
    /// Returns a partial list flagged `interrupted` when the envelope
    /// closed early; callers may retry.
    pub async fn get_contacts(&self, since: Option<u32>) -> Result<ContactSync> {
        // A large table takes several seconds of notifications.
        let timeout = self.config.default_timeout.max(Duration::from_secs(15));
        match self
            .submit(command::get_contacts(since), Expect::Contacts, timeout)
            .await?
        {
            Outcome::Contacts(sync) => Ok(sync),
            Outcome::Event(other) => Err(unexpected(&other)),
        }
    }

    /// Adds or updates a contact on the device.
    pub async fn add_update_contact(&self, contact: &Contact) -> Result<()> {
        self.submit_status(command::add_update_contact(contact))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                // Errno 1 is the firmware's table-full report.
                Error::Device { code: Some(1) } => Error::ContactTableFull,
                other => other,
            })
    }

    /// Removes a contact from the device.
    pub async fn remove_contact(&self, public_key: &PublicKey) -> Result<()> {
        self.submit_status(command::remove_contact(public_key))
            .await
            .map(|_| ())
    }

    /// Fetches one contact record by key.
    pub async fn get_contact_by_key(&self, public_key: &PublicKey) -> Result<Contact> {
        match self
            .submit_event(command::get_contact_by_key(public_key), Expect::Contact)
            .await
        {
            Ok(Event::Contact(contact)) => Ok(*contact),
            Ok(other) => Err(unexpected(&other)),
            Err(Error::Device { .. }) => Err(Error::ContactNotFound),
            Err(e) => Err(e),
        }
    }

    /// Clears the contact's outbound path so it floods again.
    pub async fn reset_path(&self, public_key: &PublicKey) -> Result<()> {
        self.submit_status(command::reset_path(public_key))
            .await
            .map(|_| ())
    }

    /// Asks the device to share a contact over the mesh.
    pub async fn share_contact(&self, public_key: &PublicKey) -> Result<()> {
        self.submit_status(command::share_contact(public_key))
            .await
            .map(|_| ())
    }

    // ==================== Channels ====================

    /// Reads one channel configuration.
    pub async fn get_channel(&self, index: u8) -> Result<ChannelInfo> {
        match self
            .submit_event(command::get_channel(index), Expect::ChannelInfo)
            .await?
        {
            Event::ChannelInfo(info) => Ok(*info),
            other => Err(unexpected(&other)),
        }
    }

    /// Writes one channel configuration.
    pub async fn set_channel(&self, index: u8, name: &str, secret: &[u8; 16]) -> Result<()> {
        self.submit_status(command::set_channel(index, name, secret))
            .await
            .map(|_| ())
    }

    // ==================== Auth / remote nodes ====================

    /// Submits a login to a remote node. The outcome arrives later as a
    /// `loginSuccess`/`loginFail` push.
    pub async fn send_login(&self, public_key: &PublicKey, password: &str) -> Result<SendReceipt> {
        self.expect_receipt(command::send_login(public_key, password))
            .await
    }

    /// Checks whether the device holds a connection to a remote node.
    pub async fn has_connection(&self, public_key: &PublicKey) -> Result<bool> {
        match self.submit_status(command::has_connection(public_key)).await {
            Ok(_) => Ok(true),
            Err(Error::Device { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Logs out from a remote node.
    pub async fn logout(&self, public_key: &PublicKey) -> Result<()> {
        self.submit_status(command::logout(public_key))
            .await
            .map(|_| ())
    }

    /// Requests a remote node's status; the report arrives as a push.
    pub async fn send_status_req(&self, public_key: &PublicKey) -> Result<SendReceipt> {
        self.expect_receipt(command::send_status_req(public_key))
            .await
    }

    /// Requests remote telemetry; the report arrives as a push.
    pub async fn send_telemetry_req(&self, public_key: &PublicKey) -> Result<SendReceipt> {
        self.expect_receipt(command::send_telemetry_req(Some(public_key)))
            .await
    }

    /// Reads the local node's own telemetry.
    pub async fn get_self_telemetry(&self) -> Result<Vec<TelemetryReading>> {
        match self
            .submit_event(command::send_telemetry_req(None), Expect::Telemetry)
            .await?
        {
            Event::TelemetryResponse { readings, .. } => Ok(readings),
            other => Err(unexpected(&other)),
        }
    }

    /// Sends a typed binary request.
    pub async fn send_binary_req(
        &self,
        public_key: &PublicKey,
        request_type: u8,
        data: &[u8],
    ) -> Result<SendReceipt> {
        self.expect_receipt(command::send_binary_req(public_key, request_type, data))
            .await
    }

    /// Sends raw data along an explicit path.
    pub async fn send_raw_data(&self, path: &[u8], payload: &[u8]) -> Result<()> {
        self.submit_status(command::send_raw_data(path, payload))
            .await
            .map(|_| ())
    }

    /// Requests the advert path for a contact.
    pub async fn get_advert_path(&self, public_key: &PublicKey) -> Result<()> {
        self.submit_status(command::get_advert_path(public_key))
            .await
            .map(|_| ())
    }

    /// Starts a path discovery for a contact.
    pub async fn send_path_discovery(&self, public_key: &PublicKey) -> Result<SendReceipt> {
        self.expect_receipt(command::send_path_discovery(public_key))
            .await
    }

    /// Sends a trace path probe.
    pub async fn send_trace_path(
        &self,
        tag: u32,
        auth: u32,
        flags: u8,
        path: &[u8],
    ) -> Result<SendReceipt> {
        self.expect_receipt(command::send_trace_path(tag, auth, flags, path))
            .await
    }
}

fn unexpected(event: &Event) -> Error {
    Error::InvalidResponse {
        reason: format!("unexpected response: {event:?}"),
    }
}

async fn submit_on(
    submit_tx: &mpsc::Sender<Submit>,
    frame: Bytes,
    expect: Expect,
    timeout: Duration,
) -> Result<Outcome> {
    let (reply_tx, reply_rx) = oneshot::channel();
    submit_tx
        .send(Submit {
            frame,
            expect,
            timeout,
            reply: reply_tx,
        })
        .await
        .map_err(|_| Error::NotConnected)?;
    reply_rx.await.map_err(|_| Error::Cancelled)?
}

/// `deviceQuery` then `appStart`; both must answer for the session to be
/// ready. Runs with the pairing timeout since the link may still be
/// prompting the user.
async fn handshake(submit_tx: &mpsc::Sender<Submit>, config: &Config) -> Result<SessionInfo> {
    let device = match submit_on(
        submit_tx,
        command::device_query(PROTOCOL_VERSION),
        Expect::DeviceInfo,
        config.pairing_timeout,
    )
    .await?
    {
        Outcome::Event(Event::DeviceInfo(info)) => *info,
        Outcome::Event(other) => return Err(unexpected(&other)),
        Outcome::Contacts(_) => {
            return Err(Error::InvalidResponse {
                reason: "unexpected contact list".into(),
            });
        }
    };

    let node = match submit_on(
        submit_tx,
        command::app_start(&config.app_name),
        Expect::SelfInfo,
        config.pairing_timeout,
    )
    .await?
    {
        Outcome::Event(Event::SelfInfo(info)) => *info,
        Outcome::Event(other) => return Err(unexpected(&other)),
        Outcome::Contacts(_) => {
            return Err(Error::InvalidResponse {
                reason: "unexpected contact list".into(),
            });
        }
    };

    tracing::debug!(
        firmware = device.firmware_version,
        node = %node.name,
        "handshake complete"
    );
    Ok(SessionInfo { device, node })
}

/// In-flight waiter for one submitted command.
struct Waiter {
    expect: Expect,
    reply: oneshot::Sender<Result<Outcome>>,
    deadline: Instant,
    timeout: Duration,
    // getContacts assembly
    contacts: Vec<Contact>,
    expected_count: Option<u32>,
}

struct SessionTask<T: Transport> {
    transport: T,
    frames: mpsc::Receiver<Bytes>,
    submit_rx: mpsc::Receiver<Submit>,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: Arc<watch::Sender<SessionState>>,
    bus: EventBus,
    consecutive_parse_failures: u32,
}

impl<T: Transport> SessionTask<T> {
    async fn run(mut self) {
        self.run_inner().await;
        let _ = self.transport.disconnect().await;
        self.state_tx.send_replace(SessionState::Disconnected);
        tracing::info!("session closed");
    }

    #[allow(clippy::too_many_lines)]
    async fn run_inner(&mut self) {
        let mut waiter: Option<Waiter> = None;

        loop {
            // Drop the waiter if its submitter went away.
            if waiter.as_ref().is_some_and(|w| w.reply.is_closed()) {
                waiter = None;
            }
            let deadline = waiter
                .as_ref()
                .map_or_else(|| Instant::now() + Duration::from_secs(3600), |w| w.deadline);

            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        if let Some(w) = waiter.take() {
                            let _ = w.reply.send(Err(Error::Cancelled));
                        }
                        return;
                    }
                }
                maybe_frame = self.frames.recv() => {
                    let Some(frame) = maybe_frame else {
                        tracing::warn!("transport read stream closed");
                        if let Some(w) = waiter.take() {
                            let _ = w.reply.send(Err(Error::NotConnected));
                        }
                        return;
                    };
                    match self.handle_frame(&frame, &mut waiter) {
                        Ok(()) => {}
                        Err(()) => {
                            // Parse failures ran away; the link is noise.
                            if let Some(w) = waiter.take() {
                                let _ = w.reply.send(Err(Error::Cancelled));
                            }
                            return;
                        }
                    }
                }
                () = tokio::time::sleep_until(deadline), if waiter.is_some() => {
                    if let Some(w) = waiter.take() {
                        tracing::debug!(expect = ?w.expect, "command timed out");
                        let timeout_ms = u64::try_from(w.timeout.as_millis()).unwrap_or(u64::MAX);
                        let _ = w.reply.send(Err(Error::Timeout { timeout_ms }));
                    }
                }
                maybe_submit = self.submit_rx.recv(), if waiter.is_none() => {
                    let Some(submit) = maybe_submit else {
                        // Every handle dropped: the session ends.
                        return;
                    };
                    waiter = self.start_submit(submit).await;
                }
            }
        }
    }

    /// Writes the frame in MTU-sized chunks and installs the waiter.
    async fn start_submit(&mut self, submit: Submit) -> Option<Waiter> {
        let mtu = self.transport.mtu().max(1);
        let frame = submit.frame.clone();

        let mut offset = 0;
        while offset < frame.len() {
            let end = (offset + mtu).min(frame.len());
            if let Err(e) = self.transport.write(frame.slice(offset..end)).await {
                tracing::warn!("transport write failed: {}", e);
                let _ = submit.reply.send(Err(e));
                return None;
            }
            offset = end;
        }

        Some(Waiter {
            expect: submit.expect,
            reply: submit.reply,
            deadline: Instant::now() + submit.timeout,
            timeout: submit.timeout,
            contacts: Vec::new(),
            expected_count: None,
        })
    }

    /// Parses one frame, satisfying the waiter or publishing the event.
    ///
    /// `Err(())` means the consecutive-parse-failure budget is spent.
    fn handle_frame(&mut self, frame: &[u8], waiter: &mut Option<Waiter>) -> std::result::Result<(), ()> {
        let event = crate::protocol::parse_frame(frame);

        if let Event::ParseFailure { code, reason } = &event {
            self.consecutive_parse_failures += 1;
            tracing::warn!(
                code = *code,
                reason = %reason,
                run = self.consecutive_parse_failures,
                "frame parse failure"
            );
            self.bus.publish(&event);
            if self.consecutive_parse_failures >= MAX_CONSECUTIVE_PARSE_FAILURES {
                tracing::error!("too many consecutive parse failures, disconnecting");
                return Err(());
            }
            return Ok(());
        }
        self.consecutive_parse_failures = 0;

        match waiter.take() {
            Some(active) if active.expect.matches(&event) => {
                *waiter = Self::feed_waiter(active, event);
            }
            other => {
                *waiter = other;
                self.bus.publish(&event);
            }
        }
        Ok(())
    }

    /// Feeds one matching event to the waiter. Returns the waiter when a
    /// multi-frame category is still assembling, `None` once replied.
    fn feed_waiter(mut active: Waiter, event: Event) -> Option<Waiter> {
        if let Event::Error { code } = &event {
            let _ = active.reply.send(Err(Error::Device { code: *code }));
            return None;
        }

        if active.expect == Expect::Contacts {
            match event {
                Event::ContactsStart { count } => {
                    active.expected_count = Some(count);
                    return Some(active);
                }
                Event::Contact(contact) => {
                    active.contacts.push(*contact);
                    return Some(active);
                }
                Event::ContactsEnd { last_modified } => {
                    let received = active.contacts.len();
                    let interrupted = active
                        .expected_count
                        .is_some_and(|count| received < count as usize);
                    if interrupted {
                        tracing::warn!(
                            expected = active.expected_count,
                            received,
                            "contact sync interrupted"
                        );
                    }
                    let _ = active.reply.send(Ok(Outcome::Contacts(ContactSync {
                        contacts: active.contacts,
                        last_modified,
                        interrupted,
                    })));
                    return None;
                }
                _ => return Some(active),
            }
        }

        let _ = active.reply.send(Ok(Outcome::Event(event)));
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Filter;
    use crate::testutil::{
        ack_frame, device_info_frame, ready_session, self_info_frame,
    };
    use crate::transport::mock::MockTransport;

    fn time_frame(ts: u32) -> Vec<u8> {
        let mut frame = vec![0x09];
        frame.extend_from_slice(&ts.to_le_bytes());
        frame
    }

    #[tokio::test]
    async fn test_handshake_populates_info() {
        let (session, _device) = ready_session(240, Config::default()).await;
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.info().device.firmware_version, 1);
        assert_eq!(session.info().node.name, "TestNode");
        assert_eq!(session.info().node.public_key.as_bytes(), &[0x42; 32]);
    }

    #[tokio::test]
    async fn test_handshake_failure_disconnects() {
        let (transport, mut device) = MockTransport::new(240);
        let bus = EventBus::new();

        let connect = Session::connect(transport, Config::default(), bus);
        let script = async {
            let query = device.next_write().await;
            assert_eq!(query[0], 0x16);
            // Device refuses the query.
            device.push_frame(vec![0x01, 0x07]).await;
            device
        };

        let (result, _device) = tokio::join!(connect, script);
        assert!(matches!(result, Err(Error::HandshakeFailed { .. })));
    }

    #[tokio::test]
    async fn test_battery_roundtrip() {
        let (session, mut device) = ready_session(240, Config::default()).await;

        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame.as_ref(), &[0x14]);
            device.push_frame(vec![0x0C, 0x68, 0x10]).await;
        };
        let (battery, ()) = tokio::join!(session.get_battery(), script);
        assert_eq!(battery.unwrap().level_mv, 4200);
    }

    #[tokio::test]
    async fn test_device_error_is_surfaced() {
        let (session, mut device) = ready_session(240, Config::default()).await;

        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame[0], 0x0D, "resetPath opcode");
            device.push_frame(vec![0x01, 0x04]).await;
        };
        let key = PublicKey::from_bytes(&[1; 32]);
        let (result, ()) = tokio::join!(session.reset_path(&key), script);
        assert!(matches!(result, Err(Error::Device { code: Some(4) })));
    }

    #[tokio::test]
    async fn test_submissions_answered_in_order() {
        let (session, mut device) = ready_session(240, Config::default()).await;

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.get_device_time().await })
        };
        // First command reaches the device before the second submits.
        let frame = device.next_write().await;
        assert_eq!(frame.as_ref(), &[0x05]);

        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.get_device_time().await })
        };

        device.push_frame(time_frame(111)).await;
        let frame = device.next_write().await;
        assert_eq!(frame.as_ref(), &[0x05]);
        device.push_frame(time_frame(222)).await;

        assert_eq!(first.await.unwrap().unwrap(), 111);
        assert_eq!(second.await.unwrap().unwrap(), 222);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_disconnect() {
        let (session, mut device) = ready_session(240, Config::default()).await;

        let result = session.get_device_time().await;
        assert!(matches!(result, Err(Error::Timeout { timeout_ms: 5000 })));
        assert_eq!(session.state(), SessionState::Ready);

        // Drain the unanswered request, then verify the session still
        // serves commands.
        let _ = device.next_write().await;
        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame.as_ref(), &[0x05]);
            device.push_frame(time_frame(7)).await;
        };
        let (time, ()) = tokio::join!(session.get_device_time(), script);
        assert_eq!(time.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_writes_are_chunked_to_mtu() {
        let (session, mut device) = ready_session(8, Config::default()).await;

        let key = PublicKey::from_bytes(&[5; 32]);
        let script = async {
            let mut reassembled = Vec::new();
            while reassembled.len() < 33 {
                let chunk = device.next_write().await;
                assert!(chunk.len() <= 8, "chunk exceeds mtu: {}", chunk.len());
                reassembled.extend_from_slice(&chunk);
            }
            assert_eq!(reassembled[0], 0x0D);
            assert_eq!(&reassembled[1..], key.as_bytes());
            device.push_frame(vec![0x00]).await;
        };
        let (result, ()) = tokio::join!(session.reset_path(&key), script);
        result.unwrap();
    }

    fn contact_record(pk_byte: u8, name: &str) -> Vec<u8> {
        let mut record = vec![0u8; crate::protocol::CONTACT_FRAME_LEN];
        record[..32].copy_from_slice(&[pk_byte; 32]);
        record[32] = 1;
        record[34] = 0xFF; // flood
        record[99..99 + name.len()].copy_from_slice(name.as_bytes());
        record
    }

    #[tokio::test]
    async fn test_contact_sync_assembles_envelope() {
        let (session, mut device) = ready_session(240, Config::default()).await;

        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame.as_ref(), &[0x04]);

            device.push_frame(vec![0x02, 2, 0, 0, 0]).await;
            let mut first = vec![0x03];
            first.extend_from_slice(&contact_record(0xAA, "Alpha"));
            device.push_frame(first).await;
            let mut second = vec![0x03];
            second.extend_from_slice(&contact_record(0xBB, "Beta"));
            device.push_frame(second).await;
            let mut end = vec![0x04];
            end.extend_from_slice(&500u32.to_le_bytes());
            device.push_frame(end).await;
        };
        let (sync, ()) = tokio::join!(session.get_contacts(None), script);
        let sync = sync.unwrap();
        assert_eq!(sync.contacts.len(), 2);
        assert_eq!(sync.contacts[0].name, "Alpha");
        assert_eq!(sync.contacts[1].name, "Beta");
        assert_eq!(sync.last_modified, 500);
        assert!(!sync.interrupted);
    }

    #[tokio::test]
    async fn test_partial_contact_sync_is_marked_interrupted() {
        let (session, mut device) = ready_session(240, Config::default()).await;

        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame[0], 0x04);
            assert_eq!(&frame[1..5], &100u32.to_le_bytes());

            device.push_frame(vec![0x02, 3, 0, 0, 0]).await;
            let mut only = vec![0x03];
            only.extend_from_slice(&contact_record(0xAA, "Alpha"));
            device.push_frame(only).await;
            let mut end = vec![0x04];
            end.extend_from_slice(&600u32.to_le_bytes());
            device.push_frame(end).await;
        };
        let (sync, ()) = tokio::join!(session.get_contacts(Some(100)), script);
        let sync = sync.unwrap();
        assert_eq!(sync.contacts.len(), 1);
        assert!(sync.interrupted);
    }

    #[tokio::test]
    async fn test_pushes_reach_bus_while_command_pending() {
        let (session, mut device) = ready_session(240, Config::default()).await;
        let mut acks = session.bus().subscribe(Filter::any_acknowledgement());

        let script = async {
            let _ = device.next_write().await;
            // Unsolicited push arrives before the command's response.
            device.push_frame(ack_frame([1, 2, 3, 4])).await;
            device.push_frame(time_frame(9)).await;
        };
        let (time, ()) = tokio::join!(session.get_device_time(), script);
        assert_eq!(time.unwrap(), 9);

        let Some(Event::Acknowledgement(ack)) = acks.recv().await else {
            panic!("push not delivered to bus");
        };
        assert_eq!(ack.code, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_parse_failure_run_disconnects() {
        let (session, device) = ready_session(240, Config::default()).await;

        for _ in 0..5 {
            device.push_frame(vec![0xF7, 0x00]).await;
        }

        let mut state_rx = session.state_rx.clone();
        state_rx
            .wait_for(|s| *s == SessionState::Disconnected)
            .await
            .unwrap();
        assert!(matches!(
            session.get_device_time().await,
            Err(Error::NotConnected | Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_submit() {
        let (session, mut device) = ready_session(240, Config::default()).await;

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.get_device_time().await })
        };
        let _ = device.next_write().await;

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_link_loss_fails_waiter() {
        let (session, mut device) = ready_session(240, Config::default()).await;

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.get_device_time().await })
        };
        let _ = device.next_write().await;
        drop(device); // link gone

        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::NotConnected)
        ));
        let mut state_rx = session.state_rx.clone();
        state_rx
            .wait_for(|s| *s == SessionState::Disconnected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_text_receipt() {
        let (session, mut device) = ready_session(240, Config::default()).await;

        let key = PublicKey::from_bytes(&[7; 32]);
        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame[0], 0x02);
            assert_eq!(&frame[7..13], &[7u8; 6]);
            device
                .push_frame(crate::testutil::message_sent_frame(
                    [0xDE, 0xAD, 0xBE, 0xEF],
                    1000,
                ))
                .await;
        };
        let (receipt, ()) = tokio::join!(session.send_text(&key, "hi", 0, 42), script);
        let receipt = receipt.unwrap();
        assert_eq!(receipt.ack_code(), 0xEFBE_ADDE);
        assert_eq!(receipt.suggested_timeout_ms, 1000);
    }

    #[tokio::test]
    async fn test_self_telemetry_roundtrip() {
        let (session, mut device) = ready_session(240, Config::default()).await;

        let script = async {
            let frame = device.next_write().await;
            assert_eq!(frame.as_ref(), &[0x27, 0, 0, 0], "self request carries no key");
            // [reserved][prefix:6][lpp: channel 1 temperature 25.0]
            let mut reply = vec![0x8B, 0x00];
            reply.extend_from_slice(&[0x42; 6]);
            reply.extend_from_slice(&[0x01, 0x67, 0xFA, 0x00]);
            device.push_frame(reply).await;
        };
        let (readings, ()) = tokio::join!(session.get_self_telemetry(), script);
        let readings = readings.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(
            readings[0].value,
            crate::types::TelemetryValue::Temperature(25.0)
        );
    }

    // Keep the helper imports exercised even when individual tests are
    // filtered out.
    #[test]
    fn test_frame_helpers_shape() {
        assert_eq!(device_info_frame()[0], 0x0D);
        assert_eq!(self_info_frame("n", 1)[0], 0x05);
    }
}

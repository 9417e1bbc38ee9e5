//! # meshmate
//!
//! Companion-host library for LoRa mesh radios reached over a
//! point-to-point serial transport (USB serial, or any reliable byte
//! channel delivering one frame per notification).
//!
//! The library speaks the node's request/response wire protocol, keeps an
//! authoritative cached view of contacts, channels and device state in a
//! pluggable store, and delivers messages across the mesh with retry,
//! flood fallback and at-least-once acknowledgment semantics.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use meshmate::reliability::Engine;
//! use meshmate::services::MessageService;
//! use meshmate::store::MemoryStore;
//! use meshmate::{Config, EventBus, SerialTransport, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meshmate::Error> {
//!     let transport = SerialTransport::with_port("/dev/ttyUSB0");
//!     let bus = EventBus::new();
//!     let session = Session::connect(transport, Config::new("myhost"), bus).await?;
//!     println!("connected to {}", session.info().node.name);
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let engine = Engine::spawn(session.clone(), store.clone());
//!     let messages = MessageService::new(session.clone(), store, engine);
//!     let _persist = messages.run_inbound();
//!
//!     let battery = session.get_battery().await?;
//!     println!("battery: {}mV", battery.level_mv);
//!
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Pure wire codec (command builders, frame parser)
//! - [`types`] - Data structures (contacts, devices, messages, telemetry)
//! - [`event`] - Parsed event algebra, filters and the event bus
//! - [`session`] - Transport-owning actor: handshake, correlation,
//!   chunking, timeouts
//! - [`reliability`] - Ack tracking, retry ladder, dedup, reactions,
//!   auto-fetch
//! - [`services`] - Message/contact/channel/remote-node facades
//! - [`store`] - Persistence contract and the in-memory reference store
//! - [`transport`] - Transport contract and the serial implementation

pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
pub mod reliability;
pub mod services;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenience
pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventBus, Filter, Subscription};
pub use protocol::{CommandOpcode, PacketType};
pub use session::{ContactSync, SendReceipt, Session, SessionInfo, SessionState, SyncedMessage};
pub use transport::{SerialTransport, Transport, serial::list_ports};
pub use types::{
    Acknowledgement, BatteryStatus, ChannelInfo, ChannelMessage, Contact, ContactFlags,
    ContactMessage, ContactType, DeviceInfo, DeviceStats, KeyPrefix, Message, MessageStatus,
    PublicKey, RadioConfig, RemoteNodeStatus, SelfInfo, TextType,
};

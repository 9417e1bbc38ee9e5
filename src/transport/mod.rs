//! Transport layer abstraction.
//!
//! A transport is any reliable point-to-point byte channel that delivers
//! one protocol frame per notification (BLE characteristic notify, a
//! length-framed serial stream, a test harness). The session owns its
//! transport exclusively for the connection lifetime.

pub mod framing;
pub mod serial;

#[cfg(test)]
pub(crate) mod mock;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;

/// Trait for transport implementations.
pub trait Transport: Send + 'static {
    /// Connects to the device.
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Disconnects from the device.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Writes one chunk to the device. Chunks never exceed [`Self::mtu`].
    fn write(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Takes the inbound frame stream.
    ///
    /// Each received item is one complete protocol frame. May only be
    /// called once per connection; the channel closes on link loss.
    fn frames(&mut self) -> Result<mpsc::Receiver<Bytes>>;

    /// Maximum single-write payload length.
    fn mtu(&self) -> usize;

    /// Returns true if connected.
    fn is_connected(&self) -> bool;
}

pub use serial::SerialTransport;

//! In-memory transport for session and engine tests.

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::transport::Transport;

/// Script handle paired with a [`MockTransport`]: observe writes, inject
/// frames.
pub struct MockDevice {
    write_rx: mpsc::UnboundedReceiver<Bytes>,
    inject_tx: mpsc::Sender<Bytes>,
}

impl MockDevice {
    /// Awaits the next frame chunk written by the host.
    pub async fn next_write(&mut self) -> Bytes {
        self.write_rx.recv().await.expect("transport gone")
    }

    /// Injects one inbound frame, as if the node had sent it.
    ///
    /// Dropping the `MockDevice` closes the stream, which the session
    /// observes as link loss.
    pub async fn push_frame(&self, frame: impl Into<Bytes>) {
        self.inject_tx
            .send(frame.into())
            .await
            .expect("mock transport closed");
    }
}

/// A transport whose device side is driven by a [`MockDevice`].
pub struct MockTransport {
    write_tx: mpsc::UnboundedSender<Bytes>,
    frame_rx: Option<mpsc::Receiver<Bytes>>,
    mtu: usize,
    connected: bool,
}

impl MockTransport {
    /// Creates a transport/device pair with the given MTU.
    pub fn new(mtu: usize) -> (Self, MockDevice) {
        let (inject_tx, frame_rx) = mpsc::channel(64);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let device = MockDevice {
            write_rx,
            inject_tx,
        };
        (
            Self {
                write_tx,
                frame_rx: Some(frame_rx),
                mtu,
                connected: false,
            },
            device,
        )
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.connected = true;
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.connected = false;
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        let _ = self.write_tx.send(data);
        Box::pin(async move { Ok(()) })
    }

    fn frames(&mut self) -> Result<mpsc::Receiver<Bytes>> {
        Ok(self.frame_rx.take().expect("frames taken twice"))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

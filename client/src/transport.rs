//! Transport collaborator.
//!
//! The client only needs to push text frames; the connection itself
//! (websocket, stdio, test harness) belongs to the caller, which feeds
//! received frames to [`SyncClient::receive`](crate::SyncClient::receive).

use tokio::sync::mpsc;

use crate::error::{ClientError, Result};

/// Outgoing half of a connection.
pub trait Transport: Send + Sync {
    /// Send one channel-prefixed message.
    fn send(&self, message: String) -> Result<()>;
}

/// Sender for outbound messages.
pub type MessageSender = mpsc::UnboundedSender<String>;

/// Transport that hands messages to a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: MessageSender,
}

impl ChannelTransport {
    pub fn new(sender: MessageSender) -> Self {
        Self { sender }
    }

    /// Create a transport and the receiver its messages arrive on.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: String) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| ClientError::Transport("connection closed".into()))
    }
}

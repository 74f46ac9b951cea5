//! The connection capability: how the broadcaster reaches one client.
//!
//! Transports wrap their socket in this trait; the shipped
//! [`ChannelConnection`] bridges to a tokio channel and doubles as the
//! test double.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::messages::ServerMessage;

pub type ConnectionId = Uuid;

/// A send failed because the peer is gone.
#[derive(Debug)]
pub struct ConnectionClosed;

impl std::fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection closed")
    }
}

impl std::error::Error for ConnectionClosed {}

/// One client connection.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Deliver one frame. May block on a slow client; the broadcaster
    /// wraps this in a timeout.
    async fn send(&self, message: &ServerMessage) -> Result<(), ConnectionClosed>;

    fn is_open(&self) -> bool;
}

/// Channel-backed connection: frames land in a bounded tokio channel.
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
}

impl ChannelConnection {
    /// A connection plus the receiving end. The capacity bounds how many
    /// undelivered frames a slow client may pile up.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait::async_trait]
impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, message: &ServerMessage) -> Result<(), ConnectionClosed> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ServerMessage;

    #[tokio::test]
    async fn frames_flow_through_the_channel() {
        let (conn, mut rx) = ChannelConnection::pair(4);
        assert!(conn.is_open());
        conn.send(&ServerMessage::Connected {
            connection_id: conn.id().to_string(),
        })
        .await
        .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::Connected { .. })
        ));

        drop(rx);
        assert!(!conn.is_open());
        assert!(conn
            .send(&ServerMessage::Connected {
                connection_id: "x".into()
            })
            .await
            .is_err());
    }
}

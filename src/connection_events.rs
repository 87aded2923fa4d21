use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::trace;
use crate::ids::ConnId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// a client connected; sent when the server acknowledges its `Connect`
    Connected { conn_id: ConnId, peer: SocketAddr },
    /// the connection exceeded the idle epoch limit
    Lost { conn_id: ConnId },
    /// the connection was closed locally and is gone from the connection table
    Closed { conn_id: ConnId },
}

impl ConnectionEvent {
    pub fn conn_id(&self) -> ConnId {
        match self {
            ConnectionEvent::Connected { conn_id, .. } => *conn_id,
            ConnectionEvent::Lost { conn_id } => *conn_id,
            ConnectionEvent::Closed { conn_id } => *conn_id,
        }
    }
}

pub struct ConnectionEventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
}
impl ConnectionEventNotifier {
    pub fn new() -> ConnectionEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ConnectionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

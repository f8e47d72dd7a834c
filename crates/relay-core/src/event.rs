//! Network events delivered to the host application

use crate::identity::ConnectionId;

/// Kind of a [`NetworkEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkEventKind {
    Connected,
    Disconnected,
    Message,
}

/// Event produced by the driver and popped once per tick.
///
/// Message payloads are owned: each event holds its own copy of the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A peer finished connecting
    Connected { connection: ConnectionId },
    /// A peer went away (remote close, timeout or transport error)
    Disconnected { connection: ConnectionId },
    /// A peer sent a message
    Message {
        connection: ConnectionId,
        payload: Vec<u8>,
    },
}

impl NetworkEvent {
    pub fn kind(&self) -> NetworkEventKind {
        match self {
            NetworkEvent::Connected { .. } => NetworkEventKind::Connected,
            NetworkEvent::Disconnected { .. } => NetworkEventKind::Disconnected,
            NetworkEvent::Message { .. } => NetworkEventKind::Message,
        }
    }

    /// Connection the event originated from
    pub fn connection(&self) -> ConnectionId {
        match self {
            NetworkEvent::Connected { connection }
            | NetworkEvent::Disconnected { connection }
            | NetworkEvent::Message { connection, .. } => *connection,
        }
    }

    /// Payload bytes, present only for messages
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            NetworkEvent::Message { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Build a message event by copying `bytes`
    pub fn message(connection: ConnectionId, bytes: &[u8]) -> Self {
        NetworkEvent::Message {
            connection,
            payload: bytes.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let event = NetworkEvent::message(ConnectionId(3), b"hi");
        assert_eq!(event.kind(), NetworkEventKind::Message);
        assert_eq!(event.connection(), ConnectionId(3));
        assert_eq!(event.payload(), Some(&b"hi"[..]));

        let event = NetworkEvent::Connected {
            connection: ConnectionId(4),
        };
        assert_eq!(event.kind(), NetworkEventKind::Connected);
        assert!(event.payload().is_none());
    }
}

//! Channel kinds and transport reliability

use serde::{Deserialize, Serialize};

/// Quality of service requested by the application for a send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    None,
    Unreliable,
    UnreliableOrdered,
    Reliable,
    ReliableOrdered,
}

impl ChannelKind {
    /// Every channel kind, in declaration order
    pub const ALL: [ChannelKind; 5] = [
        ChannelKind::None,
        ChannelKind::Unreliable,
        ChannelKind::UnreliableOrdered,
        ChannelKind::Reliable,
        ChannelKind::ReliableOrdered,
    ];

    /// Reliability level the transport uses for this channel.
    ///
    /// Ordering is not tracked separately: the ordered variants get whatever
    /// ordering the chosen reliability level provides.
    pub fn reliability(self) -> ReliabilityLevel {
        match self {
            ChannelKind::None | ChannelKind::Unreliable | ChannelKind::UnreliableOrdered => {
                ReliabilityLevel::Unreliable
            }
            ChannelKind::Reliable | ChannelKind::ReliableOrdered => ReliabilityLevel::Reliable,
        }
    }
}

/// Send policy understood by the relay transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReliabilityLevel {
    Unreliable,
    Reliable,
}

impl From<ChannelKind> for ReliabilityLevel {
    fn from(kind: ChannelKind) -> Self {
        kind.reliability()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_total() {
        for kind in ChannelKind::ALL {
            let level: ReliabilityLevel = kind.into();
            assert_eq!(level, kind.reliability());
        }
    }

    #[test]
    fn test_mapping_values() {
        assert_eq!(ChannelKind::None.reliability(), ReliabilityLevel::Unreliable);
        assert_eq!(ChannelKind::Unreliable.reliability(), ReliabilityLevel::Unreliable);
        assert_eq!(
            ChannelKind::UnreliableOrdered.reliability(),
            ReliabilityLevel::Unreliable
        );
        assert_eq!(ChannelKind::Reliable.reliability(), ReliabilityLevel::Reliable);
        assert_eq!(
            ChannelKind::ReliableOrdered.reliability(),
            ReliabilityLevel::Reliable
        );
    }
}

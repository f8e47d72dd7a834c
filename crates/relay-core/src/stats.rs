//! Driver and connection statistics

use std::time::Duration;

/// Statistics reported by a single transport connection
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionStats {
    /// Round-trip time, if the transport measures it
    pub rtt: Option<Duration>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Statistics returned by the driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverStats {
    /// Round-trip time in milliseconds, `-1.0` when unknown
    pub rtt_ms: f32,
    pub total_data_sent: u64,
    pub total_data_received: u64,
}

impl DriverStats {
    /// Returned when nothing about the connection is known
    pub const UNKNOWN: DriverStats = DriverStats {
        rtt_ms: -1.0,
        total_data_sent: 0,
        total_data_received: 0,
    };

    /// Whether the round-trip time is known
    pub fn has_rtt(&self) -> bool {
        self.rtt_ms >= 0.0
    }
}

impl Default for DriverStats {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Convert an optional RTT into the driver's millisecond representation
pub fn rtt_millis(rtt: Option<Duration>) -> f32 {
    rtt.map(|d| d.as_secs_f32() * 1000.0).unwrap_or(-1.0)
}

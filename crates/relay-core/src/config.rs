//! Driver configuration

use crate::error::{RelayError, Result};
use crate::identity::PeerIdentity;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration recorded by `initialize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DriverConfig {
    /// Identity we listen under; zero means "ask the transport"
    #[serde(default)]
    pub local_identity: PeerIdentity,

    /// Peer to dial on `connect`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_identity: Option<PeerIdentity>,

    /// Advisory maximum message size in bytes
    #[serde(default = "default_message_size")]
    pub message_size: usize,

    /// Transport send buffer size; falls back to `message_size`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_buffer_size: Option<usize>,
}

fn default_message_size() -> usize {
    1500
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            local_identity: PeerIdentity::default(),
            target_identity: None,
            message_size: default_message_size(),
            send_buffer_size: None,
        }
    }
}

impl DriverConfig {
    /// Parse a config from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Load a config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Size to hand to the transport's send buffer
    pub fn effective_send_buffer_size(&self) -> usize {
        self.send_buffer_size.unwrap_or(self.message_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DriverConfig::default();
        assert!(config.local_identity.is_unset());
        assert_eq!(config.target_identity, None);
        assert_eq!(config.message_size, 1500);
        assert_eq!(config.effective_send_buffer_size(), 1500);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{"LocalIdentity":42,"TargetIdentity":7,"MessageSize":4096}"#;
        let config = DriverConfig::from_json_str(json).unwrap();

        assert_eq!(config.local_identity, PeerIdentity(42));
        assert_eq!(config.target_identity, Some(PeerIdentity(7)));
        assert_eq!(config.message_size, 4096);
        assert_eq!(config.send_buffer_size, None);
    }

    #[test]
    fn test_config_empty_json_uses_defaults() {
        let config = DriverConfig::from_json_str("{}").unwrap();
        assert_eq!(config, DriverConfig::default());
    }

    #[test]
    fn test_config_rejects_garbage() {
        let err = DriverConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }
}

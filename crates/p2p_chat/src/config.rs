//! Configuration for a chat node and its LAN transport.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Longest service type accepted (same limit as DNS-SD service names).
pub const MAX_SERVICE_TYPE_LEN: usize = 15;

/// Configuration for the chat node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Service identity shared by every instance that should find each other.
    pub service_type: String,

    /// How long an invitation stays open before it lapses.
    #[serde(with = "duration_millis")]
    pub invite_timeout: Duration,

    /// Accept every incoming invitation without asking the UI.
    pub auto_accept_invitations: bool,

    /// Capacity of the transport event queue feeding the node loop.
    pub event_queue_capacity: usize,

    /// Capacity of the command queue feeding the node loop.
    pub command_queue_capacity: usize,

    /// Settings for [`LanTransport`](crate::transport::lan::LanTransport).
    pub lan: LanConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            service_type: "p2pchat".to_string(),
            invite_timeout: Duration::from_secs(10),
            auto_accept_invitations: false,
            event_queue_capacity: 256,
            command_queue_capacity: 64,
            lan: LanConfig::default(),
        }
    }
}

/// Settings for the UDP/WebSocket LAN transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanConfig {
    /// Address the WebSocket listener binds while advertising.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// UDP port used for presence announcements.
    pub discovery_port: u16,

    /// Where announcements are sent. The limited broadcast address by
    /// default; a subnet broadcast or unicast address also works.
    pub announce_addr: IpAddr,

    /// Interval between presence announcements.
    #[serde(with = "duration_millis")]
    pub announce_interval: Duration,

    /// A browsed peer that has not announced within this window is lost.
    #[serde(with = "duration_millis")]
    pub peer_ttl: Duration,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            discovery_port: 9481,
            announce_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_interval: Duration::from_secs(1),
            peer_ttl: Duration::from_secs(5),
        }
    }
}

impl ChatConfig {
    /// Check the config for values the node cannot run with.
    pub fn validate(&self) -> Result<(), NetworkError> {
        validate_service_type(&self.service_type)?;
        if self.event_queue_capacity == 0 || self.command_queue_capacity == 0 {
            return Err(NetworkError::InvalidConfig(
                "queue capacities must be non-zero".to_string(),
            ));
        }
        if self.invite_timeout.is_zero() {
            return Err(NetworkError::InvalidConfig(
                "invite_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<ChatConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

/// Validate a service type: 1-15 characters of lowercase ASCII letters,
/// digits and single hyphens, not starting or ending with a hyphen.
pub fn validate_service_type(service_type: &str) -> Result<(), NetworkError> {
    let invalid = || NetworkError::InvalidServiceType(service_type.to_string());

    if service_type.is_empty() || service_type.len() > MAX_SERVICE_TYPE_LEN {
        return Err(invalid());
    }
    if service_type.starts_with('-') || service_type.ends_with('-') {
        return Err(invalid());
    }
    if service_type.contains("--") {
        return Err(invalid());
    }
    if !service_type
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChatConfig::default();
        assert_eq!(config.service_type, "p2pchat");
        assert_eq!(config.invite_timeout, Duration::from_secs(10));
        assert!(!config.auto_accept_invitations);
        assert_eq!(config.lan.discovery_port, 9481);
        assert_eq!(config.lan.listen_addr.port(), 0);
        assert_eq!(config.lan.announce_addr, IpAddr::V4(Ipv4Addr::BROADCAST));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_service_type_rules() {
        assert!(validate_service_type("p2pchat").is_ok());
        assert!(validate_service_type("chat-2").is_ok());
        assert!(validate_service_type("a").is_ok());

        assert!(validate_service_type("").is_err());
        assert!(validate_service_type("P2PChat").is_err());
        assert!(validate_service_type("-chat").is_err());
        assert!(validate_service_type("chat-").is_err());
        assert!(validate_service_type("chat--room").is_err());
        assert!(validate_service_type("chat_room").is_err());
        assert!(validate_service_type("abcdefghijklmnop").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = ChatConfig::default();
        config.event_queue_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(NetworkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = ChatConfig::default();
        config.invite_timeout = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(NetworkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_sub_second_timeout_survives_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");

        let mut original = ChatConfig::default();
        original.invite_timeout = Duration::from_millis(750);
        original.save_to_file(&path).unwrap();

        let loaded = ChatConfig::load_or_default(&path);
        assert_eq!(loaded.invite_timeout, Duration::from_millis(750));
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ChatConfig =
            serde_json::from_str(r#"{"service_type":"lobby","lan":{"peer_ttl":2500}}"#).unwrap();
        assert_eq!(config.service_type, "lobby");
        assert_eq!(config.lan.peer_ttl, Duration::from_millis(2500));
        assert_eq!(config.lan.discovery_port, 9481);
        assert_eq!(config.invite_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_announce_addr_from_json() {
        let config: ChatConfig =
            serde_json::from_str(r#"{"lan":{"announce_addr":"192.168.1.255"}}"#).unwrap();
        assert_eq!(
            config.lan.announce_addr,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 255))
        );
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chat.json");

        let mut original = ChatConfig::default();
        original.auto_accept_invitations = true;
        original.lan.discovery_port = 9999;
        original.save_to_file(&path).unwrap();

        let loaded = ChatConfig::load_or_default(&path);
        assert!(loaded.auto_accept_invitations);
        assert_eq!(loaded.lan.discovery_port, 9999);
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = ChatConfig::load_or_default(&path);
        assert_eq!(config.service_type, "p2pchat");
    }
}

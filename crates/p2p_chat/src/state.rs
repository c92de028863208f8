//! Connection state of the local node and how the UI presents it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the local node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "peer")]
pub enum ConnectionState {
    /// Idle; no discovery running and no peers in the session.
    #[default]
    NotConnected,
    /// Searching for peers (and advertising so they can find us).
    Browsing,
    /// Announcing presence and waiting for an invitation.
    Advertising,
    /// A peer is joining the session.
    Connecting,
    /// At least one peer has joined. Carries the display name of the most
    /// recently joined peer.
    Connected(String),
}

/// The action the UI offers as its primary control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryAction {
    /// Start browsing or advertising.
    Search,
    /// Leave the session.
    Disconnect,
}

/// Everything a UI needs to render the connection header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub title: String,
    pub action: Option<PrimaryAction>,
    pub activity: bool,
}

impl ConnectionState {
    /// Whether a peer is in the session.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// Whether browse/advertise requests are accepted in this state.
    pub fn can_search(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Browsing | Self::Advertising)
    }

    /// Display name of the connected peer, if any.
    pub fn peer_name(&self) -> Option<&str> {
        match self {
            Self::Connected(name) => Some(name),
            _ => None,
        }
    }

    /// Header text for this state.
    pub fn title(&self) -> String {
        match self {
            Self::NotConnected => "Not Connected".to_string(),
            Self::Browsing => "Browsing...".to_string(),
            Self::Advertising => "Advertising...".to_string(),
            Self::Connecting => "Connecting...".to_string(),
            Self::Connected(name) if name.is_empty() => "(Unknown Name)".to_string(),
            Self::Connected(name) => name.clone(),
        }
    }

    /// Build the view model the UI renders for this state.
    pub fn status_view(&self) -> StatusView {
        let action = match self {
            Self::NotConnected | Self::Browsing | Self::Advertising => {
                Some(PrimaryAction::Search)
            }
            Self::Connecting => None,
            Self::Connected(_) => Some(PrimaryAction::Disconnect),
        };
        let activity = matches!(self, Self::Browsing | Self::Advertising | Self::Connecting);
        StatusView {
            title: self.title(),
            action,
            activity,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::Browsing => write!(f, "browsing"),
            Self::Advertising => write!(f, "advertising"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected(name) => write!(f, "connected to {name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_not_connected() {
        assert_eq!(ConnectionState::default(), ConnectionState::NotConnected);
    }

    #[test]
    fn test_titles() {
        assert_eq!(ConnectionState::NotConnected.title(), "Not Connected");
        assert_eq!(ConnectionState::Browsing.title(), "Browsing...");
        assert_eq!(ConnectionState::Advertising.title(), "Advertising...");
        assert_eq!(ConnectionState::Connecting.title(), "Connecting...");
        assert_eq!(ConnectionState::Connected("Pad".into()).title(), "Pad");
        assert_eq!(
            ConnectionState::Connected(String::new()).title(),
            "(Unknown Name)"
        );
    }

    #[test]
    fn test_status_view_actions() {
        let view = ConnectionState::Browsing.status_view();
        assert_eq!(view.action, Some(PrimaryAction::Search));
        assert!(view.activity);

        let view = ConnectionState::Connecting.status_view();
        assert_eq!(view.action, None);
        assert!(view.activity);

        let view = ConnectionState::Connected("Pad".into()).status_view();
        assert_eq!(view.action, Some(PrimaryAction::Disconnect));
        assert!(!view.activity);

        let view = ConnectionState::NotConnected.status_view();
        assert_eq!(view.action, Some(PrimaryAction::Search));
        assert!(!view.activity);
    }

    #[test]
    fn test_can_search() {
        assert!(ConnectionState::NotConnected.can_search());
        assert!(ConnectionState::Advertising.can_search());
        assert!(!ConnectionState::Connecting.can_search());
        assert!(!ConnectionState::Connected("x".into()).can_search());
    }

    #[test]
    fn test_serialize_tagged() {
        let json = serde_json::to_string(&ConnectionState::Connected("Pad".into())).unwrap();
        assert_eq!(json, r#"{"state":"connected","peer":"Pad"}"#);
        let back: ConnectionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.peer_name(), Some("Pad"));
    }
}

//! Newtype wrappers for domain identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lowest VLAN id a switch accepts for access ports.
pub const MIN_VLAN_ID: u16 = 1;

/// Highest usable VLAN id (4095 is reserved by 802.1Q).
pub const MAX_VLAN_ID: u16 = 4094;

/// Maximum accepted length of an interface name.
pub const MAX_INTERFACE_NAME_LEN: usize = 64;

/// Error returned when a value is not a usable VLAN id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid VLAN id {0:?}: expected an integer between 1 and 4094")]
pub struct InvalidVlanId(pub String);

/// An 802.1Q VLAN identifier in the range 1..=4094.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    /// VLAN 1, the factory default of every port.
    pub const DEFAULT: VlanId = VlanId(MIN_VLAN_ID);

    /// Creates a VLAN id, rejecting values outside 1..=4094.
    pub fn new(id: u16) -> Result<Self, InvalidVlanId> {
        if (MIN_VLAN_ID..=MAX_VLAN_ID).contains(&id) {
            Ok(VlanId(id))
        } else {
            Err(InvalidVlanId(id.to_string()))
        }
    }

    /// Interprets a JSON value as a VLAN id.
    ///
    /// Accepts a positive integer or a string of decimal digits (surrounding
    /// whitespace is ignored). Everything else is rejected.
    ///
    /// ```
    /// use switchport_webhook::types::VlanId;
    ///
    /// assert_eq!(VlanId::from_json(&serde_json::json!(20)).unwrap().get(), 20);
    /// assert_eq!(VlanId::from_json(&serde_json::json!(" 20 ")).unwrap().get(), 20);
    /// assert!(VlanId::from_json(&serde_json::json!("vlan20")).is_err());
    /// assert!(VlanId::from_json(&serde_json::json!(0)).is_err());
    /// ```
    pub fn from_json(value: &serde_json::Value) -> Result<Self, InvalidVlanId> {
        match value {
            serde_json::Value::Number(n) => {
                let raw = n.as_u64().ok_or_else(|| InvalidVlanId(n.to_string()))?;
                let id = u16::try_from(raw).map_err(|_| InvalidVlanId(n.to_string()))?;
                VlanId::new(id)
            }
            serde_json::Value::String(s) => s.parse(),
            other => Err(InvalidVlanId(other.to_string())),
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl FromStr for VlanId {
    type Err = InvalidVlanId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // u16::from_str accepts a leading '+', which no switch CLI does.
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidVlanId(s.to_string()));
        }
        let id: u16 = trimmed.parse().map_err(|_| InvalidVlanId(s.to_string()))?;
        VlanId::new(id)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = InvalidVlanId;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanId::new(id)
    }
}

impl From<VlanId> for u16 {
    fn from(id: VlanId) -> Self {
        id.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a resource name cannot be used as an interface name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidInterfaceName {
    #[error("interface name is empty")]
    Empty,

    #[error("interface name is longer than 64 characters")]
    TooLong,

    #[error("interface name {0:?} must start with a letter")]
    BadStart(String),

    #[error("interface name {name:?} contains forbidden character {ch:?}")]
    ForbiddenCharacter { name: String, ch: char },
}

/// A switch interface name such as `GigabitEthernet1/0/1`.
///
/// The name is spliced into CLI commands, so construction restricts it to
/// `[A-Za-z0-9/.:_-]`, starting with a letter. No whitespace, no newlines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct InterfaceName(String);

impl InterfaceName {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidInterfaceName> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidInterfaceName::Empty);
        }
        if s.len() > MAX_INTERFACE_NAME_LEN {
            return Err(InvalidInterfaceName::TooLong);
        }
        if !s.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(InvalidInterfaceName::BadStart(s));
        }
        if let Some(ch) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | ':' | '_' | '-')))
        {
            return Err(InvalidInterfaceName::ForbiddenCharacter { name: s, ch });
        }
        Ok(InterfaceName(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a single reservation event, as sent by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(s: impl Into<String>) -> Self {
        EventId(s.into())
    }

    /// Generates a random id for events that arrive without one.
    pub fn generate() -> Self {
        EventId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one webhook delivery (a delivery may describe one event).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookId(pub String);

impl WebhookId {
    pub fn new(s: impl Into<String>) -> Self {
        WebhookId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

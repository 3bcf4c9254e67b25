//! Core domain types for the switch port webhook.
//!
//! Identifiers are newtypes so that a VLAN id can never be passed where an
//! interface name is expected, and so that validation happens once at the edge.

pub mod ids;

pub use ids::{EventId, InterfaceName, InvalidInterfaceName, InvalidVlanId, VlanId, WebhookId};

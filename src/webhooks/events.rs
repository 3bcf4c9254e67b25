//! Typed reservation events.
//!
//! A [`ReservationEvent`] is built once per request by the parser, never
//! mutated, and dropped when reconciliation finishes. The engine never looks at
//! the event directly; it works from the [`VlanDesiredState`] derived here.

use serde::Serialize;

use crate::types::{EventId, InterfaceName, VlanId, WebhookId};

/// The resource type this service owns.
pub const SWITCH_PORT_RESOURCE_TYPE: &str = "Switch Port";

/// Lifecycle phase of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReservationEventType {
    /// `EVENT_START`: the reservation began, move the port to the requested VLAN.
    #[serde(rename = "EVENT_START")]
    Start,
    /// `EVENT_END`: the reservation is over, return the port to the default VLAN.
    #[serde(rename = "EVENT_END")]
    End,
}

impl ReservationEventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationEventType::Start => "EVENT_START",
            ReservationEventType::End => "EVENT_END",
        }
    }
}

impl std::fmt::Display for ReservationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated reservation lifecycle event for one switch port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationEvent {
    pub event_type: ReservationEventType,
    pub event_id: EventId,
    pub resource_name: InterfaceName,
    pub resource_type: String,

    /// VLAN requested in `customParameters.vlan_id`. Always `Some` for START.
    /// END events may carry one too; it is ignored.
    pub requested_vlan: Option<VlanId>,

    /// Pass-through metadata, used only for outcome reporting.
    pub metadata: EventMetadata,
}

/// Envelope fields the core does not act on but reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    pub webhook_id: Option<WebhookId>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub resource_id: Option<String>,
}

/// What the switch should look like for one interface after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanDesiredState {
    pub interface_name: InterfaceName,
    pub target_vlan: VlanId,
    /// Create the VLAN when it is missing. Only START runs do this.
    pub create_if_missing: bool,
}

impl VlanDesiredState {
    /// Derives the desired state for an event.
    ///
    /// END always targets `default_vlan`, whatever the payload says.
    pub fn from_event(event: &ReservationEvent, default_vlan: VlanId) -> Self {
        match (event.event_type, event.requested_vlan) {
            (ReservationEventType::Start, Some(vlan)) => VlanDesiredState {
                interface_name: event.resource_name.clone(),
                target_vlan: vlan,
                create_if_missing: true,
            },
            // The parser refuses START without a VLAN; fall back to the safe state.
            (ReservationEventType::Start, None) | (ReservationEventType::End, _) => {
                VlanDesiredState {
                    interface_name: event.resource_name.clone(),
                    target_vlan: default_vlan,
                    create_if_missing: false,
                }
            }
        }
    }
}

/// Result of parsing a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedWebhook {
    /// An event that must be reconciled.
    Reservation(ReservationEvent),

    /// Several switch port events from one batch delivery, in delivery order.
    /// Never empty.
    Batch {
        event_type: ReservationEventType,
        events: Vec<ReservationEvent>,
    },

    /// A recognised delivery that requires no switch change, such as the
    /// deletion of a reservation that is not currently active.
    Ignored { reason: String },
}

//! Reservation webhook payload parser.
//!
//! Turns raw delivery bytes into a [`ParsedWebhook`]. Parsing is pure: it never
//! touches the switch and has no side effects beyond logging.
//!
//! # Parsing Strategy
//!
//! 1. Decode the envelope (must be a JSON object)
//! 2. Dispatch on `eventType`
//! 3. A delivery with an `events` array is a batch: entries whose
//!    `resourceType` is not "Switch Port" are skipped, the rest are parsed like
//!    single events and share the envelope's `eventType` and user metadata
//! 4. For START/END, validate `resourceType` and `resourceName`
//! 5. Decode `customParameters`, itself a JSON document embedded as a string.
//!    This second decode is its own fallible step: fatal for START, logged and
//!    skipped for END so that a reservation can always be torn down.
//! 6. `EVENT_DELETED` becomes an END event only if the deleted reservation is
//!    active at the delivery timestamp; otherwise it is ignored.
//!
//! Pass-through metadata (`webhookId`, `userId`, `username`, `resourceId`,
//! `eventId`) never fails a delivery. A value of an unexpected type is logged
//! and dropped.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{EventId, InterfaceName, InvalidInterfaceName, InvalidVlanId, VlanId, WebhookId};

use super::events::{
    EventMetadata, ParsedWebhook, ReservationEvent, ReservationEventType,
    SWITCH_PORT_RESOURCE_TYPE,
};

const EVENT_START: &str = "EVENT_START";
const EVENT_END: &str = "EVENT_END";
const EVENT_DELETED: &str = "EVENT_DELETED";

/// Key inside `customParameters` naming the requested VLAN.
const VLAN_ID_KEY: &str = "vlan_id";

/// Error decoding the embedded `customParameters` document.
#[derive(Debug, Error)]
pub enum CustomParametersError {
    #[error("customParameters is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("customParameters must decode to a JSON object")]
    NotAnObject,

    #[error("customParameters must be a JSON string or object, got {0}")]
    WrongType(&'static str),
}

/// Error type for payload validation failures.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed JSON body: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("event envelope must be a JSON object")]
    NotAnObject,

    #[error("invalid event envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    #[error("invalid entry {index} in events: {source}")]
    InvalidBatchEntry {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid EVENT_DELETED data: {0}")]
    InvalidDeletionData(#[source] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("unsupported eventType {0:?}")]
    UnknownEventType(String),

    #[error("resourceType {0:?} is not \"Switch Port\"")]
    ResourceTypeMismatch(String),

    #[error("resourceName is empty")]
    EmptyResourceName,

    #[error("invalid resourceName: {0}")]
    InvalidResourceName(#[from] InvalidInterfaceName),

    #[error(transparent)]
    InvalidCustomParameters(#[from] CustomParametersError),

    #[error("customParameters has no vlan_id field")]
    MissingVlanId,

    #[error(transparent)]
    InvalidVlanId(#[from] InvalidVlanId),

    #[error("invalid timestamp in {field}: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
}

// ============================================================================
// Raw payload structures for deserialization
//
// Everything is optional here; required fields are checked explicitly so that
// each gets a precise error. Fields the core does not act on stay untyped
// `Value`s until the code that needs them looks at them.
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    event_type: Option<String>,
    #[serde(flatten)]
    fields: RawEventFields,
    webhook_id: Option<Value>,
    user_id: Option<Value>,
    username: Option<Value>,
    timestamp: Option<Value>,
    data: Option<Value>,
    events: Option<Value>,
}

/// Per-event fields, found at the top level of a single delivery or in each
/// entry of a batch's `events` array.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEventFields {
    event_id: Option<Value>,
    resource_name: Option<String>,
    resource_type: Option<String>,
    custom_parameters: Option<Value>,
    resource_id: Option<Value>,
}

/// `data` block of an `EVENT_DELETED` delivery.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDeletionData {
    id: Option<Value>,
    start: Option<Value>,
    end: Option<Value>,
    resource: Option<RawResource>,
    keycloak_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawResource {
    name: Option<String>,
    id: Option<Value>,
}

/// Metadata shared by every event of one delivery.
#[derive(Debug, Clone, Default)]
struct EnvelopeMetadata {
    webhook_id: Option<WebhookId>,
    user_id: Option<String>,
    username: Option<String>,
}

impl EnvelopeMetadata {
    fn from_raw(raw: &RawEnvelope) -> Self {
        EnvelopeMetadata {
            webhook_id: lenient_id("webhookId", raw.webhook_id.as_ref()).map(WebhookId::new),
            user_id: lenient_id("userId", raw.user_id.as_ref()),
            username: lenient_id("username", raw.username.as_ref()),
        }
    }
}

/// Parses a delivery body.
///
/// # Returns
///
/// * `Ok(ParsedWebhook::Reservation(event))` - an event to reconcile
/// * `Ok(ParsedWebhook::Batch { .. })` - several events to reconcile in order
/// * `Ok(ParsedWebhook::Ignored { .. })` - valid, but nothing to do
/// * `Err(e)` - malformed or incomplete payload
///
/// # Examples
///
/// ```
/// use switchport_webhook::webhooks::{ParsedWebhook, parse_webhook};
///
/// let body = br#"{
///     "eventType": "EVENT_START",
///     "eventId": "evt-42",
///     "resourceName": "GigabitEthernet1/0/1",
///     "resourceType": "Switch Port",
///     "customParameters": "{\"vlan_id\":\"20\"}"
/// }"#;
///
/// let ParsedWebhook::Reservation(event) = parse_webhook(body).unwrap() else {
///     panic!("expected a reservation event");
/// };
/// assert_eq!(event.requested_vlan.unwrap().get(), 20);
/// ```
pub fn parse_webhook(payload: &[u8]) -> Result<ParsedWebhook, ValidationError> {
    let value: Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(ValidationError::NotAnObject);
    }
    let raw: RawEnvelope = serde_json::from_value(value).map_err(ValidationError::InvalidEnvelope)?;

    let event_type = raw
        .event_type
        .clone()
        .ok_or(ValidationError::MissingField("eventType"))?;
    let event_type = match event_type.as_str() {
        EVENT_START => ReservationEventType::Start,
        EVENT_END => ReservationEventType::End,
        EVENT_DELETED => return parse_deletion(raw),
        _ => return Err(ValidationError::UnknownEventType(event_type)),
    };

    let envelope = EnvelopeMetadata::from_raw(&raw);
    match raw.events {
        Some(events) => parse_batch(event_type, events, &envelope),
        None => parse_reservation(event_type, raw.fields, &envelope).map(ParsedWebhook::Reservation),
    }
}

fn is_switch_port(resource_type: &str) -> bool {
    resource_type.eq_ignore_ascii_case(SWITCH_PORT_RESOURCE_TYPE)
}

fn parse_reservation(
    event_type: ReservationEventType,
    fields: RawEventFields,
    envelope: &EnvelopeMetadata,
) -> Result<ReservationEvent, ValidationError> {
    let resource_type = fields
        .resource_type
        .ok_or(ValidationError::MissingField("resourceType"))?;
    if !is_switch_port(&resource_type) {
        return Err(ValidationError::ResourceTypeMismatch(resource_type));
    }

    let resource_name = parse_resource_name(fields.resource_name)?;

    let requested_vlan = match event_type {
        ReservationEventType::Start => Some(requested_vlan(fields.custom_parameters.as_ref())?),
        ReservationEventType::End => best_effort_vlan(fields.custom_parameters.as_ref(), &resource_name),
    };

    let event_id = lenient_id("eventId", fields.event_id.as_ref())
        .map(EventId::new)
        .unwrap_or_else(|| {
            let generated = EventId::generate();
            debug!(event_id = %generated, "Event has no eventId, generated one");
            generated
        });

    Ok(ReservationEvent {
        event_type,
        event_id,
        resource_name,
        resource_type,
        requested_vlan,
        metadata: EventMetadata {
            webhook_id: envelope.webhook_id.clone(),
            user_id: envelope.user_id.clone(),
            username: envelope.username.clone(),
            resource_id: lenient_id("resourceId", fields.resource_id.as_ref()),
        },
    })
}

/// Parses the `events` array of a batch delivery.
///
/// Every switch port entry is validated before anything is reconciled, so one
/// bad entry rejects the whole delivery without touching the switch.
fn parse_batch(
    event_type: ReservationEventType,
    events: Value,
    envelope: &EnvelopeMetadata,
) -> Result<ParsedWebhook, ValidationError> {
    let entries = match events {
        Value::Array(entries) => entries,
        other => {
            return Err(ValidationError::InvalidField {
                field: "events",
                value: other.to_string(),
            });
        }
    };

    let total = entries.len();
    let mut parsed = Vec::new();
    for (index, entry) in entries.into_iter().enumerate() {
        let fields: RawEventFields = serde_json::from_value(entry)
            .map_err(|source| ValidationError::InvalidBatchEntry { index, source })?;
        match fields.resource_type.as_deref() {
            Some(resource_type) if is_switch_port(resource_type) => {
                parsed.push(parse_reservation(event_type, fields, envelope)?);
            }
            other => debug!(index, resource_type = ?other, "Skipping non switch port event"),
        }
    }

    if parsed.len() != total {
        info!(
            skipped = total - parsed.len(),
            remaining = parsed.len(),
            "Filtered non switch port events from batch"
        );
    }
    if parsed.is_empty() {
        return Ok(ParsedWebhook::Ignored {
            reason: "No Switch Port events to process.".to_string(),
        });
    }
    Ok(ParsedWebhook::Batch {
        event_type,
        events: parsed,
    })
}

fn parse_deletion(raw: RawEnvelope) -> Result<ParsedWebhook, ValidationError> {
    let envelope = EnvelopeMetadata::from_raw(&raw);

    let timestamp = raw
        .timestamp
        .as_ref()
        .ok_or(ValidationError::MissingField("timestamp"))?;
    let now = parse_timestamp("timestamp", timestamp)?;

    let data = raw.data.ok_or(ValidationError::MissingField("data"))?;
    let data: RawDeletionData =
        serde_json::from_value(data).map_err(ValidationError::InvalidDeletionData)?;
    let start = parse_timestamp(
        "data.start",
        data.start.as_ref().ok_or(ValidationError::MissingField("data.start"))?,
    )?;
    let end = parse_timestamp(
        "data.end",
        data.end.as_ref().ok_or(ValidationError::MissingField("data.end"))?,
    )?;
    let resource = data
        .resource
        .ok_or(ValidationError::MissingField("data.resource"))?;
    let resource_name = parse_resource_name(resource.name)?;

    if !(start <= now && now < end) {
        debug!(
            interface = %resource_name,
            %start,
            %end,
            %now,
            "Deleted reservation is not active"
        );
        return Ok(ParsedWebhook::Ignored {
            reason: format!(
                "reservation for switch port '{resource_name}' is not currently active"
            ),
        });
    }

    let event_id = lenient_id("data.id", data.id.as_ref())
        .map(EventId::new)
        .unwrap_or_else(EventId::generate);

    Ok(ParsedWebhook::Reservation(ReservationEvent {
        event_type: ReservationEventType::End,
        event_id,
        resource_name,
        resource_type: SWITCH_PORT_RESOURCE_TYPE.to_string(),
        requested_vlan: None,
        metadata: EventMetadata {
            webhook_id: envelope.webhook_id,
            user_id: lenient_id("data.keycloakId", data.keycloak_id.as_ref()).or(envelope.user_id),
            username: envelope.username,
            resource_id: lenient_id("data.resource.id", resource.id.as_ref()),
        },
    }))
}

fn parse_resource_name(name: Option<String>) -> Result<InterfaceName, ValidationError> {
    let name = name.ok_or(ValidationError::MissingField("resourceName"))?;
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyResourceName);
    }
    Ok(InterfaceName::parse(name)?)
}

/// Decodes `customParameters` into a JSON object.
///
/// A string is decoded as a nested JSON document; an object is taken as-is;
/// null or an empty string mean "no parameters".
pub fn decode_custom_parameters(
    value: Option<&Value>,
) -> Result<Map<String, Value>, CustomParametersError> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Map::new()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s).map_err(CustomParametersError::Json)? {
            Value::Object(map) => Ok(map),
            _ => Err(CustomParametersError::NotAnObject),
        },
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::Bool(_)) => Err(CustomParametersError::WrongType("boolean")),
        Some(Value::Number(_)) => Err(CustomParametersError::WrongType("number")),
        Some(Value::Array(_)) => Err(CustomParametersError::WrongType("array")),
    }
}

fn requested_vlan(custom_parameters: Option<&Value>) -> Result<VlanId, ValidationError> {
    let params = decode_custom_parameters(custom_parameters)?;
    let raw = params.get(VLAN_ID_KEY).ok_or(ValidationError::MissingVlanId)?;
    Ok(VlanId::from_json(raw)?)
}

/// END events never fail on `customParameters`.
fn best_effort_vlan(custom_parameters: Option<&Value>, interface: &InterfaceName) -> Option<VlanId> {
    match decode_custom_parameters(custom_parameters) {
        Ok(params) => params.get(VLAN_ID_KEY).and_then(|v| VlanId::from_json(v).ok()),
        Err(e) => {
            warn!(
                interface = %interface,
                error = %e,
                "Ignoring malformed customParameters on END event"
            );
            None
        }
    }
}

/// Renders a string or numeric identifier as a string.
///
/// Anything else is dropped with a warning; identifiers are only carried
/// through for reporting.
fn lenient_id(field: &'static str, value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => {
            warn!(field, value = %other, "Ignoring metadata field of unexpected type");
            None
        }
    }
}

/// Parses a timestamp: an RFC 3339 string (without offset taken as UTC) or a
/// Unix epoch in seconds.
fn parse_timestamp(field: &'static str, value: &Value) -> Result<DateTime<Utc>, ValidationError> {
    let parsed = match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => match n.as_i64() {
            Some(secs) => DateTime::from_timestamp(secs, 0),
            None => n
                .as_f64()
                .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0) as i64)),
        },
        _ => None,
    };
    parsed.ok_or_else(|| ValidationError::InvalidTimestamp {
        field,
        value: value.to_string(),
    })
}

fn parse_timestamp_str(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

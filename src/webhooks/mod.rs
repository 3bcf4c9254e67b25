//! Inbound webhook handling for reservation events.
//!
//! This module provides:
//! - Signature verification for webhook payloads (HMAC-SHA256)
//! - Typed reservation events and the desired switch state derived from them
//! - Parsing and validation of the raw event envelope

pub mod events;
pub mod parser;
pub mod signature;

pub use events::{EventMetadata, ParsedWebhook, ReservationEvent, ReservationEventType, VlanDesiredState};
pub use parser::{ValidationError, parse_webhook};
pub use signature::{
    AuthError, SIGNATURE_HEADER, SignatureCheck, SignatureVerifier, compute_signature,
    format_signature_header, parse_signature_header, verify_signature,
};

//! Switch Port Webhook - reconciles switch port VLAN membership from
//! reservation lifecycle webhooks.
//!
//! A reservation START moves the reserved port onto the requested VLAN
//! (creating the VLAN if needed); an END returns it to the default VLAN. Every
//! run is verified by reading the port back from the switch.

pub mod config;
pub mod notify;
pub mod reconcile;
pub mod server;
pub mod switch;
pub mod types;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod test_utils;

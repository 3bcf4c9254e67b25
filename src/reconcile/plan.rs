//! Pure planning of device steps for a desired state.
//!
//! The plan fixes the order of operations; the engine only executes it. VLAN
//! existence is always established before the interface is assigned.

use crate::switch::cli::vlan_name;
use crate::types::{InterfaceName, VlanId};
use crate::webhooks::VlanDesiredState;

/// One step of a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStep {
    /// Check for the VLAN and create it under `name` when absent.
    EnsureVlan { vlan: VlanId, name: String },

    /// Make the interface an access port on `vlan`.
    AssignVlan {
        interface: InterfaceName,
        vlan: VlanId,
    },

    /// `no shutdown`.
    EnableInterface { interface: InterfaceName },

    /// Read back the access VLAN and compare.
    VerifyVlan {
        interface: InterfaceName,
        expected: VlanId,
    },
}

/// Plans the steps that converge the switch to `desired`.
pub fn plan_steps(desired: &VlanDesiredState, vlan_name_prefix: &str) -> Vec<DeviceStep> {
    let interface = &desired.interface_name;
    let vlan = desired.target_vlan;

    let mut steps = Vec::with_capacity(4);
    if desired.create_if_missing {
        steps.push(DeviceStep::EnsureVlan {
            vlan,
            name: vlan_name(vlan_name_prefix, vlan),
        });
    }
    steps.push(DeviceStep::AssignVlan {
        interface: interface.clone(),
        vlan,
    });
    steps.push(DeviceStep::EnableInterface {
        interface: interface.clone(),
    });
    steps.push(DeviceStep::VerifyVlan {
        interface: interface.clone(),
        expected: vlan,
    });
    steps
}

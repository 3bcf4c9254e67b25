//! Shared test utilities: an in-memory switch and arbitrary generators for
//! property-based testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use proptest::prelude::*;

use crate::switch::{DeviceError, DeviceOperation, SwitchConnector, SwitchSession};
use crate::types::{InterfaceName, VlanId};

pub fn arb_vlan_id() -> impl Strategy<Value = VlanId> {
    (1u16..=4094).prop_map(|v| VlanId::new(v).unwrap())
}

pub fn arb_interface_name() -> impl Strategy<Value = InterfaceName> {
    prop_oneof![
        (1u8..=4, 0u8..=1, 1u8..=48)
            .prop_map(|(a, b, c)| format!("GigabitEthernet{}/{}/{}", a, b, c)),
        (1u8..=4, 1u8..=48).prop_map(|(a, b)| format!("Ethernet{}/{}", a, b)),
        "[A-Za-z][A-Za-z0-9/._:-]{0,30}",
    ]
    .prop_map(|s| InterfaceName::parse(s).unwrap())
}

/// A device call observed by [`FakeSwitch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Open,
    VlanExists(VlanId),
    CreateVlan(VlanId, String),
    SetInterfaceVlan(String, VlanId),
    SetInterfaceAdminUp(String),
    ReadInterfaceVlan(String),
    Close,
}

/// Port state held by the fake. Unknown ports are VLAN 1 and shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakePort {
    pub vlan: VlanId,
    pub admin_up: bool,
}

impl Default for FakePort {
    fn default() -> Self {
        FakePort {
            vlan: VlanId::DEFAULT,
            admin_up: false,
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    vlans: BTreeMap<VlanId, String>,
    ports: HashMap<String, FakePort>,
    calls: Vec<FakeCall>,

    unreachable: bool,
    failing_opens: u32,
    failing_calls: HashMap<DeviceOperation, u32>,
    rejected: Option<DeviceOperation>,
    misreport: Option<VlanId>,
    delay: Duration,
}

#[derive(Debug, Default)]
struct FakeInner {
    state: Mutex<FakeState>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// In-memory switch implementing [`SwitchConnector`].
///
/// Records every call, counts sessions, and can inject failures. Clones share
/// state, so a test keeps one handle while the reconciler owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeSwitch {
    inner: Arc<FakeInner>,
}

impl FakeSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.state.lock().unwrap()
    }

    /// Pre-defines a VLAN, as if an operator had created it.
    pub fn with_vlan(self, vlan: u16) -> Self {
        let vlan = VlanId::new(vlan).unwrap();
        self.state().vlans.insert(vlan, format!("VLAN{:04}", vlan.get()));
        self
    }

    /// Every open fails with a connection error.
    pub fn unreachable(self) -> Self {
        self.state().unreachable = true;
        self
    }

    /// The next `n` opens fail with a connection error.
    pub fn failing_opens(self, n: u32) -> Self {
        self.state().failing_opens = n;
        self
    }

    /// The next `n` calls of `operation` fail with a connection error.
    pub fn failing_calls(self, operation: DeviceOperation, n: u32) -> Self {
        self.state().failing_calls.insert(operation, n);
        self
    }

    /// Every call of `operation` is rejected as an invalid command.
    pub fn rejecting(self, operation: DeviceOperation) -> Self {
        self.state().rejected = Some(operation);
        self
    }

    /// Read-backs report `vlan` regardless of configuration.
    pub fn misreporting(self, vlan: u16) -> Self {
        self.state().misreport = Some(VlanId::new(vlan).unwrap());
        self
    }

    /// Every session operation sleeps this long first.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state().delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&FakeCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn has_vlan(&self, vlan: u16) -> bool {
        self.state()
            .vlans
            .contains_key(&VlanId::new(vlan).unwrap())
    }

    pub fn vlan_name(&self, vlan: u16) -> Option<String> {
        self.state()
            .vlans
            .get(&VlanId::new(vlan).unwrap())
            .cloned()
    }

    pub fn port(&self, interface: &str) -> FakePort {
        self.state().ports.get(interface).copied().unwrap_or_default()
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Sessions currently open (opened and not yet dropped).
    pub fn active_sessions(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open sessions seen.
    pub fn max_concurrent_sessions(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    /// Records a call and applies injected failures for it.
    async fn enter(&self, call: FakeCall, operation: DeviceOperation) -> Result<(), DeviceError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(call);
            if let Some(remaining) = state.failing_calls.get_mut(&operation)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(DeviceError::connection(operation, "connection reset by peer"));
            }
            if state.rejected == Some(operation) {
                return Err(DeviceError::command(
                    operation,
                    "% Invalid input detected at '^' marker.",
                ));
            }
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

impl SwitchConnector for FakeSwitch {
    type Session = FakeSession;

    async fn open(&self) -> Result<FakeSession, DeviceError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(FakeCall::Open);
            if state.unreachable {
                return Err(DeviceError::connection(
                    DeviceOperation::Open,
                    "connect to host 10.0.0.2 port 22: No route to host",
                ));
            }
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(DeviceError::connection(
                    DeviceOperation::Open,
                    "connection timed out",
                ));
            }
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(FakeSession {
            switch: self.clone(),
        })
    }
}

/// A session on a [`FakeSwitch`]. Counts as active until dropped.
#[derive(Debug)]
pub struct FakeSession {
    switch: FakeSwitch,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.switch.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SwitchSession for FakeSession {
    async fn vlan_exists(&self, vlan: VlanId) -> Result<bool, DeviceError> {
        self.switch
            .enter(FakeCall::VlanExists(vlan), DeviceOperation::VlanExists)
            .await?;
        Ok(self.switch.state().vlans.contains_key(&vlan))
    }

    async fn create_vlan(&self, vlan: VlanId, name: &str) -> Result<(), DeviceError> {
        self.switch
            .enter(
                FakeCall::CreateVlan(vlan, name.to_string()),
                DeviceOperation::CreateVlan,
            )
            .await?;
        self.switch.state().vlans.insert(vlan, name.to_string());
        Ok(())
    }

    async fn set_interface_vlan(
        &self,
        interface: &InterfaceName,
        vlan: VlanId,
    ) -> Result<(), DeviceError> {
        self.switch
            .enter(
                FakeCall::SetInterfaceVlan(interface.to_string(), vlan),
                DeviceOperation::SetInterfaceVlan,
            )
            .await?;
        let mut state = self.switch.state();
        if !state.vlans.contains_key(&vlan) && vlan != VlanId::DEFAULT {
            return Err(DeviceError::command(
                DeviceOperation::SetInterfaceVlan,
                format!("% Access VLAN {} does not exist", vlan),
            ));
        }
        state.ports.entry(interface.to_string()).or_default().vlan = vlan;
        Ok(())
    }

    async fn set_interface_admin_up(&self, interface: &InterfaceName) -> Result<(), DeviceError> {
        self.switch
            .enter(
                FakeCall::SetInterfaceAdminUp(interface.to_string()),
                DeviceOperation::SetInterfaceAdminUp,
            )
            .await?;
        self.switch
            .state()
            .ports
            .entry(interface.to_string())
            .or_default()
            .admin_up = true;
        Ok(())
    }

    async fn read_interface_vlan(&self, interface: &InterfaceName) -> Result<VlanId, DeviceError> {
        self.switch
            .enter(
                FakeCall::ReadInterfaceVlan(interface.to_string()),
                DeviceOperation::ReadInterfaceVlan,
            )
            .await?;
        let state = self.switch.state();
        Ok(state.misreport.unwrap_or_else(|| {
            state
                .ports
                .get(interface.as_str())
                .copied()
                .unwrap_or_default()
                .vlan
        }))
    }

    async fn close(self) {
        self.switch.state().calls.push(FakeCall::Close);
        self.switch.inner.closed.fetch_add(1, Ordering::SeqCst);
    }
}

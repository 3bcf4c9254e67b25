//! Device Command Adapter: the boundary between reconciliation logic and the
//! switch.
//!
//! The engine talks to the switch only through [`SwitchConnector`] and
//! [`SwitchSession`]. Implementations:
//! - [`ssh::SshConnector`]: OpenSSH multiplexed session, vendor CLI via [`cli`]
//! - `test_utils::FakeSwitch`: in-memory switch for tests
//!
//! Errors are categorized for retry decisions the same way throughout:
//!
//! - **Connection** errors (timeouts, resets, unreachable host) are transient
//!   and retried with backoff.
//! - **Authentication** errors are connection-class but never retried.
//! - **Command** errors mean the device rejected or could not run a command;
//!   retrying the same command would fail the same way.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::types::{InterfaceName, VlanId};

pub mod cli;
pub mod retry;
pub mod ssh;

pub use retry::{RetryConfig, RetryResult, retry_with_backoff};

/// Primitive operations of the adapter, used for logging and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOperation {
    Open,
    VlanExists,
    CreateVlan,
    SetInterfaceVlan,
    SetInterfaceAdminUp,
    ReadInterfaceVlan,
    Close,
}

impl DeviceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceOperation::Open => "open",
            DeviceOperation::VlanExists => "vlan_exists",
            DeviceOperation::CreateVlan => "create_vlan",
            DeviceOperation::SetInterfaceVlan => "set_interface_vlan",
            DeviceOperation::SetInterfaceAdminUp => "set_interface_admin_up",
            DeviceOperation::ReadInterfaceVlan => "read_interface_vlan",
            DeviceOperation::Close => "close",
        }
    }
}

impl fmt::Display for DeviceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of device error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Transport failure or timeout. Safe to retry.
    Connection,

    /// The switch refused our credentials or host key.
    Authentication,

    /// The switch rejected a command, or its output could not be understood.
    Command,
}

impl DeviceErrorKind {
    /// Only connection-level failures are retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DeviceErrorKind::Connection)
    }
}

/// An error from one adapter operation.
#[derive(Debug, Error)]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub operation: DeviceOperation,
    pub message: String,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DeviceErrorKind::Connection => "connection error",
            DeviceErrorKind::Authentication => "authentication error",
            DeviceErrorKind::Command => "command error",
        };
        write!(f, "switch {} during {}: {}", kind, self.operation, self.message)
    }
}

impl DeviceError {
    pub fn connection(operation: DeviceOperation, message: impl Into<String>) -> Self {
        DeviceError {
            kind: DeviceErrorKind::Connection,
            operation,
            message: message.into(),
        }
    }

    pub fn authentication(operation: DeviceOperation, message: impl Into<String>) -> Self {
        DeviceError {
            kind: DeviceErrorKind::Authentication,
            operation,
            message: message.into(),
        }
    }

    pub fn command(operation: DeviceOperation, message: impl Into<String>) -> Self {
        DeviceError {
            kind: DeviceErrorKind::Command,
            operation,
            message: message.into(),
        }
    }

    /// The error reported when an operation exceeds its timeout.
    pub fn timeout(operation: DeviceOperation, after: Duration) -> Self {
        Self::connection(operation, format!("timed out after {:?}", after))
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// Opens sessions to the one switch this deployment manages.
///
/// Every reconciliation opens its own session; sessions are never pooled or
/// shared between runs.
pub trait SwitchConnector: Send + Sync + 'static {
    type Session: SwitchSession;

    /// Opens an authenticated session.
    fn open(&self) -> impl Future<Output = Result<Self::Session, DeviceError>> + Send;
}

/// One open, authenticated session to the switch.
///
/// Operations take `&self` so a retry loop can re-issue them freely.
/// [`SwitchSession::close`] consumes the session; implementations must also
/// release their transport on drop, in case the owning task is aborted.
pub trait SwitchSession: Send + Sync {
    /// Whether `vlan` is defined on the switch.
    fn vlan_exists(&self, vlan: VlanId) -> impl Future<Output = Result<bool, DeviceError>> + Send;

    /// Defines `vlan` with the given name.
    fn create_vlan(
        &self,
        vlan: VlanId,
        name: &str,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Makes `interface` an access port on `vlan`, replacing its current VLAN.
    fn set_interface_vlan(
        &self,
        interface: &InterfaceName,
        vlan: VlanId,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Administratively enables `interface` (`no shutdown`).
    fn set_interface_admin_up(
        &self,
        interface: &InterfaceName,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Reads back the access VLAN `interface` is a member of.
    fn read_interface_vlan(
        &self,
        interface: &InterfaceName,
    ) -> impl Future<Output = Result<VlanId, DeviceError>> + Send;

    /// Closes the session.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Runs `fut` with a deadline, reporting expiry as a retriable connection error.
pub async fn with_timeout<T, F>(
    operation: DeviceOperation,
    timeout: Duration,
    fut: F,
) -> Result<T, DeviceError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::timeout(operation, timeout)),
    }
}

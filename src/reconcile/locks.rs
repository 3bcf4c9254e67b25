//! Per-interface mutual exclusion.
//!
//! At most one reconciliation holds a given interface at a time; distinct
//! interfaces never contend. Waiting for a lock is bounded. Entries are removed
//! from the table once nobody holds or waits for them, so the table only grows
//! with the number of interfaces currently in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::types::InterfaceName;

type LockTable = HashMap<InterfaceName, Arc<AsyncMutex<()>>>;

/// The lock for an interface could not be acquired in time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timed out after {waited:?} waiting for another reconciliation of {interface}")]
pub struct LockTimeout {
    pub interface: InterfaceName,
    pub waited: Duration,
}

/// Process-wide table of interface locks.
#[derive(Debug, Clone, Default)]
pub struct InterfaceLocks {
    table: Arc<Mutex<LockTable>>,
}

impl InterfaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, LockTable> {
        // Nothing panics while holding the table lock; recover if it ever does.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits up to `wait` for exclusive ownership of `interface`.
    pub async fn acquire(
        &self,
        interface: &InterfaceName,
        wait: Duration,
    ) -> Result<InterfaceGuard, LockTimeout> {
        let lock = Arc::clone(self.table().entry(interface.clone()).or_default());

        let acquired = tokio::time::timeout(wait, lock.lock_owned()).await;
        match acquired {
            Ok(guard) => {
                debug!(%interface, "Interface lock acquired");
                Ok(InterfaceGuard {
                    interface: interface.clone(),
                    guard: Some(guard),
                    locks: self.clone(),
                })
            }
            Err(_) => {
                self.prune(interface);
                Err(LockTimeout {
                    interface: interface.clone(),
                    waited: wait,
                })
            }
        }
    }

    /// Removes the entry for `interface` when only the table references it.
    fn prune(&self, interface: &InterfaceName) {
        let mut table = self.table();
        let idle = table
            .get(interface)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            table.remove(interface);
        }
    }

    /// Number of interfaces with a holder or waiter.
    pub fn in_flight(&self) -> usize {
        self.table().len()
    }
}

/// Exclusive ownership of one interface. Released on drop.
#[derive(Debug)]
pub struct InterfaceGuard {
    interface: InterfaceName,
    guard: Option<OwnedMutexGuard<()>>,
    locks: InterfaceLocks,
}

impl InterfaceGuard {
    pub fn interface(&self) -> &InterfaceName {
        &self.interface
    }
}

impl Drop for InterfaceGuard {
    fn drop(&mut self) {
        // Release first so the strong count reflects only waiters.
        drop(self.guard.take());
        self.locks.prune(&self.interface);
        debug!(interface = %self.interface, "Interface lock released");
    }
}

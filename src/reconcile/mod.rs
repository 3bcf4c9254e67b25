//! Reconciliation engine.
//!
//! One event produces one linear convergence run:
//!
//! 1. Lock the interface (bounded wait).
//! 2. Open a session (retried on connection errors).
//! 3. Execute the planned [`DeviceStep`]s in order, each retried on its own.
//! 4. Close the session, whatever happened in 3.
//!
//! The session open and all steps share one wall-clock budget. When it runs
//! out the steps are abandoned, the session is still closed explicitly, and the
//! run fails. Partially applied commands are not rolled back: the switch has no
//! transaction primitive, so a run is best-effort and non-atomic.
//!
//! A read-back that disagrees with the target is a correctness alarm, not a
//! transient condition, and fails the run without retry.

pub mod locks;
pub mod plan;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::switch::{
    DeviceError, DeviceOperation, RetryConfig, SwitchConnector, SwitchSession,
    retry_with_backoff, with_timeout,
};
use crate::types::{InterfaceName, VlanId};
use crate::webhooks::VlanDesiredState;

pub use locks::{InterfaceGuard, InterfaceLocks, LockTimeout};
pub use plan::{DeviceStep, plan_steps};

/// Tunables for reconciliation runs. Read-only after startup.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// VLAN that END runs return interfaces to.
    pub default_vlan: VlanId,

    /// Prefix of the names given to VLANs this service creates.
    pub vlan_name_prefix: String,

    pub retry: RetryConfig,

    /// Bound on each individual device operation.
    pub operation_timeout: Duration,

    /// Bound on session open plus all steps of one run.
    pub run_budget: Duration,

    /// Bound on waiting for another run on the same interface.
    pub lock_wait: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        ReconcileSettings {
            default_vlan: VlanId::DEFAULT,
            vlan_name_prefix: "reservation".to_string(),
            retry: RetryConfig::DEFAULT,
            operation_timeout: Duration::from_secs(30),
            run_budget: Duration::from_secs(120),
            lock_wait: Duration::from_secs(180),
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub interface: InterfaceName,
    pub vlan: VlanId,
    /// Whether this run created the VLAN.
    pub vlan_created: bool,
    /// Device operation retries consumed, across all steps.
    pub retries: u32,
}

/// Why a run failed.
#[derive(Debug, Error)]
pub enum ReconcileFailure {
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(
        "convergence check failed on {interface}: expected VLAN {expected}, switch reports VLAN {actual}"
    )]
    Convergence {
        interface: InterfaceName,
        expected: VlanId,
        actual: VlanId,
    },

    #[error("reconciliation of {interface} exceeded its {budget:?} budget")]
    BudgetExceeded {
        interface: InterfaceName,
        budget: Duration,
    },
}

/// A failed run, with the retries it consumed before failing.
#[derive(Debug, Error)]
#[error("{failure}")]
pub struct ReconcileError {
    pub failure: ReconcileFailure,
    pub retries: u32,
}

impl From<ReconcileFailure> for ReconcileError {
    fn from(failure: ReconcileFailure) -> Self {
        ReconcileError {
            failure,
            retries: 0,
        }
    }
}

/// Mutable bookkeeping for one run.
#[derive(Debug, Default)]
struct RunProgress {
    retries: u32,
    vlan_created: bool,
}

/// Drives the switch to desired states, one interface at a time.
#[derive(Debug)]
pub struct Reconciler<C> {
    connector: C,
    locks: InterfaceLocks,
    settings: ReconcileSettings,
}

impl<C: SwitchConnector> Reconciler<C> {
    pub fn new(connector: C, settings: ReconcileSettings) -> Self {
        Reconciler {
            connector,
            locks: InterfaceLocks::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    pub fn locks(&self) -> &InterfaceLocks {
        &self.locks
    }

    /// Converges one interface to `desired`.
    #[instrument(
        skip(self, desired),
        fields(interface = %desired.interface_name, vlan = %desired.target_vlan)
    )]
    pub async fn reconcile(
        &self,
        desired: &VlanDesiredState,
    ) -> Result<ReconcileReport, ReconcileError> {
        let interface = &desired.interface_name;
        let _guard = self
            .locks
            .acquire(interface, self.settings.lock_wait)
            .await
            .map_err(|e| {
                warn!(error = %e, "Gave up waiting for interface lock");
                ReconcileFailure::from(e)
            })?;

        let steps = plan_steps(desired, &self.settings.vlan_name_prefix);
        let deadline = run_deadline(Instant::now(), self.settings.run_budget);
        let mut progress = RunProgress::default();

        let seed = interface.as_str();

        let opened = tokio::time::timeout_at(deadline, self.open(seed, &mut progress)).await;
        let session = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                error!(error = %e, retries = progress.retries, "Could not open switch session");
                return Err(ReconcileError {
                    failure: e.into(),
                    retries: progress.retries,
                });
            }
            Err(_) => return Err(self.budget_exceeded(interface, &progress)),
        };

        let applied =
            tokio::time::timeout_at(deadline, self.apply(&session, seed, &steps, &mut progress))
                .await;
        self.close(session).await;

        match applied {
            Ok(Ok(())) => {
                info!(
                    vlan_created = progress.vlan_created,
                    retries = progress.retries,
                    "Interface reconciled"
                );
                Ok(ReconcileReport {
                    interface: interface.clone(),
                    vlan: desired.target_vlan,
                    vlan_created: progress.vlan_created,
                    retries: progress.retries,
                })
            }
            Ok(Err(failure)) => Err(ReconcileError {
                failure,
                retries: progress.retries,
            }),
            Err(_) => Err(self.budget_exceeded(interface, &progress)),
        }
    }

    fn budget_exceeded(&self, interface: &InterfaceName, progress: &RunProgress) -> ReconcileError {
        error!(budget = ?self.settings.run_budget, "Reconciliation budget exhausted");
        ReconcileError {
            failure: ReconcileFailure::BudgetExceeded {
                interface: interface.clone(),
                budget: self.settings.run_budget,
            },
            retries: progress.retries,
        }
    }

    /// Runs one device operation under the operation timeout and retry policy.
    ///
    /// `seed` keys the retry jitter; runs use their interface name.
    async fn device_call<T, F, Fut>(
        &self,
        operation: DeviceOperation,
        seed: &str,
        progress: &mut RunProgress,
        mut call: F,
    ) -> Result<T, DeviceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let timeout = self.settings.operation_timeout;
        let result = retry_with_backoff(&self.settings.retry, seed, || {
            with_timeout(operation, timeout, call())
        })
        .await;
        progress.retries += result.retries();
        result.into_result()
    }

    async fn open(&self, seed: &str, progress: &mut RunProgress) -> Result<C::Session, DeviceError> {
        self.device_call(DeviceOperation::Open, seed, progress, || {
            self.connector.open()
        })
        .await
    }

    async fn apply(
        &self,
        session: &C::Session,
        seed: &str,
        steps: &[DeviceStep],
        progress: &mut RunProgress,
    ) -> Result<(), ReconcileFailure> {
        for step in steps {
            debug!(?step, "Executing step");
            match step {
                DeviceStep::EnsureVlan { vlan, name } => {
                    let vlan = *vlan;
                    let exists = self
                        .device_call(DeviceOperation::VlanExists, seed, progress, || {
                            session.vlan_exists(vlan)
                        })
                        .await?;
                    if exists {
                        debug!(%vlan, "VLAN already present");
                    } else {
                        self.device_call(DeviceOperation::CreateVlan, seed, progress, || {
                            session.create_vlan(vlan, name)
                        })
                        .await?;
                        progress.vlan_created = true;
                        info!(%vlan, name = %name, "Created VLAN");
                    }
                }
                DeviceStep::AssignVlan { interface, vlan } => {
                    let vlan = *vlan;
                    self.device_call(DeviceOperation::SetInterfaceVlan, seed, progress, || {
                        session.set_interface_vlan(interface, vlan)
                    })
                    .await?;
                    info!(%interface, %vlan, "Assigned interface to VLAN");
                }
                DeviceStep::EnableInterface { interface } => {
                    self.device_call(
                        DeviceOperation::SetInterfaceAdminUp,
                        seed,
                        progress,
                        || session.set_interface_admin_up(interface),
                    )
                    .await?;
                }
                DeviceStep::VerifyVlan {
                    interface,
                    expected,
                } => {
                    let actual = self
                        .device_call(
                            DeviceOperation::ReadInterfaceVlan,
                            seed,
                            progress,
                            || session.read_interface_vlan(interface),
                        )
                        .await?;
                    if actual != *expected {
                        error!(
                            %interface,
                            expected = %expected,
                            actual = %actual,
                            "CONVERGENCE FAILURE: switch does not report the VLAN just configured"
                        );
                        return Err(ReconcileFailure::Convergence {
                            interface: interface.clone(),
                            expected: *expected,
                            actual,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(&self, session: C::Session) {
        if tokio::time::timeout(self.settings.operation_timeout, session.close())
            .await
            .is_err()
        {
            warn!("Closing the switch session timed out");
        }
    }
}

/// When a run started at `start` must finish. A budget too large to represent
/// leaves the run effectively unbounded.
fn run_deadline(start: Instant, budget: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);
    start
        .checked_add(budget)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::DeviceErrorKind;
    use crate::test_utils::{FakeCall, FakeSwitch, arb_interface_name, arb_vlan_id};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn settings() -> ReconcileSettings {
        ReconcileSettings {
            default_vlan: VlanId::new(10).unwrap(),
            vlan_name_prefix: "reservation".to_string(),
            retry: RetryConfig::new(
                3,
                Duration::from_millis(1),
                Duration::from_millis(5),
                2.0,
                0,
            ),
            operation_timeout: Duration::from_secs(1),
            run_budget: Duration::from_secs(5),
            lock_wait: Duration::from_secs(5),
        }
    }

    fn start(interface: &str, vlan: u16) -> VlanDesiredState {
        VlanDesiredState {
            interface_name: InterfaceName::parse(interface).unwrap(),
            target_vlan: VlanId::new(vlan).unwrap(),
            create_if_missing: true,
        }
    }

    fn end(interface: &str) -> VlanDesiredState {
        VlanDesiredState {
            interface_name: InterfaceName::parse(interface).unwrap(),
            target_vlan: settings().default_vlan,
            create_if_missing: false,
        }
    }

    fn is_create(call: &FakeCall) -> bool {
        matches!(call, FakeCall::CreateVlan(..))
    }

    const GI1: &str = "GigabitEthernet1/0/1";

    #[tokio::test]
    async fn start_creates_vlan_then_assigns_and_enables() {
        let switch = FakeSwitch::new();
        let reconciler = Reconciler::new(switch.clone(), settings());

        let report = reconciler.reconcile(&start(GI1, 20)).await.unwrap();

        assert!(report.vlan_created);
        assert_eq!(report.retries, 0);
        assert_eq!(switch.vlan_name(20).as_deref(), Some("reservation-20"));
        let port = switch.port(GI1);
        assert_eq!(port.vlan.get(), 20);
        assert!(port.admin_up);

        let vlan = VlanId::new(20).unwrap();
        assert_eq!(
            switch.calls(),
            vec![
                FakeCall::Open,
                FakeCall::VlanExists(vlan),
                FakeCall::CreateVlan(vlan, "reservation-20".to_string()),
                FakeCall::SetInterfaceVlan(GI1.to_string(), vlan),
                FakeCall::SetInterfaceAdminUp(GI1.to_string()),
                FakeCall::ReadInterfaceVlan(GI1.to_string()),
                FakeCall::Close,
            ]
        );
        assert_eq!(switch.sessions_closed(), 1);
        assert_eq!(switch.active_sessions(), 0);
    }

    #[tokio::test]
    async fn unbounded_run_budget_still_reconciles() {
        let switch = FakeSwitch::new();
        let reconciler = Reconciler::new(
            switch.clone(),
            ReconcileSettings {
                run_budget: Duration::MAX,
                ..settings()
            },
        );

        let report = reconciler.reconcile(&start(GI1, 20)).await.unwrap();

        assert_eq!(report.vlan.get(), 20);
        assert_eq!(switch.port(GI1).vlan.get(), 20);
    }

    #[tokio::test]
    async fn run_deadline_saturates() {
        let now = Instant::now();
        assert_eq!(run_deadline(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert!(run_deadline(now, Duration::MAX) > now + Duration::from_secs(86400 * 365));
    }

    #[tokio::test]
    async fn duplicate_start_skips_vlan_creation() {
        let switch = FakeSwitch::new();
        let reconciler = Reconciler::new(switch.clone(), settings());

        let first = reconciler.reconcile(&start(GI1, 20)).await.unwrap();
        let second = reconciler.reconcile(&start(GI1, 20)).await.unwrap();

        assert!(first.vlan_created);
        assert!(!second.vlan_created);
        assert_eq!(switch.count_calls(is_create), 1);
        assert_eq!(switch.port(GI1).vlan.get(), 20);
    }

    #[tokio::test]
    async fn end_returns_to_default_vlan_without_creating() {
        let switch = FakeSwitch::new().with_vlan(20).with_vlan(10);
        let reconciler = Reconciler::new(switch.clone(), settings());
        reconciler.reconcile(&start(GI1, 20)).await.unwrap();

        let report = reconciler.reconcile(&end(GI1)).await.unwrap();

        assert_eq!(report.vlan.get(), 10);
        assert!(!report.vlan_created);
        assert_eq!(switch.port(GI1).vlan.get(), 10);
        // Only the START run asked about VLANs.
        assert_eq!(switch.count_calls(|c| matches!(c, FakeCall::VlanExists(_))), 1);
        assert_eq!(switch.count_calls(is_create), 0);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_and_counted() {
        let switch = FakeSwitch::new()
            .failing_opens(1)
            .failing_calls(DeviceOperation::SetInterfaceVlan, 1);
        let reconciler = Reconciler::new(switch.clone(), settings());

        let report = reconciler.reconcile(&start(GI1, 20)).await.unwrap();

        assert_eq!(report.retries, 2);
        assert_eq!(switch.port(GI1).vlan.get(), 20);
        assert_eq!(
            switch.count_calls(|c| matches!(c, FakeCall::SetInterfaceVlan(..))),
            2
        );
    }

    #[tokio::test]
    async fn unreachable_switch_exhausts_retries_and_releases_lock() {
        let switch = FakeSwitch::new().unreachable();
        let reconciler = Reconciler::new(switch.clone(), settings());

        let err = reconciler.reconcile(&start(GI1, 20)).await.unwrap_err();

        match &err.failure {
            ReconcileFailure::Device(e) => {
                assert_eq!(e.kind, DeviceErrorKind::Connection);
                assert_eq!(e.operation, DeviceOperation::Open);
            }
            other => panic!("expected device error, got {other:?}"),
        }
        assert_eq!(err.retries, 2);
        assert_eq!(switch.count_calls(|c| *c == FakeCall::Open), 3);
        assert_eq!(switch.sessions_opened(), 0);
        assert_eq!(reconciler.locks().in_flight(), 0);
    }

    #[tokio::test]
    async fn rejected_command_is_not_retried_and_session_closes() {
        let switch = FakeSwitch::new().rejecting(DeviceOperation::CreateVlan);
        let reconciler = Reconciler::new(switch.clone(), settings());

        let err = reconciler.reconcile(&start(GI1, 20)).await.unwrap_err();

        assert!(matches!(
            &err.failure,
            ReconcileFailure::Device(e) if e.kind == DeviceErrorKind::Command
        ));
        assert_eq!(switch.count_calls(is_create), 1);
        assert_eq!(
            switch.count_calls(|c| matches!(c, FakeCall::SetInterfaceVlan(..))),
            0
        );
        assert_eq!(switch.calls().last(), Some(&FakeCall::Close));
        assert_eq!(switch.active_sessions(), 0);
    }

    #[tokio::test]
    async fn convergence_mismatch_fails_without_retry() {
        let switch = FakeSwitch::new().misreporting(99);
        let reconciler = Reconciler::new(switch.clone(), settings());

        let err = reconciler.reconcile(&start(GI1, 20)).await.unwrap_err();

        match err.failure {
            ReconcileFailure::Convergence {
                expected, actual, ..
            } => {
                assert_eq!(expected.get(), 20);
                assert_eq!(actual.get(), 99);
            }
            other => panic!("expected convergence failure, got {other:?}"),
        }
        assert_eq!(
            switch.count_calls(|c| matches!(c, FakeCall::ReadInterfaceVlan(_))),
            1
        );
        assert_eq!(switch.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn budget_expiry_still_closes_session() {
        let switch = FakeSwitch::new().with_delay(Duration::from_millis(40));
        let reconciler = Reconciler::new(
            switch.clone(),
            ReconcileSettings {
                run_budget: Duration::from_millis(60),
                ..settings()
            },
        );

        let err = reconciler.reconcile(&start(GI1, 20)).await.unwrap_err();

        assert!(matches!(
            err.failure,
            ReconcileFailure::BudgetExceeded { .. }
        ));
        assert_eq!(switch.sessions_opened(), 1);
        assert_eq!(switch.sessions_closed(), 1);
        assert_eq!(switch.active_sessions(), 0);
        assert_eq!(reconciler.locks().in_flight(), 0);
    }

    #[tokio::test]
    async fn lock_wait_is_bounded() {
        let switch = FakeSwitch::new();
        let reconciler = Reconciler::new(
            switch.clone(),
            ReconcileSettings {
                lock_wait: Duration::from_millis(20),
                ..settings()
            },
        );
        let interface = InterfaceName::parse(GI1).unwrap();
        let _held = reconciler
            .locks()
            .acquire(&interface, Duration::from_secs(1))
            .await
            .unwrap();

        let err = reconciler.reconcile(&start(GI1, 20)).await.unwrap_err();

        assert!(matches!(err.failure, ReconcileFailure::LockTimeout(_)));
        assert!(switch.calls().is_empty());
    }

    #[tokio::test]
    async fn same_interface_runs_never_overlap() {
        let switch = FakeSwitch::new()
            .with_vlan(10)
            .with_delay(Duration::from_millis(10));
        let reconciler = Arc::new(Reconciler::new(switch.clone(), settings()));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let reconciler = Arc::clone(&reconciler);
                let desired = if i % 2 == 0 { start(GI1, 20) } else { end(GI1) };
                tokio::spawn(async move { reconciler.reconcile(&desired).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(switch.sessions_opened(), 4);
        assert_eq!(switch.max_concurrent_sessions(), 1);
    }

    #[tokio::test]
    async fn distinct_interfaces_run_in_parallel() {
        let switch = FakeSwitch::new().with_delay(Duration::from_millis(50));
        let reconciler = Arc::new(Reconciler::new(switch.clone(), settings()));

        let a = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.reconcile(&start(GI1, 20)).await })
        };
        let b = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move {
                reconciler
                    .reconcile(&start("GigabitEthernet1/0/2", 30))
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(switch.max_concurrent_sessions(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Replaying a START leaves the same end state and creates nothing new.
        #[test]
        fn replayed_start_is_idempotent(interface in arb_interface_name(), vlan in arb_vlan_id()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let switch = FakeSwitch::new();
            let reconciler = Reconciler::new(switch.clone(), settings());
            let desired = VlanDesiredState {
                interface_name: interface.clone(),
                target_vlan: vlan,
                create_if_missing: true,
            };

            let first = rt.block_on(reconciler.reconcile(&desired)).unwrap();
            let after_first = switch.port(interface.as_str());
            let second = rt.block_on(reconciler.reconcile(&desired)).unwrap();

            prop_assert!(first.vlan_created);
            prop_assert!(!second.vlan_created);
            prop_assert!(switch.count_calls(|c| matches!(c, FakeCall::CreateVlan(..))) <= 1);
            prop_assert_eq!(switch.port(interface.as_str()), after_first);
            prop_assert_eq!(after_first.vlan, vlan);
        }
    }
}

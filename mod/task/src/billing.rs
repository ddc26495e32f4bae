use atelier_core::ServiceError;
use tracing::{debug, warn};

use crate::model::{BillingInfo, BillingStatus, Task};

/// Seam to the billing backend holding charge reservations.
///
/// Submission freezes a provisional charge for billable work; the engine
/// only ever needs the reverse operation. Calls are bounded within the
/// enclosing request or watchdog tick.
pub trait BillingGateway: Send + Sync {
    /// Roll back a charge reservation so the owner is not billed for work
    /// that produced no output.
    fn release_freeze(&self, freeze_id: &str, billing_key: Option<&str>) -> Result<(), ServiceError>;
}

/// What happened when compensation was attempted for a task.
///
/// `attempted && !rolled_back` is the case that must never be silently
/// merged with ordinary failures: the financial ledger now needs manual
/// reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub attempted: bool,
    pub rolled_back: bool,
}

impl RollbackOutcome {
    pub fn not_applicable() -> Self {
        Self {
            attempted: false,
            rolled_back: false,
        }
    }

    pub fn compensation_failed(&self) -> bool {
        self.attempted && !self.rolled_back
    }
}

/// Attempt to roll back the task's frozen reservation, if it holds one.
///
/// Returns the outcome plus the billing record to persist alongside the
/// terminal write (None when the task held no reservation). Never errors:
/// a gateway failure is recorded in the outcome, not propagated.
pub fn rollback_for_task(
    gateway: &dyn BillingGateway,
    task: &Task,
) -> (RollbackOutcome, Option<BillingInfo>) {
    let Some(billing) = task.billing_info.as_ref() else {
        return (RollbackOutcome::not_applicable(), None);
    };
    let Some(freeze_id) = billing.frozen_freeze_id() else {
        return (RollbackOutcome::not_applicable(), None);
    };

    let mut updated = billing.clone();
    match gateway.release_freeze(freeze_id, billing.billing_key.as_deref()) {
        Ok(()) => {
            debug!("released freeze {freeze_id} for task {}", task.id);
            updated.status = Some(BillingStatus::RolledBack);
            (
                RollbackOutcome {
                    attempted: true,
                    rolled_back: true,
                },
                Some(updated),
            )
        }
        Err(e) => {
            warn!("freeze release failed for task {} ({freeze_id}): {e}", task.id);
            updated.status = Some(BillingStatus::Failed);
            (
                RollbackOutcome {
                    attempted: true,
                    rolled_back: false,
                },
                Some(updated),
            )
        }
    }
}

/// Gateway for deployments without a billing backend: every release
/// succeeds, so billable tasks never strand a reservation.
pub struct NoopBillingGateway;

impl BillingGateway for NoopBillingGateway {
    fn release_freeze(&self, freeze_id: &str, _billing_key: Option<&str>) -> Result<(), ServiceError> {
        debug!("noop billing gateway: release freeze {freeze_id}");
        Ok(())
    }
}

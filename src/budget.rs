use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::error::DriftError;

#[derive(Debug)]
struct Ledger {
    spent: f64,
    ceiling: f64,
    exhausted: bool,
}

/// Process-wide admission control shared by every branch of every model:
/// a bounded pool of in-flight slots and a hard monetary ceiling.
///
/// Admission is checked against an estimate before dispatch; the ledger is
/// charged with the actual cost on release. Once the ledger latches
/// `exhausted`, every later `try_admit` fails fast with `BudgetExceeded`,
/// and the slot pool is closed so callers parked on a slot are woken rather
/// than left blocking.
#[derive(Debug)]
pub struct RateBudgetController {
    slots: Arc<Semaphore>,
    ledger: Mutex<Ledger>,
}

/// Proof of admission for one dispatch. Must be handed back through
/// [`RateBudgetController::release`] so the slot frees and the ledger is
/// charged with what the call actually cost.
#[derive(Debug)]
pub struct AdmitPermit {
    _slot: OwnedSemaphorePermit,
    estimate: f64,
}

impl AdmitPermit {
    pub fn estimate(&self) -> f64 {
        self.estimate
    }
}

impl RateBudgetController {
    pub fn new(max_in_flight: usize, budget_usd: f64) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_in_flight.max(1))),
            ledger: Mutex::new(Ledger {
                spent: 0.0,
                ceiling: budget_usd,
                exhausted: false,
            }),
        }
    }

    /// Waits cooperatively for a free slot, then admits the dispatch if the
    /// estimate still fits under the ceiling.
    pub async fn try_admit(&self, estimated_cost: f64) -> Result<AdmitPermit, DriftError> {
        self.check(estimated_cost)?;

        let slot = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(slot) => slot,
            // Pool closed: the ledger latched while this caller waited.
            Err(_) => return Err(self.exceeded()),
        };

        // The ledger may have moved while this caller held no slot.
        self.check(estimated_cost)?;

        Ok(AdmitPermit {
            _slot: slot,
            estimate: estimated_cost,
        })
    }

    /// Frees the slot and charges the ledger with the actual cost. Called on
    /// success and failure alike; failed dispatches charge zero.
    pub fn release(&self, permit: AdmitPermit, actual_cost: f64) {
        drop(permit);
        let mut ledger = self.ledger.lock().unwrap();
        ledger.spent += actual_cost;
        if !ledger.exhausted && ledger.spent >= ledger.ceiling {
            ledger.exhausted = true;
            self.slots.close();
            warn!(
                spent = ledger.spent,
                ceiling = ledger.ceiling,
                "budget ceiling reached, halting further dispatch"
            );
        }
    }

    pub fn current_spend(&self) -> f64 {
        self.ledger.lock().unwrap().spent
    }

    pub fn is_exhausted(&self) -> bool {
        self.ledger.lock().unwrap().exhausted
    }

    fn check(&self, estimate: f64) -> Result<(), DriftError> {
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.exhausted {
            return Err(DriftError::BudgetExceeded {
                spent: ledger.spent,
                ceiling: ledger.ceiling,
            });
        }
        if ledger.spent + estimate > ledger.ceiling {
            ledger.exhausted = true;
            self.slots.close();
            warn!(
                spent = ledger.spent,
                estimate, "estimated cost would cross the ceiling, halting further dispatch"
            );
            return Err(DriftError::BudgetExceeded {
                spent: ledger.spent,
                ceiling: ledger.ceiling,
            });
        }
        Ok(())
    }

    fn exceeded(&self) -> DriftError {
        let ledger = self.ledger.lock().unwrap();
        DriftError::BudgetExceeded {
            spent: ledger.spent,
            ceiling: ledger.ceiling,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::error::DriftError;

    #[tokio::test]
    async fn admits_and_charges_actual_cost() {
        let controller = RateBudgetController::new(2, 1.0);
        let permit = controller.try_admit(0.10).await.expect("admit");
        assert_eq!(permit.estimate(), 0.10);
        controller.release(permit, 0.25);
        assert!((controller.current_spend() - 0.25).abs() < 1e-9);
        assert!(!controller.is_exhausted());
    }

    #[tokio::test]
    async fn latches_once_actual_spend_crosses_ceiling() {
        let controller = RateBudgetController::new(2, 0.5);
        let permit = controller.try_admit(0.10).await.expect("admit");
        controller.release(permit, 0.60);
        assert!(controller.is_exhausted());

        // Every later admission fails regardless of estimate.
        for _ in 0..3 {
            let err = controller.try_admit(0.0).await.unwrap_err();
            assert!(matches!(err, DriftError::BudgetExceeded { .. }));
        }
    }

    #[tokio::test]
    async fn rejecting_estimate_latches_too() {
        let controller = RateBudgetController::new(2, 1.0);
        let err = controller.try_admit(2.0).await.unwrap_err();
        assert!(matches!(err, DriftError::BudgetExceeded { .. }));
        // A tiny estimate no longer gets through.
        let err = controller.try_admit(0.01).await.unwrap_err();
        assert!(matches!(err, DriftError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn concurrency_ceiling_blocks_until_release() {
        let controller = Arc::new(RateBudgetController::new(1, 10.0));
        let first = controller.try_admit(0.0).await.expect("admit");

        let second = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.try_admit(0.0).await })
        };

        // The second caller is parked on the slot pool.
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        controller.release(first, 0.0);
        let permit = timeout(Duration::from_secs(1), second)
            .await
            .expect("woken")
            .expect("join")
            .expect("admit");
        controller.release(permit, 0.0);
    }

    #[tokio::test]
    async fn exhaustion_wakes_blocked_waiters() {
        let controller = Arc::new(RateBudgetController::new(1, 0.5));
        let held = controller.try_admit(0.1).await.expect("admit");

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.try_admit(0.1).await })
        };
        tokio::task::yield_now().await;

        // Releasing with a cost past the ceiling closes the pool.
        controller.release(held, 1.0);
        let result = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join");
        assert!(matches!(result, Err(DriftError::BudgetExceeded { .. })));
    }
}

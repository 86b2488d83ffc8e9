//! Reconciliation: persist derived states that time has made true.
//!
//! Reads always derive `expired` and `overdue` on the fly, so this pass only
//! brings stored statuses and the active-contract index in line with them.
//! Every candidate is re-checked inside its own transaction, which makes the
//! pass idempotent and safe to run alongside user writes.

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::access::{authorize, Operation, Stakeholders};
use crate::error::Result;
use crate::models::{Contract, ContractStatus, Payment, PaymentStatus, User};
use crate::registry::Registry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub as_of: Option<NaiveDate>,
    pub expired_contracts: usize,
    pub overdue_payments: usize,
    /// Overdue payments whose due date moved back into the future
    pub restored_payments: usize,
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} contract(s) expired, {} payment(s) overdue, {} payment(s) back to pending",
            self.expired_contracts, self.overdue_payments, self.restored_payments
        )
    }
}

impl Registry {
    /// Run reconciliation on behalf of a user
    pub fn reconcile(&self, actor: &User) -> Result<ReconcileReport> {
        authorize(actor, Operation::Reconcile, &Stakeholders::default())?;
        self.reconcile_on(self.today())
    }

    /// Run reconciliation as of `today`
    #[tracing::instrument(skip(self))]
    pub fn reconcile_on(&self, today: NaiveDate) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            as_of: Some(today),
            ..Default::default()
        };

        for contract in self.storage().scan::<Contract>()? {
            if contract.status != ContractStatus::Active || contract.is_active_on(today) {
                continue;
            }
            let expired = self.storage().transaction(|tx| {
                let Some(mut current) = tx.get::<Contract>(contract.id)? else {
                    return Ok(false);
                };
                if current.status != ContractStatus::Active || current.is_active_on(today) {
                    return Ok(false);
                }
                current.status = ContractStatus::Expired;
                tx.put(&current)?;
                tx.release_active(current.property_id, current.id)?;
                Ok(true)
            })?;
            if expired {
                tracing::info!(
                    contract_id = contract.id,
                    end_date = %contract.end_date,
                    "contract expired"
                );
                report.expired_contracts += 1;
            }
        }

        for payment in self.storage().scan::<Payment>()? {
            if payment.effective_status(today) == payment.status {
                continue;
            }
            let moved = self.storage().transaction(|tx| {
                let Some(mut current) = tx.get::<Payment>(payment.id)? else {
                    return Ok(None);
                };
                let next = current.effective_status(today);
                if next == current.status {
                    return Ok(None);
                }
                current.status = next;
                tx.put(&current)?;
                Ok(Some(next))
            })?;
            match moved {
                Some(PaymentStatus::Overdue) => {
                    tracing::info!(
                        payment_id = payment.id,
                        due_date = %payment.due_date,
                        "payment overdue"
                    );
                    report.overdue_payments += 1;
                }
                Some(_) => report.restored_payments += 1,
                None => {}
            }
        }

        tracing::info!(%report, "reconciliation finished");
        Ok(report)
    }
}

/// Spawn the periodic reconciliation loop.
///
/// The first pass runs immediately. sled calls block, so each pass runs on
/// the blocking pool.
pub fn spawn_reconciler(registry: Registry, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let registry = registry.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let today = registry.today();
                registry.reconcile_on(today)
            })
            .await;
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "reconciliation failed"),
                Err(e) => tracing::error!(error = %e, "reconciliation task panicked"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::models::{
        Contract, ContractStatus, NewPayment, Payment, PaymentStatus, PaymentType, PropertyStatus,
        UserRole,
    };
    use crate::registry::testing::{date, Fixture};

    #[test]
    fn test_pass_is_idempotent() {
        let fx = Fixture::new(date(2024, 1, 1));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let tenant = fx.user("t@example.com", UserRole::Tenant);
        let property = fx.property(&owner);
        let contract = fx.active_contract(&property, &tenant, date(2023, 6, 1), date(2024, 2, 29));
        fx.registry
            .create_payment(
                &fx.admin,
                NewPayment {
                    amount: 900.0,
                    kind: PaymentType::Rent,
                    due_date: date(2024, 1, 5),
                    reference: None,
                    notes: None,
                    contract_id: contract.id,
                },
            )
            .unwrap();

        fx.clock.set(date(2024, 3, 1));
        let first = fx.registry.reconcile(&fx.admin).unwrap();
        assert_eq!(first.expired_contracts, 1);
        assert_eq!(first.overdue_payments, 1);

        let second = fx.registry.reconcile(&fx.admin).unwrap();
        assert_eq!(second.expired_contracts, 0);
        assert_eq!(second.overdue_payments, 0);

        let stored: Contract = fx.registry.storage().fetch(contract.id).unwrap();
        assert_eq!(stored.status, ContractStatus::Expired);
        assert_eq!(fx.registry.storage().active_contract_for(property.id).unwrap(), None);
        assert_eq!(
            fx.registry.get_property(&owner, property.id).unwrap().status,
            PropertyStatus::Available
        );
        let payments: Vec<Payment> = fx.registry.storage().scan().unwrap();
        assert!(payments.iter().all(|p| p.status == PaymentStatus::Overdue));
    }

    #[test]
    fn test_only_staff_trigger_reconciliation() {
        let fx = Fixture::new(date(2024, 1, 1));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let err = fx.registry.reconcile(&owner).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_background_loop_runs_first_pass_immediately() {
        let fx = Fixture::new(date(2024, 1, 1));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let tenant = fx.user("t@example.com", UserRole::Tenant);
        let property = fx.property(&owner);
        let contract = fx.active_contract(&property, &tenant, date(2023, 1, 1), date(2024, 1, 31));
        fx.clock.set(date(2024, 2, 1));

        let every = std::time::Duration::from_secs(3600);
        let handle = super::spawn_reconciler(fx.registry.clone(), every);
        let mut expired = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let stored: Contract = fx.registry.storage().fetch(contract.id).unwrap();
            if stored.status == ContractStatus::Expired {
                expired = true;
                break;
            }
        }
        handle.abort();
        assert!(expired);
    }
}

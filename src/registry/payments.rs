use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;

use crate::access::{authorize, is_allowed, Operation, Stakeholders};
use crate::error::{Error, Result, Validator};
use crate::integrity::{self, References};
use crate::lifecycle::{guard, payment_status};
use crate::models::{
    Contract, ContractType, Id, MarkPaid, NewPayment, Payment, PaymentStatus,
    PaymentType, PaymentUpdate, Property, User,
};
use crate::query::{Filter, Page, PaymentFilter, Query};
use crate::storage::{fail, lift, Relation, Tx, TxResult};

use super::Registry;

fn validate(p: &Payment) -> Result<()> {
    let mut v = Validator::new();
    v.non_negative(p.amount, "amount");
    if let Some(reference) = &p.reference {
        v.not_blank(reference, "reference").max_len(reference, 64, "reference");
    }
    v.finish()
}

/// Load the payment's contract and check the actor may manage its payments.
fn managed_contract(tx: &Tx<'_>, actor: &User, contract_id: Id) -> TxResult<Contract> {
    let contract: Contract = tx.fetch(contract_id)?;
    let property: Property = tx.fetch(contract.property_id)?;
    lift(authorize(
        actor,
        Operation::ManagePayment,
        &Stakeholders::contract(property.owner_id, &contract),
    ))?;
    Ok(contract)
}

/// Last day of the month containing `date`
fn month_end(date: NaiveDate) -> Option<NaiveDate> {
    let (y, m) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1).map(|first| first - Duration::days(1))
}

/// Due date for `payment_day` in the month of `month`, clamped to its last day
fn due_in_month(month: NaiveDate, payment_day: u8) -> Option<NaiveDate> {
    let last = month_end(month)?;
    let day = u32::from(payment_day).clamp(1, last.day());
    NaiveDate::from_ymd_opt(month.year(), month.month(), day)
}

/// Rent due dates of a contract from `from` through its end date
pub(crate) fn rent_due_dates(contract: &Contract, from: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let Some(mut month) = from.with_day(1) else {
        return out;
    };
    while month <= contract.end_date {
        if let Some(due) = due_in_month(month, contract.payment_day) {
            if due >= from && due <= contract.end_date {
                out.push(due);
            }
        }
        month = match month_end(month) {
            Some(last) => last + Duration::days(1),
            None => break,
        };
    }
    out
}

fn rent_reference(contract_id: Id, due: NaiveDate) -> String {
    format!("RENT-{}-{:04}{:02}", contract_id, due.year(), due.month())
}

/// Outcome of [`Registry::generate_rent_payments`]
#[derive(Debug, Clone, Serialize)]
pub struct RentSchedule {
    pub created: Vec<Payment>,
    /// Months that already had a rent payment
    pub skipped: usize,
}

impl Registry {
    #[tracing::instrument(
        skip(self, actor, input),
        fields(actor = actor.id, contract_id = input.contract_id)
    )]
    pub fn create_payment(&self, actor: &User, input: NewPayment) -> Result<Payment> {
        let payment = Payment {
            id: self.storage.next_id()?,
            amount: input.amount,
            kind: input.kind,
            status: PaymentStatus::Pending,
            due_date: input.due_date,
            paid_date: None,
            reference: input.reference.map(|r| r.trim().to_string()),
            notes: input.notes,
            contract_id: input.contract_id,
        };
        validate(&payment)?;
        let today = self.today();

        self.storage.transaction(|tx| {
            let mut refs = References::new(tx);
            refs.contract("contract_id", payment.contract_id)?;
            refs.finish()?;
            let contract = managed_contract(tx, actor, payment.contract_id)?;
            if !contract.is_active_on(today) {
                return fail(Error::conflict_on(
                    "contract_id",
                    format!(
                        "contract {} is {}; payments can only be added to active contracts",
                        contract.id,
                        contract.effective_status(today)
                    ),
                ));
            }
            if let Some(reference) = &payment.reference {
                tx.claim_reference(reference, payment.id)?;
            }
            tx.put(&payment)?;
            tx.link(Relation::ContractPayments, payment.contract_id, payment.id)
        })?;
        tracing::info!(payment_id = payment.id, amount = payment.amount, "payment created");
        Ok(payment.as_of(today))
    }

    pub fn get_payment(&self, actor: &User, id: Id) -> Result<Payment> {
        let payment = self.storage.fetch::<Payment>(id)?;
        let contract = self.storage.fetch::<Contract>(payment.contract_id)?;
        let owner = self.storage.fetch::<Property>(contract.property_id)?.owner_id;
        authorize(
            actor,
            Operation::ViewPayment,
            &Stakeholders::contract(owner, &contract),
        )?;
        Ok(payment.as_of(self.today()))
    }

    #[tracing::instrument(skip(self, actor, patch), fields(actor = actor.id))]
    pub fn update_payment(&self, actor: &User, id: Id, patch: PaymentUpdate) -> Result<Payment> {
        let today = self.today();
        let updated = self.storage.transaction(|tx| {
            let current: Payment = tx.fetch(id)?;
            managed_contract(tx, actor, current.contract_id)?;
            integrity::ensure_editable(id, current.status)?;

            let mut next = current.clone();
            if let Some(v) = patch.amount {
                next.amount = v;
            }
            if let Some(v) = patch.kind {
                next.kind = v;
            }
            if let Some(v) = patch.due_date {
                next.due_date = v;
            }
            if let Some(v) = &patch.reference {
                next.reference = Some(v.trim().to_string());
            }
            if let Some(v) = &patch.notes {
                next.notes = Some(v.clone());
            }
            lift(validate(&next))?;

            if next.reference != current.reference {
                if let Some(reference) = &next.reference {
                    tx.claim_reference(reference, id)?;
                }
                if let Some(old) = &current.reference {
                    tx.release_reference(old)?;
                }
            }
            // keep the stored status in step with a moved due date
            next.status = payment_status(next.status, next.due_date, today);
            tx.put(&next)?;
            Ok(next)
        })?;
        tracing::info!(payment_id = id, "payment updated");
        Ok(updated)
    }

    /// Record a payment as paid.
    ///
    /// Re-marking with the same date is a no-op; with a different date it is
    /// a conflict. A payment may be settled up to `early_payment_days` before
    /// it is due.
    #[tracing::instrument(skip(self, actor, input), fields(actor = actor.id))]
    pub fn mark_payment_paid(&self, actor: &User, id: Id, input: MarkPaid) -> Result<Payment> {
        let today = self.today();
        let paid_on = input.paid_date.unwrap_or(today);
        let early = Duration::days(self.policy.early_payment_days);
        let payment = self.storage.transaction(|tx| {
            let mut payment: Payment = tx.fetch(id)?;
            managed_contract(tx, actor, payment.contract_id)?;

            if payment.status == PaymentStatus::Paid {
                return match payment.paid_date {
                    Some(d) if d == paid_on => Ok(payment),
                    _ => fail(Error::conflict_on(
                        "paid_date",
                        format!(
                            "payment {} was already paid on {}",
                            id,
                            payment
                                .paid_date
                                .map(|d| d.to_string())
                                .unwrap_or_else(|| "an unknown date".to_string())
                        ),
                    )),
                };
            }
            lift(guard(id, payment.effective_status(today), PaymentStatus::Paid))?;
            if paid_on < payment.due_date - early {
                return fail(Error::invalid(
                    "paid_date",
                    format!(
                        "cannot be more than {} days before the due date {}",
                        early.num_days(),
                        payment.due_date
                    ),
                ));
            }
            payment.status = PaymentStatus::Paid;
            payment.paid_date = Some(paid_on);
            tx.put(&payment)?;
            Ok(payment)
        })?;
        tracing::info!(payment_id = id, paid_date = %paid_on, "payment marked paid");
        Ok(payment)
    }

    #[tracing::instrument(skip(self, actor), fields(actor = actor.id))]
    pub fn cancel_payment(&self, actor: &User, id: Id) -> Result<Payment> {
        let today = self.today();
        let payment = self.storage.transaction(|tx| {
            let mut payment: Payment = tx.fetch(id)?;
            managed_contract(tx, actor, payment.contract_id)?;
            lift(guard(id, payment.effective_status(today), PaymentStatus::Cancelled))?;
            payment.status = PaymentStatus::Cancelled;
            tx.put(&payment)?;
            Ok(payment)
        })?;
        tracing::info!(payment_id = id, "payment cancelled");
        Ok(payment)
    }

    pub fn list_payments(
        &self,
        actor: &User,
        query: &Query<PaymentFilter>,
    ) -> Result<Vec<Payment>> {
        let today = self.today();
        let payments = self
            .storage
            .scan::<Payment>()?
            .into_iter()
            .map(|p| p.as_of(today))
            .collect();
        self.collect_visible(actor, payments, query.page, |parties, p| {
            if !query.filter.matches(p) {
                return Ok(false);
            }
            let who = parties.of_payment(p)?;
            Ok(is_allowed(actor, Operation::ViewPayment, &who))
        })
    }

    pub fn overdue_payments(&self, actor: &User) -> Result<Vec<Payment>> {
        let today = self.today();
        let payments = self
            .storage
            .scan::<Payment>()?
            .into_iter()
            .map(|p| p.as_of(today))
            .filter(|p| p.status == PaymentStatus::Overdue)
            .collect();
        self.collect_visible(actor, payments, Page::all(), |parties, p| {
            let who = parties.of_payment(p)?;
            Ok(is_allowed(actor, Operation::ViewPayment, &who))
        })
    }

    /// Pending payments falling due within `within_days`, soonest first
    pub fn upcoming_payments(
        &self,
        actor: &User,
        within_days: Option<i64>,
    ) -> Result<Vec<Payment>> {
        let days = within_days.unwrap_or(self.policy.payment_reminder_days);
        if days < 0 {
            return Err(Error::invalid("days", "must be >= 0"));
        }
        let today = self.today();
        let horizon = today + Duration::days(days);
        let payments = self
            .storage
            .scan::<Payment>()?
            .into_iter()
            .map(|p| p.as_of(today))
            .filter(|p| p.status == PaymentStatus::Pending && p.due_date <= horizon)
            .collect();
        let mut visible = self.collect_visible(actor, payments, Page::all(), |parties, p| {
            let who = parties.of_payment(p)?;
            Ok(is_allowed(actor, Operation::ViewPayment, &who))
        })?;
        visible.sort_by_key(|p| (p.due_date, p.id));
        Ok(visible)
    }

    /// Create the monthly rent payments still missing for an active rental contract
    #[tracing::instrument(skip(self, actor), fields(actor = actor.id))]
    pub fn generate_rent_payments(&self, actor: &User, contract_id: Id) -> Result<RentSchedule> {
        let today = self.today();
        let contract = self.storage.fetch::<Contract>(contract_id)?;
        let dates = rent_due_dates(&contract, contract.start_date.max(today));
        let mut ids = Vec::with_capacity(dates.len());
        for _ in &dates {
            ids.push(self.storage.next_id()?);
        }

        let schedule = self.storage.transaction(|tx| {
            let contract = managed_contract(tx, actor, contract_id)?;
            if contract.kind != ContractType::Rental || !contract.is_active_on(today) {
                return fail(Error::conflict(format!(
                    "rent is only scheduled for active rental contracts; contract {} is a {} {} contract",
                    contract_id,
                    contract.effective_status(today),
                    contract.kind
                )));
            }

            // a month is covered by a live rent payment due in it or carrying its reference
            let mut covered_dates = Vec::new();
            let mut covered_refs = Vec::new();
            for payment_id in tx.children(Relation::ContractPayments, contract_id)? {
                if let Some(p) = tx.get::<Payment>(payment_id)? {
                    if p.kind == PaymentType::Rent && p.status != PaymentStatus::Cancelled {
                        covered_dates.push(p.due_date);
                        covered_refs.extend(p.reference);
                    }
                }
            }

            let mut created = Vec::new();
            let mut skipped = 0;
            for (due, id) in dates.iter().zip(&ids) {
                let base = rent_reference(contract_id, *due);
                if covered_dates.contains(due) || covered_refs.contains(&base) {
                    skipped += 1;
                    continue;
                }
                // references of cancelled payments stay claimed
                let mut reference = base.clone();
                let mut attempt = 1;
                while tx.reference_holder(&reference)?.is_some() {
                    attempt += 1;
                    reference = format!("{}-{}", base, attempt);
                }
                let payment = Payment {
                    id: *id,
                    amount: contract.rent_amount,
                    kind: PaymentType::Rent,
                    status: PaymentStatus::Pending,
                    due_date: *due,
                    paid_date: None,
                    reference: Some(reference),
                    notes: None,
                    contract_id,
                };
                if let Some(reference) = &payment.reference {
                    tx.claim_reference(reference, payment.id)?;
                }
                tx.put(&payment)?;
                tx.link(Relation::ContractPayments, contract_id, payment.id)?;
                created.push(payment);
            }
            Ok(RentSchedule { created, skipped })
        })?;
        if dates.is_empty() {
            tracing::debug!(contract_id, "no rent months left to schedule");
        }
        tracing::info!(
            contract_id,
            created = schedule.created.len(),
            skipped = schedule.skipped,
            "rent payments generated"
        );
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{NewPayment, UserRole};
    use crate::registry::testing::{date, Fixture};

    fn new_payment(contract_id: Id, due: NaiveDate) -> NewPayment {
        NewPayment {
            amount: 950.0,
            kind: PaymentType::Rent,
            due_date: due,
            reference: None,
            notes: None,
            contract_id,
        }
    }

    fn setup(today: NaiveDate) -> (Fixture, User, Contract) {
        let fx = Fixture::new(today);
        let owner = fx.user("o@example.com", UserRole::Owner);
        let tenant = fx.user("t@example.com", UserRole::Tenant);
        let property = fx.property(&owner);
        let contract = fx.active_contract(&property, &tenant, date(2024, 1, 1), date(2024, 12, 31));
        (fx, owner, contract)
    }

    #[test]
    fn test_overdue_then_paid_scenario() {
        let (fx, _, contract) = setup(date(2024, 1, 1));
        let payment = fx
            .registry
            .create_payment(&fx.admin, new_payment(contract.id, date(2024, 1, 1)))
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);

        fx.clock.set(date(2024, 1, 15));
        let report = fx.registry.reconcile(&fx.admin).unwrap();
        assert_eq!(report.overdue_payments, 1);
        let stored: Payment = fx.registry.storage().fetch(payment.id).unwrap();
        assert_eq!(stored.status, PaymentStatus::Overdue);

        let paid = fx
            .registry
            .mark_payment_paid(
                &fx.admin,
                payment.id,
                MarkPaid {
                    paid_date: Some(date(2024, 1, 16)),
                },
            )
            .unwrap();
        assert_eq!(paid.status, PaymentStatus::Paid);
        assert_eq!(paid.paid_date, Some(date(2024, 1, 16)));
    }

    #[test]
    fn test_mark_paid_is_idempotent_for_same_date() {
        let (fx, _, contract) = setup(date(2024, 2, 1));
        let payment = fx
            .registry
            .create_payment(&fx.admin, new_payment(contract.id, date(2024, 2, 5)))
            .unwrap();
        let on = MarkPaid {
            paid_date: Some(date(2024, 2, 3)),
        };
        let first = fx.registry.mark_payment_paid(&fx.admin, payment.id, on.clone()).unwrap();
        let second = fx.registry.mark_payment_paid(&fx.admin, payment.id, on).unwrap();
        assert_eq!(first, second);

        let err = fx
            .registry
            .mark_payment_paid(
                &fx.admin,
                payment.id,
                MarkPaid {
                    paid_date: Some(date(2024, 2, 4)),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.fields(), vec!["paid_date"]);
    }

    #[test]
    fn test_mark_paid_rejects_too_early_and_cancelled() {
        let (fx, _, contract) = setup(date(2024, 2, 1));
        let payment = fx
            .registry
            .create_payment(&fx.admin, new_payment(contract.id, date(2024, 6, 5)))
            .unwrap();
        let err = fx
            .registry
            .mark_payment_paid(&fx.admin, payment.id, MarkPaid::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        fx.registry.cancel_payment(&fx.admin, payment.id).unwrap();
        let err = fx
            .registry
            .mark_payment_paid(
                &fx.admin,
                payment.id,
                MarkPaid {
                    paid_date: Some(date(2024, 6, 5)),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }

    #[test]
    fn test_payment_needs_active_contract_and_unique_reference() {
        let (fx, owner, contract) = setup(date(2024, 2, 1));
        let mut input = new_payment(contract.id, date(2024, 3, 5));
        input.reference = Some("INV-1".into());
        fx.registry.create_payment(&fx.admin, input.clone()).unwrap();
        let err = fx.registry.create_payment(&fx.admin, input).unwrap_err();
        assert_eq!(err.fields(), vec!["reference"]);

        // owners view payments but do not record them
        let err = fx
            .registry
            .create_payment(&owner, new_payment(contract.id, date(2024, 3, 5)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        fx.registry
            .terminate_contract(&fx.admin, contract.id, Default::default())
            .unwrap();
        let err = fx
            .registry
            .create_payment(&fx.admin, new_payment(contract.id, date(2024, 3, 5)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.fields(), vec!["contract_id"]);
    }

    #[test]
    fn test_moving_due_date_forward_clears_overdue() {
        let (fx, _, contract) = setup(date(2024, 1, 1));
        let payment = fx
            .registry
            .create_payment(&fx.admin, new_payment(contract.id, date(2024, 1, 5)))
            .unwrap();
        fx.clock.set(date(2024, 1, 20));
        fx.registry.reconcile(&fx.admin).unwrap();
        let moved = fx
            .registry
            .update_payment(
                &fx.admin,
                payment.id,
                PaymentUpdate {
                    due_date: Some(date(2024, 2, 5)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(moved.status, PaymentStatus::Pending);
        assert!(fx.registry.overdue_payments(&fx.admin).unwrap().is_empty());
    }

    #[test]
    fn test_paid_payment_rejects_edits() {
        let (fx, _, contract) = setup(date(2024, 2, 1));
        let payment = fx
            .registry
            .create_payment(&fx.admin, new_payment(contract.id, date(2024, 2, 1)))
            .unwrap();
        fx.registry
            .mark_payment_paid(&fx.admin, payment.id, MarkPaid::default())
            .unwrap();
        let err = fx
            .registry
            .update_payment(
                &fx.admin,
                payment.id,
                PaymentUpdate {
                    amount: Some(1.0),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_due_dates_clamp_to_month_end() {
        let contract = Contract {
            id: 7,
            kind: ContractType::Rental,
            status: crate::models::ContractStatus::Active,
            start_date: date(2024, 1, 15),
            end_date: date(2024, 4, 30),
            rent_amount: 800.0,
            deposit_amount: None,
            payment_day: 31,
            terms: None,
            notes: None,
            termination_date: None,
            property_id: 1,
            tenant_id: 2,
        };
        assert_eq!(
            rent_due_dates(&contract, date(2024, 1, 15)),
            vec![date(2024, 1, 31), date(2024, 2, 29), date(2024, 3, 31), date(2024, 4, 30)]
        );
        assert_eq!(rent_reference(7, date(2024, 2, 29)), "RENT-7-202402");
    }

    #[test]
    fn test_upcoming_payments_window() {
        let (fx, owner, contract) = setup(date(2024, 3, 1));
        for due in [date(2024, 3, 12), date(2024, 3, 4), date(2024, 3, 8), date(2024, 3, 3)] {
            fx.registry
                .create_payment(&fx.admin, new_payment(contract.id, due))
                .unwrap();
        }
        fx.clock.set(date(2024, 3, 4));
        let paid = fx
            .registry
            .create_payment(&fx.admin, new_payment(contract.id, date(2024, 3, 6)))
            .unwrap();
        fx.registry
            .mark_payment_paid(&fx.admin, paid.id, MarkPaid::default())
            .unwrap();

        // due on the 3rd is overdue by now; the 12th is past the default week
        let dues: Vec<NaiveDate> = fx
            .registry
            .upcoming_payments(&owner, None)
            .unwrap()
            .iter()
            .map(|p| p.due_date)
            .collect();
        assert_eq!(dues, vec![date(2024, 3, 4), date(2024, 3, 8)]);
        assert_eq!(fx.registry.upcoming_payments(&owner, Some(10)).unwrap().len(), 3);

        let stranger = fx.user("s@example.com", UserRole::Tenant);
        assert!(fx.registry.upcoming_payments(&stranger, None).unwrap().is_empty());
        let err = fx.registry.upcoming_payments(&owner, Some(-1)).unwrap_err();
        assert_eq!(err.fields(), vec!["days"]);
    }

    #[test]
    fn test_generate_rent_skips_existing_months() {
        let (fx, _, contract) = setup(date(2024, 10, 1));
        let first = fx.registry.generate_rent_payments(&fx.admin, contract.id).unwrap();
        // payment_day 5: October through December
        assert_eq!(
            first.created.iter().map(|p| p.due_date).collect::<Vec<_>>(),
            vec![date(2024, 10, 5), date(2024, 11, 5), date(2024, 12, 5)]
        );
        let again = fx.registry.generate_rent_payments(&fx.admin, contract.id).unwrap();
        assert!(again.created.is_empty());
        assert_eq!(again.skipped, 3);
    }

    #[test]
    fn test_regenerate_fills_cancelled_month() {
        let (fx, _, contract) = setup(date(2024, 10, 1));
        let first = fx.registry.generate_rent_payments(&fx.admin, contract.id).unwrap();
        let october = &first.created[0];
        fx.registry.cancel_payment(&fx.admin, october.id).unwrap();

        let again = fx.registry.generate_rent_payments(&fx.admin, contract.id).unwrap();
        assert_eq!(again.skipped, 2);
        assert_eq!(again.created.len(), 1);
        let refill = &again.created[0];
        assert_eq!(refill.due_date, date(2024, 10, 5));
        assert_eq!(
            refill.reference.as_deref(),
            Some(format!("RENT-{}-202410-2", contract.id).as_str())
        );

        let third = fx.registry.generate_rent_payments(&fx.admin, contract.id).unwrap();
        assert!(third.created.is_empty());
        assert_eq!(third.skipped, 3);
    }

    #[test]
    fn test_regenerate_skips_month_with_moved_due_date() {
        let (fx, _, contract) = setup(date(2024, 10, 1));
        let first = fx.registry.generate_rent_payments(&fx.admin, contract.id).unwrap();
        fx.registry
            .update_payment(
                &fx.admin,
                first.created[1].id,
                PaymentUpdate {
                    due_date: Some(date(2024, 11, 12)),
                    ..Default::default()
                },
            )
            .unwrap();

        let again = fx.registry.generate_rent_payments(&fx.admin, contract.id).unwrap();
        assert!(again.created.is_empty());
        assert_eq!(again.skipped, 3);
    }
}

//! Status engine: transition tables, guards and derived states.
//!
//! Derived states (contract `expired`, payment `overdue`, property `rented`)
//! are pure functions of the stored record and the current date. Reads call
//! them on the way out and the reconciliation pass uses the same functions to
//! decide what to persist, so there is exactly one definition of each.

use std::fmt::Display;

use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::models::{
    Contract, ContractStatus, EntityKind, Id, MaintenanceStatus, Payment, PaymentStatus,
    PropertyStatus,
};

/// A status enum with a transition table.
pub trait Lifecycle: Copy + PartialEq + Display {
    const ENTITY: EntityKind;

    fn allows(self, next: Self) -> bool;

    fn is_terminal(self) -> bool;
}

impl Lifecycle for ContractStatus {
    const ENTITY: EntityKind = EntityKind::Contract;

    fn allows(self, next: Self) -> bool {
        use ContractStatus::*;
        matches!(
            (self, next),
            (Draft, Active) | (Active, Terminated) | (Active, Expired)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, ContractStatus::Terminated | ContractStatus::Expired)
    }
}

impl Lifecycle for PaymentStatus {
    const ENTITY: EntityKind = EntityKind::Payment;

    fn allows(self, next: Self) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Overdue)
                | (Pending, Cancelled)
                | (Overdue, Paid)
                | (Overdue, Cancelled)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Cancelled)
    }
}

impl Lifecycle for MaintenanceStatus {
    const ENTITY: EntityKind = EntityKind::MaintenanceRequest;

    fn allows(self, next: Self) -> bool {
        use MaintenanceStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Completed)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, MaintenanceStatus::Completed | MaintenanceStatus::Cancelled)
    }
}

/// Fails with `InvalidStateTransition` unless `from -> to` is in the table.
pub fn guard<S: Lifecycle>(id: Id, from: S, to: S) -> Result<()> {
    if from.allows(to) {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition {
            entity: S::ENTITY,
            id,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

pub fn contract_status(
    stored: ContractStatus,
    end_date: NaiveDate,
    today: NaiveDate,
) -> ContractStatus {
    match stored {
        ContractStatus::Active if end_date < today => ContractStatus::Expired,
        other => other,
    }
}

/// Unpaid, uncancelled payments are overdue exactly while `due_date < today`.
pub fn payment_status(
    stored: PaymentStatus,
    due_date: NaiveDate,
    today: NaiveDate,
) -> PaymentStatus {
    match stored {
        PaymentStatus::Pending | PaymentStatus::Overdue if due_date < today => {
            PaymentStatus::Overdue
        }
        PaymentStatus::Pending | PaymentStatus::Overdue => PaymentStatus::Pending,
        other => other,
    }
}

pub fn property_status(base: PropertyStatus, has_active_contract: bool) -> PropertyStatus {
    if has_active_contract {
        PropertyStatus::Rented
    } else {
        base
    }
}

impl Contract {
    pub fn effective_status(&self, today: NaiveDate) -> ContractStatus {
        contract_status(self.status, self.end_date, today)
    }

    /// Copy with the derived status applied, as returned to callers
    pub fn as_of(mut self, today: NaiveDate) -> Self {
        self.status = self.effective_status(today);
        self
    }

    pub fn is_active_on(&self, today: NaiveDate) -> bool {
        self.effective_status(today) == ContractStatus::Active
    }
}

impl Payment {
    pub fn effective_status(&self, today: NaiveDate) -> PaymentStatus {
        payment_status(self.status, self.due_date, today)
    }

    pub fn as_of(mut self, today: NaiveDate) -> Self {
        self.status = self.effective_status(today);
        self
    }
}

//! Referential integrity: foreign-key checks and delete policies.
//!
//! Everything here runs inside a storage transaction, so a failed check
//! leaves no partial write behind.

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{Error, Violation, Violations};
use crate::lifecycle::Lifecycle;
use crate::models::{
    Contract, ContractStatus, DeletePolicy, Id, MaintenanceRequest, Payment, Property, User,
};
use crate::storage::{fail, Record, Relation, Tx, TxResult};

/// Collects every broken foreign key of one write before failing.
pub(crate) struct References<'t, 'a> {
    tx: &'t Tx<'a>,
    violations: Vec<Violation>,
}

impl<'t, 'a> References<'t, 'a> {
    pub fn new(tx: &'t Tx<'a>) -> Self {
        Self {
            tx,
            violations: Vec::new(),
        }
    }

    fn lookup<T: Record>(&mut self, field: &str, id: Id) -> TxResult<Option<T>> {
        let found = self.tx.get::<T>(id)?;
        if found.is_none() {
            self.violations
                .push(Violation::new(field, format!("{} {} does not exist", T::KIND, id)));
        }
        Ok(found)
    }

    /// Users must exist and be active to be referenced
    pub fn user(&mut self, field: &str, id: Id) -> TxResult<Option<User>> {
        let user = self.lookup::<User>(field, id)?;
        match user {
            Some(u) if !u.is_active => {
                self.violations
                    .push(Violation::new(field, format!("user {} is deactivated", id)));
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub fn property(&mut self, field: &str, id: Id) -> TxResult<Option<Property>> {
        self.lookup(field, id)
    }

    pub fn contract(&mut self, field: &str, id: Id) -> TxResult<Option<Contract>> {
        self.lookup(field, id)
    }

    pub fn finish(self) -> TxResult<()> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            fail(Error::BrokenReferences(Violations(self.violations)))
        }
    }
}

/// The property's active contract as of `today`.
///
/// A contract still holding the active slot past its end date is expired in
/// place: its status is persisted and the slot released.
pub(crate) fn live_active_contract(
    tx: &Tx<'_>,
    property_id: Id,
    today: NaiveDate,
) -> TxResult<Option<Contract>> {
    let Some(contract_id) = tx.active_contract(property_id)? else {
        return Ok(None);
    };
    let Some(mut contract) = tx.get::<Contract>(contract_id)? else {
        tx.release_active(property_id, contract_id)?;
        return Ok(None);
    };
    if contract.is_active_on(today) {
        return Ok(Some(contract));
    }
    if contract.status == ContractStatus::Active {
        contract.status = ContractStatus::Expired;
        tx.put(&contract)?;
        tracing::info!(contract_id, property_id, "contract expired during write");
    }
    tx.release_active(property_id, contract_id)?;
    Ok(None)
}

/// What a cascading delete removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeletionReport {
    pub properties: usize,
    pub contracts: usize,
    pub payments: usize,
    pub maintenance_requests: usize,
}

fn remove_payment(tx: &Tx<'_>, payment: &Payment) -> TxResult<()> {
    if let Some(reference) = &payment.reference {
        tx.release_reference(reference)?;
    }
    tx.remove::<Payment>(payment.id)
}

/// Remove a contract and its payments, detaching it from property and tenant.
fn remove_contract(tx: &Tx<'_>, contract: &Contract, report: &mut DeletionReport) -> TxResult<()> {
    for payment_id in tx.children(Relation::ContractPayments, contract.id)? {
        if let Some(payment) = tx.get::<Payment>(payment_id)? {
            remove_payment(tx, &payment)?;
            report.payments += 1;
        }
    }
    tx.drop_children(Relation::ContractPayments, contract.id)?;
    tx.release_active(contract.property_id, contract.id)?;
    tx.unlink(Relation::PropertyContracts, contract.property_id, contract.id)?;
    tx.unlink(Relation::TenantContracts, contract.tenant_id, contract.id)?;
    tx.remove::<Contract>(contract.id)?;
    report.contracts += 1;
    Ok(())
}

fn remove_maintenance(tx: &Tx<'_>, request: &MaintenanceRequest) -> TxResult<()> {
    tx.unlink(Relation::PropertyMaintenance, request.property_id, request.id)?;
    tx.unlink(Relation::RequestedMaintenance, request.requested_by_id, request.id)?;
    if let Some(assignee) = request.assigned_to_id {
        tx.unlink(Relation::AssignedMaintenance, assignee, request.id)?;
    }
    tx.remove::<MaintenanceRequest>(request.id)
}

/// Delete a property and everything hanging off it.
///
/// Active contracts block the delete under `Restrict`. Historical contracts,
/// their payments and the property's maintenance requests are always removed
/// with it so nothing is left pointing at a missing property.
pub(crate) fn delete_property(
    tx: &Tx<'_>,
    property: &Property,
    policy: DeletePolicy,
    today: NaiveDate,
) -> TxResult<DeletionReport> {
    let active = live_active_contract(tx, property.id, today)?;
    if let (Some(contract), DeletePolicy::Restrict) = (&active, policy) {
        return fail(Error::conflict(format!(
            "property {} has active contract {}; delete with cascade to remove it",
            property.id, contract.id
        )));
    }

    let mut report = DeletionReport::default();
    for contract_id in tx.children(Relation::PropertyContracts, property.id)? {
        if let Some(contract) = tx.get::<Contract>(contract_id)? {
            remove_contract(tx, &contract, &mut report)?;
        }
    }
    for request_id in tx.children(Relation::PropertyMaintenance, property.id)? {
        if let Some(request) = tx.get::<MaintenanceRequest>(request_id)? {
            remove_maintenance(tx, &request)?;
            report.maintenance_requests += 1;
        }
    }
    tx.drop_children(Relation::PropertyContracts, property.id)?;
    tx.drop_children(Relation::PropertyMaintenance, property.id)?;
    tx.unlink(Relation::OwnedProperties, property.owner_id, property.id)?;
    tx.remove::<Property>(property.id)?;
    report.properties = 1;
    Ok(report)
}

/// Delete a user, restricted while anything still depends on them.
///
/// Owned properties, contracts (active or historical) and filed maintenance
/// requests block the delete. Maintenance assignments are cleared.
pub(crate) fn delete_user(tx: &Tx<'_>, user: &User, today: NaiveDate) -> TxResult<()> {
    let mut reasons = Vec::new();

    let owned = tx.children(Relation::OwnedProperties, user.id)?;
    if !owned.is_empty() {
        reasons.push(format!("owns {} propert(ies)", owned.len()));
    }

    let contracts = tx.children(Relation::TenantContracts, user.id)?;
    let mut active = 0;
    for contract_id in &contracts {
        if let Some(contract) = tx.get::<Contract>(*contract_id)? {
            if contract.is_active_on(today) {
                active += 1;
            }
        }
    }
    if active > 0 {
        reasons.push(format!("holds {} active contract(s)", active));
    } else if !contracts.is_empty() {
        reasons.push(format!("is tenant on {} past contract(s)", contracts.len()));
    }

    let requested = tx.children(Relation::RequestedMaintenance, user.id)?;
    if !requested.is_empty() {
        reasons.push(format!("filed {} maintenance request(s)", requested.len()));
    }

    if !reasons.is_empty() {
        return fail(Error::conflict(format!(
            "user {} cannot be deleted: {}",
            user.id,
            reasons.join(", ")
        )));
    }

    for request_id in tx.children(Relation::AssignedMaintenance, user.id)? {
        if let Some(mut request) = tx.get::<MaintenanceRequest>(request_id)? {
            request.assigned_to_id = None;
            tx.put(&request)?;
        }
    }
    tx.drop_children(Relation::AssignedMaintenance, user.id)?;
    tx.release_email(&user.email)?;
    tx.remove::<User>(user.id)
}

/// Terminal records accept no further edits.
pub(crate) fn ensure_editable<S: Lifecycle>(id: Id, status: S) -> TxResult<()> {
    if status.is_terminal() {
        fail(Error::conflict(format!(
            "{} {} is {} and can no longer be modified",
            S::ENTITY,
            id,
            status
        )))
    } else {
        Ok(())
    }
}

//! Capability checks: (actor, operation, stakeholders) -> allow/deny.
//!
//! Kept apart from the lifecycle engine; operations gather the parties
//! involved in a record and ask [`authorize`] before mutating anything.

use crate::error::{Error, Result};
use crate::models::{Contract, Id, MaintenanceRequest, Property, User, UserRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ViewProperty,
    CreateProperty,
    UpdateProperty,
    DeleteProperty,
    /// Hand a property to another owner
    TransferProperty,
    ViewContract,
    ManageContract,
    ViewPayment,
    ManagePayment,
    ViewMaintenance,
    CreateMaintenance,
    UpdateMaintenance,
    ViewUser,
    UpdateUser,
    ChangeRole,
    DeleteUser,
    Reconcile,
}

/// The users a record involves. Fields not relevant to a record stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stakeholders {
    /// Owner of the property the record hangs off
    pub owner: Option<Id>,
    /// Tenant of the contract, or current tenant of the property
    pub tenant: Option<Id>,
    pub requester: Option<Id>,
    pub assignee: Option<Id>,
    /// Target of a user-administration operation
    pub subject: Option<Id>,
}

impl Stakeholders {
    pub fn property(property: &Property, tenant: Option<Id>) -> Self {
        Self {
            owner: Some(property.owner_id),
            tenant,
            ..Default::default()
        }
    }

    pub fn contract(owner: Id, contract: &Contract) -> Self {
        Self {
            owner: Some(owner),
            tenant: Some(contract.tenant_id),
            ..Default::default()
        }
    }

    pub fn maintenance(owner: Id, tenant: Option<Id>, request: &MaintenanceRequest) -> Self {
        Self {
            owner: Some(owner),
            tenant,
            requester: Some(request.requested_by_id),
            assignee: request.assigned_to_id,
            subject: None,
        }
    }

    pub fn user(subject: Id) -> Self {
        Self {
            subject: Some(subject),
            ..Default::default()
        }
    }
}

pub fn is_allowed(actor: &User, op: Operation, who: &Stakeholders) -> bool {
    use Operation::*;

    if !actor.is_active {
        return false;
    }
    let me = Some(actor.id);
    let is_owner = who.owner.is_some() && who.owner == me;
    let is_tenant = who.tenant.is_some() && who.tenant == me;
    let is_requester = who.requester.is_some() && who.requester == me;
    let is_assignee = who.assignee.is_some() && who.assignee == me;
    let is_self = who.subject.is_some() && who.subject == me;

    match actor.role {
        UserRole::Admin => true,
        UserRole::Agent => match op {
            ChangeRole | DeleteUser => false,
            UpdateUser => is_self,
            _ => true,
        },
        UserRole::Owner => match op {
            ViewProperty | CreateProperty | UpdateProperty | DeleteProperty => is_owner,
            ViewContract | ManageContract | ViewPayment => is_owner,
            CreateMaintenance => is_owner,
            ViewMaintenance | UpdateMaintenance => is_owner || is_requester || is_assignee,
            ViewUser | UpdateUser => is_self,
            TransferProperty | ManagePayment | ChangeRole | DeleteUser | Reconcile => false,
        },
        UserRole::Tenant => match op {
            ViewProperty | ViewContract | ViewPayment => is_tenant,
            CreateMaintenance => is_tenant && is_requester,
            ViewMaintenance => is_requester || is_assignee || is_tenant,
            UpdateMaintenance => is_requester || is_assignee,
            ViewUser | UpdateUser => is_self,
            _ => false,
        },
    }
}

pub fn authorize(actor: &User, op: Operation, who: &Stakeholders) -> Result<()> {
    if is_allowed(actor, op, who) {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "{} {} may not perform {:?}",
            actor.role, actor.id, op
        )))
    }
}

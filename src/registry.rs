//! The ledger's operations.
//!
//! [`Registry`] owns the store and the clock. Each write runs in a single
//! storage transaction: foreign keys, capability checks, lifecycle guards and
//! index claims all happen inside it, so a failed operation changes nothing.
//! Entity operations live in the submodules.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::access::Stakeholders;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::lifecycle::property_status;
use crate::models::{Contract, Id, MaintenanceRequest, Payment, Property, User};
use crate::query::Page;
use crate::storage::Storage;

mod contracts;
mod maintenance;
mod payments;
mod properties;
mod users;

pub use payments::RentSchedule;

/// Tunables for the lifecycle rules
#[derive(Debug, Clone)]
pub struct Policy {
    /// How long before its due date a payment may be marked paid
    pub early_payment_days: i64,
    /// Window used by `expiring_contracts` when no explicit one is given
    pub renewal_notice_days: i64,
    /// Window used by `upcoming_payments` when no explicit one is given
    pub payment_reminder_days: i64,
    /// Age after which a pending maintenance request counts as stale
    pub stale_request_days: i64,
    pub bcrypt_cost: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            early_payment_days: 31,
            renewal_notice_days: 30,
            payment_reminder_days: 7,
            stale_request_days: 1,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

#[derive(Clone)]
pub struct Registry {
    storage: Storage,
    clock: Arc<dyn Clock>,
    policy: Policy,
}

impl Registry {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, policy: Policy) -> Self {
        Self {
            storage,
            clock,
            policy,
        }
    }

    /// Registry on the wall clock with default policy
    pub fn with_storage(storage: Storage) -> Self {
        Self::new(storage, Arc::new(SystemClock), Policy::default())
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Contract currently occupying the property's active slot, if still in force
    fn active_contract_on(&self, property_id: Id, today: NaiveDate) -> Result<Option<Contract>> {
        let Some(contract_id) = self.storage.active_contract_for(property_id)? else {
            return Ok(None);
        };
        Ok(self
            .storage
            .get::<Contract>(contract_id)?
            .filter(|c| c.is_active_on(today)))
    }

    /// Property as callers see it, with `rented` derived
    fn present_property(&self, mut property: Property, today: NaiveDate) -> Result<Property> {
        let rented = self.active_contract_on(property.id, today)?.is_some();
        property.status = property_status(property.status, rented);
        Ok(property)
    }

    /// Shared tail of every list operation: derive, filter, scope to the actor, page.
    fn collect_visible<T, F>(
        &self,
        actor: &User,
        records: Vec<T>,
        page: Page,
        mut keep: F,
    ) -> Result<Vec<T>>
    where
        F: FnMut(&mut Parties<'_>, &T) -> Result<bool>,
    {
        let mut parties = Parties::new(self, self.today());
        let mut out = Vec::new();
        let mut skipped = 0;
        for record in records {
            if !keep(&mut parties, &record)? {
                continue;
            }
            if skipped < page.skip {
                skipped += 1;
                continue;
            }
            out.push(record);
            if out.len() == page.limit {
                break;
            }
        }
        tracing::debug!(actor = actor.id, returned = out.len(), "list served");
        Ok(out)
    }
}

/// Memoized stakeholder lookups for reads outside a transaction.
pub(crate) struct Parties<'r> {
    registry: &'r Registry,
    today: NaiveDate,
    properties: HashMap<Id, Property>,
    tenants: HashMap<Id, Option<Id>>,
    contracts: HashMap<Id, Contract>,
}

impl<'r> Parties<'r> {
    fn new(registry: &'r Registry, today: NaiveDate) -> Self {
        Self {
            registry,
            today,
            properties: HashMap::new(),
            tenants: HashMap::new(),
            contracts: HashMap::new(),
        }
    }

    fn property(&mut self, id: Id) -> Result<Property> {
        if let Some(p) = self.properties.get(&id) {
            return Ok(p.clone());
        }
        let p: Property = self.registry.storage.fetch(id)?;
        self.properties.insert(id, p.clone());
        Ok(p)
    }

    fn contract(&mut self, id: Id) -> Result<Contract> {
        if let Some(c) = self.contracts.get(&id) {
            return Ok(c.clone());
        }
        let c: Contract = self.registry.storage.fetch(id)?;
        self.contracts.insert(id, c.clone());
        Ok(c)
    }

    fn tenant_of(&mut self, property_id: Id) -> Result<Option<Id>> {
        if let Some(t) = self.tenants.get(&property_id) {
            return Ok(*t);
        }
        let tenant = self
            .registry
            .active_contract_on(property_id, self.today)?
            .map(|c| c.tenant_id);
        self.tenants.insert(property_id, tenant);
        Ok(tenant)
    }

    fn of_property(&mut self, property: &Property) -> Result<Stakeholders> {
        let tenant = self.tenant_of(property.id)?;
        Ok(Stakeholders::property(property, tenant))
    }

    fn of_contract(&mut self, contract: &Contract) -> Result<Stakeholders> {
        let owner = self.property(contract.property_id)?.owner_id;
        Ok(Stakeholders::contract(owner, contract))
    }

    fn of_payment(&mut self, payment: &Payment) -> Result<Stakeholders> {
        let contract = self.contract(payment.contract_id)?;
        self.of_contract(&contract)
    }

    fn of_maintenance(&mut self, request: &MaintenanceRequest) -> Result<Stakeholders> {
        let owner = self.property(request.property_id)?.owner_id;
        let tenant = self.tenant_of(request.property_id)?;
        Ok(Stakeholders::maintenance(owner, tenant, request))
    }
}

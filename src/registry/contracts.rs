use chrono::{Duration, NaiveDate};

use crate::access::{authorize, is_allowed, Operation, Stakeholders};
use crate::error::{Error, Result, Validator};
use crate::integrity::{self, References};
use crate::lifecycle::guard;
use crate::models::{
    Contract, ContractStatus, ContractUpdate, EntityKind, Id, NewContract, Property,
    PropertyStatus, Termination, User,
};
use crate::query::{ContractFilter, Filter, Page, Query};
use crate::storage::{fail, lift, Relation, Tx, TxResult};

use super::Registry;

fn validate(c: &Contract) -> Result<()> {
    let mut v = Validator::new();
    v.check(
        c.end_date > c.start_date,
        "end_date",
        "must be after start_date",
    )
    .non_negative(c.rent_amount, "rent_amount")
    .non_negative_opt(c.deposit_amount, "deposit_amount")
    .check(
        (1..=31).contains(&c.payment_day),
        "payment_day",
        "must be between 1 and 31",
    );
    v.finish()
}

/// Move a draft contract to active, claiming the property's active slot.
fn activate(
    tx: &Tx<'_>,
    contract: &mut Contract,
    property: &Property,
    today: NaiveDate,
) -> TxResult<()> {
    lift(guard(contract.id, contract.status, ContractStatus::Active))?;
    if contract.start_date > today {
        return fail(Error::conflict_on(
            "start_date",
            format!(
                "contract {} starts on {} and cannot be activated before then",
                contract.id, contract.start_date
            ),
        ));
    }
    if contract.end_date < today {
        return fail(Error::conflict_on(
            "end_date",
            format!("contract {} already ended on {}", contract.id, contract.end_date),
        ));
    }
    if matches!(property.status, PropertyStatus::Sold | PropertyStatus::Maintenance) {
        return fail(Error::conflict_on(
            "property_id",
            format!("property {} is {} and cannot be let", property.id, property.status),
        ));
    }
    // clears a slot still held by a contract that has run past its end date
    integrity::live_active_contract(tx, property.id, today)?;
    tx.claim_active(property.id, contract.id)?;
    contract.status = ContractStatus::Active;
    Ok(())
}

fn terminate(contract: &mut Contract, on: NaiveDate, today: NaiveDate) -> Result<()> {
    guard(contract.id, contract.effective_status(today), ContractStatus::Terminated)?;
    if on < contract.start_date || on > contract.end_date {
        return Err(Error::invalid(
            "termination_date",
            format!(
                "must be between {} and {}",
                contract.start_date, contract.end_date
            ),
        ));
    }
    contract.status = ContractStatus::Terminated;
    contract.termination_date = Some(on);
    Ok(())
}

impl Registry {
    /// Create a contract as draft, or activate it in the same step when `status` is active
    #[tracing::instrument(
        skip(self, actor, input),
        fields(actor = actor.id, property_id = input.property_id)
    )]
    pub fn create_contract(&self, actor: &User, input: NewContract) -> Result<Contract> {
        let activate_now = match input.status {
            None | Some(ContractStatus::Draft) => false,
            Some(ContractStatus::Active) => true,
            Some(other) => {
                return Err(Error::invalid(
                    "status",
                    format!("new contracts start as draft or active, not {}", other),
                ))
            }
        };
        let draft = Contract {
            id: self.storage.next_id()?,
            kind: input.kind,
            status: ContractStatus::Draft,
            start_date: input.start_date,
            end_date: input.end_date,
            rent_amount: input.rent_amount,
            deposit_amount: input.deposit_amount,
            payment_day: input.payment_day,
            terms: input.terms,
            notes: input.notes,
            termination_date: None,
            property_id: input.property_id,
            tenant_id: input.tenant_id,
        };
        validate(&draft)?;
        let today = self.today();

        let contract = self.storage.transaction(|tx| {
            let mut refs = References::new(tx);
            let property = refs.property("property_id", draft.property_id)?;
            refs.user("tenant_id", draft.tenant_id)?;
            refs.finish()?;
            let Some(property) = property else {
                return fail(Error::not_found(EntityKind::Property, draft.property_id));
            };
            lift(authorize(
                actor,
                Operation::ManageContract,
                &Stakeholders::contract(property.owner_id, &draft),
            ))?;

            let mut contract = draft.clone();
            if activate_now {
                activate(tx, &mut contract, &property, today)?;
            }
            tx.put(&contract)?;
            tx.link(Relation::PropertyContracts, contract.property_id, contract.id)?;
            tx.link(Relation::TenantContracts, contract.tenant_id, contract.id)?;
            Ok(contract)
        })?;
        tracing::info!(contract_id = contract.id, status = %contract.status, "contract created");
        Ok(contract)
    }

    pub fn get_contract(&self, actor: &User, id: Id) -> Result<Contract> {
        let contract = self.storage.fetch::<Contract>(id)?;
        let owner = self.storage.fetch::<Property>(contract.property_id)?.owner_id;
        authorize(
            actor,
            Operation::ViewContract,
            &Stakeholders::contract(owner, &contract),
        )?;
        Ok(contract.as_of(self.today()))
    }

    /// Patch contract terms; a `status` of active or terminated runs the matching transition
    #[tracing::instrument(skip(self, actor, patch), fields(actor = actor.id))]
    pub fn update_contract(&self, actor: &User, id: Id, patch: ContractUpdate) -> Result<Contract> {
        let today = self.today();
        let updated = self.storage.transaction(|tx| {
            let current: Contract = tx.fetch(id)?;
            let property: Property = tx.fetch(current.property_id)?;
            lift(authorize(
                actor,
                Operation::ManageContract,
                &Stakeholders::contract(property.owner_id, &current),
            ))?;
            let effective = current.effective_status(today);
            integrity::ensure_editable(id, effective)?;

            let mut next = current.clone();
            if let Some(v) = patch.kind {
                next.kind = v;
            }
            if let Some(v) = patch.start_date {
                next.start_date = v;
            }
            if let Some(v) = patch.end_date {
                next.end_date = v;
            }
            if let Some(v) = patch.rent_amount {
                next.rent_amount = v;
            }
            if let Some(v) = patch.deposit_amount {
                next.deposit_amount = Some(v);
            }
            if let Some(v) = patch.payment_day {
                next.payment_day = v;
            }
            if let Some(v) = &patch.terms {
                next.terms = Some(v.clone());
            }
            if let Some(v) = &patch.notes {
                next.notes = Some(v.clone());
            }
            lift(validate(&next))?;

            match patch.status {
                None => {}
                Some(s) if s == effective => {}
                Some(ContractStatus::Active) => activate(tx, &mut next, &property, today)?,
                Some(ContractStatus::Terminated) => {
                    lift(terminate(&mut next, today, today))?;
                    tx.release_active(next.property_id, id)?;
                }
                Some(ContractStatus::Expired) => {
                    return fail(Error::invalid(
                        "status",
                        "expired is reached when end_date passes and cannot be set",
                    ))
                }
                Some(other) => lift(guard(id, effective, other))?,
            }

            if next.status == ContractStatus::Active && next.start_date > today {
                return fail(Error::conflict_on(
                    "start_date",
                    "an active contract cannot start in the future",
                ));
            }
            tx.put(&next)?;
            Ok(next)
        })?;
        tracing::info!(contract_id = id, status = %updated.status, "contract updated");
        Ok(updated.as_of(today))
    }

    #[tracing::instrument(skip(self, actor), fields(actor = actor.id))]
    pub fn activate_contract(&self, actor: &User, id: Id) -> Result<Contract> {
        let today = self.today();
        let contract = self.storage.transaction(|tx| {
            let mut contract: Contract = tx.fetch(id)?;
            let property: Property = tx.fetch(contract.property_id)?;
            lift(authorize(
                actor,
                Operation::ManageContract,
                &Stakeholders::contract(property.owner_id, &contract),
            ))?;
            activate(tx, &mut contract, &property, today)?;
            tx.put(&contract)?;
            Ok(contract)
        })?;
        tracing::info!(contract_id = id, property_id = contract.property_id, "contract activated");
        Ok(contract)
    }

    /// End an active contract early and free the property.
    #[tracing::instrument(skip(self, actor, input), fields(actor = actor.id))]
    pub fn terminate_contract(&self, actor: &User, id: Id, input: Termination) -> Result<Contract> {
        let today = self.today();
        let on = input.termination_date.unwrap_or(today);
        let contract = self.storage.transaction(|tx| {
            let mut contract: Contract = tx.fetch(id)?;
            let property: Property = tx.fetch(contract.property_id)?;
            lift(authorize(
                actor,
                Operation::ManageContract,
                &Stakeholders::contract(property.owner_id, &contract),
            ))?;
            lift(terminate(&mut contract, on, today))?;
            tx.release_active(contract.property_id, id)?;
            tx.put(&contract)?;
            Ok(contract)
        })?;
        tracing::info!(contract_id = id, termination_date = %on, "contract terminated");
        Ok(contract)
    }

    pub fn list_contracts(
        &self,
        actor: &User,
        query: &Query<ContractFilter>,
    ) -> Result<Vec<Contract>> {
        let today = self.today();
        let contracts = self
            .storage
            .scan::<Contract>()?
            .into_iter()
            .map(|c| c.as_of(today))
            .collect();
        self.collect_visible(actor, contracts, query.page, |parties, c| {
            if !query.filter.matches(c) {
                return Ok(false);
            }
            let who = parties.of_contract(c)?;
            Ok(is_allowed(actor, Operation::ViewContract, &who))
        })
    }

    /// Active contracts ending within `within_days` (renewal notice window by default)
    pub fn expiring_contracts(
        &self,
        actor: &User,
        within_days: Option<i64>,
    ) -> Result<Vec<Contract>> {
        let days = within_days.unwrap_or(self.policy.renewal_notice_days);
        if days < 0 {
            return Err(Error::invalid("days", "must be >= 0"));
        }
        let today = self.today();
        let horizon = today + Duration::days(days);
        let contracts = self
            .storage
            .scan::<Contract>()?
            .into_iter()
            .filter(|c| c.is_active_on(today) && c.end_date <= horizon)
            .collect();
        self.collect_visible(actor, contracts, Page::all(), |parties, c| {
            let who = parties.of_contract(c)?;
            Ok(is_allowed(actor, Operation::ViewContract, &who))
        })
    }
}

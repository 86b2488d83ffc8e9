use chrono::{Duration, NaiveDate};

use crate::access::{authorize, is_allowed, Operation, Stakeholders};
use crate::error::{Error, Result, Validator};
use crate::integrity::{self, References};
use crate::lifecycle::{guard, Lifecycle};
use crate::models::{
    Completion, EntityKind, Id, MaintenanceRequest, MaintenanceStatus, MaintenanceType,
    MaintenanceUpdate, NewMaintenanceRequest, Property, User,
};
use crate::query::{Filter, MaintenanceFilter, Page, Query};
use crate::storage::{fail, lift, Relation, Tx, TxResult};

use super::Registry;

/// Requests at or above this priority are reported as high priority
pub const HIGH_PRIORITY: u8 = 4;

fn validate(m: &MaintenanceRequest) -> Result<()> {
    let mut v = Validator::new();
    v.not_blank(&m.title, "title")
        .max_len(&m.title, 100, "title")
        .not_blank(&m.description, "description")
        .check(
            (1..=5).contains(&m.priority),
            "priority",
            "must be between 1 and 5",
        )
        .non_negative_opt(m.cost, "cost");
    v.finish()
}

fn is_open(m: &MaintenanceRequest) -> bool {
    !m.status.is_terminal()
}

/// Fetch a request with the parties needed to authorize changes to it.
fn load(tx: &Tx<'_>, id: Id, today: NaiveDate) -> TxResult<(MaintenanceRequest, Stakeholders)> {
    let request: MaintenanceRequest = tx.fetch(id)?;
    let property: Property = tx.fetch(request.property_id)?;
    let tenant = integrity::live_active_contract(tx, property.id, today)?.map(|c| c.tenant_id);
    let who = Stakeholders::maintenance(property.owner_id, tenant, &request);
    Ok((request, who))
}

fn complete(request: &mut MaintenanceRequest, cost: f64, on: NaiveDate) -> Result<()> {
    guard(request.id, request.status, MaintenanceStatus::Completed)?;
    let mut v = Validator::new();
    v.non_negative(cost, "cost").check(
        on >= request.request_date,
        "completion_date",
        format!("must not be before the request date {}", request.request_date),
    );
    v.finish()?;
    request.status = MaintenanceStatus::Completed;
    request.cost = Some(cost);
    request.completion_date = Some(on);
    Ok(())
}

impl Registry {
    #[tracing::instrument(
        skip(self, actor, input),
        fields(actor = actor.id, property_id = input.property_id)
    )]
    pub fn create_maintenance_request(
        &self,
        actor: &User,
        input: NewMaintenanceRequest,
    ) -> Result<MaintenanceRequest> {
        let today = self.today();
        let request = MaintenanceRequest {
            id: self.storage.next_id()?,
            title: input.title,
            description: input.description,
            kind: input.kind,
            status: MaintenanceStatus::Pending,
            priority: input.priority,
            request_date: input.request_date.unwrap_or(today),
            completion_date: None,
            cost: None,
            notes: input.notes,
            property_id: input.property_id,
            requested_by_id: input.requested_by_id.unwrap_or(actor.id),
            assigned_to_id: input.assigned_to_id,
        };
        validate(&request)?;

        self.storage.transaction(|tx| {
            let mut refs = References::new(tx);
            let property = refs.property("property_id", request.property_id)?;
            refs.user("requested_by_id", request.requested_by_id)?;
            if let Some(assignee) = request.assigned_to_id {
                refs.user("assigned_to_id", assignee)?;
            }
            refs.finish()?;
            let Some(property) = property else {
                return fail(Error::not_found(EntityKind::Property, request.property_id));
            };
            let tenant =
                integrity::live_active_contract(tx, property.id, today)?.map(|c| c.tenant_id);
            lift(authorize(
                actor,
                Operation::CreateMaintenance,
                &Stakeholders::maintenance(property.owner_id, tenant, &request),
            ))?;

            tx.put(&request)?;
            tx.link(Relation::PropertyMaintenance, request.property_id, request.id)?;
            tx.link(Relation::RequestedMaintenance, request.requested_by_id, request.id)?;
            if let Some(assignee) = request.assigned_to_id {
                tx.link(Relation::AssignedMaintenance, assignee, request.id)?;
            }
            Ok(())
        })?;
        tracing::info!(
            request_id = request.id,
            priority = request.priority,
            kind = %request.kind,
            "maintenance request filed"
        );
        Ok(request)
    }

    pub fn get_maintenance_request(&self, actor: &User, id: Id) -> Result<MaintenanceRequest> {
        let request = self.storage.fetch::<MaintenanceRequest>(id)?;
        let property = self.storage.fetch::<Property>(request.property_id)?;
        let tenant = self
            .active_contract_on(property.id, self.today())?
            .map(|c| c.tenant_id);
        authorize(
            actor,
            Operation::ViewMaintenance,
            &Stakeholders::maintenance(property.owner_id, tenant, &request),
        )?;
        Ok(request)
    }

    /// Patch a request. Completing through here requires a cost.
    #[tracing::instrument(skip(self, actor, patch), fields(actor = actor.id))]
    pub fn update_maintenance_request(
        &self,
        actor: &User,
        id: Id,
        patch: MaintenanceUpdate,
    ) -> Result<MaintenanceRequest> {
        let today = self.today();
        let updated = self.storage.transaction(|tx| {
            let (current, who) = load(tx, id, today)?;
            lift(authorize(actor, Operation::UpdateMaintenance, &who))?;

            let target = patch.status.filter(|s| *s != current.status);
            if let Some(to) = target {
                lift(guard(id, current.status, to))?;
            }
            integrity::ensure_editable(id, current.status)?;

            let mut next = current.clone();
            if let Some(v) = &patch.title {
                next.title = v.clone();
            }
            if let Some(v) = &patch.description {
                next.description = v.clone();
            }
            if let Some(v) = patch.kind {
                next.kind = v;
            }
            if let Some(v) = patch.priority {
                next.priority = v;
            }
            if let Some(v) = &patch.notes {
                next.notes = Some(v.clone());
            }
            if let Some(v) = patch.cost {
                next.cost = Some(v);
            }
            lift(validate(&next))?;

            match target {
                Some(MaintenanceStatus::Completed) => {
                    let Some(cost) = patch.cost else {
                        return fail(Error::invalid("cost", "is required to complete a request"));
                    };
                    lift(complete(&mut next, cost, today))?;
                }
                Some(to) => next.status = to,
                None => {}
            }

            if patch.assigned_to_id.is_some() && patch.assigned_to_id != current.assigned_to_id {
                let mut refs = References::new(tx);
                if let Some(assignee) = patch.assigned_to_id {
                    refs.user("assigned_to_id", assignee)?;
                }
                refs.finish()?;
                if let Some(old) = current.assigned_to_id {
                    tx.unlink(Relation::AssignedMaintenance, old, id)?;
                }
                if let Some(new) = patch.assigned_to_id {
                    tx.link(Relation::AssignedMaintenance, new, id)?;
                }
                next.assigned_to_id = patch.assigned_to_id;
            }

            tx.put(&next)?;
            Ok(next)
        })?;
        tracing::info!(request_id = id, status = %updated.status, "maintenance request updated");
        Ok(updated)
    }

    #[tracing::instrument(skip(self, actor, input), fields(actor = actor.id))]
    pub fn complete_maintenance_request(
        &self,
        actor: &User,
        id: Id,
        input: Completion,
    ) -> Result<MaintenanceRequest> {
        let today = self.today();
        let on = input.completion_date.unwrap_or(today);
        let request = self.storage.transaction(|tx| {
            let (mut request, who) = load(tx, id, today)?;
            lift(authorize(actor, Operation::UpdateMaintenance, &who))?;
            lift(complete(&mut request, input.cost, on))?;
            tx.put(&request)?;
            Ok(request)
        })?;
        tracing::info!(request_id = id, cost = input.cost, "maintenance request completed");
        Ok(request)
    }

    pub fn list_maintenance_requests(
        &self,
        actor: &User,
        query: &Query<MaintenanceFilter>,
    ) -> Result<Vec<MaintenanceRequest>> {
        let requests = self.storage.scan::<MaintenanceRequest>()?;
        self.collect_visible(actor, requests, query.page, |parties, m| {
            if !query.filter.matches(m) {
                return Ok(false);
            }
            let who = parties.of_maintenance(m)?;
            Ok(is_allowed(actor, Operation::ViewMaintenance, &who))
        })
    }

    /// Open requests with priority 4 or 5, most urgent first
    pub fn high_priority_requests(&self, actor: &User) -> Result<Vec<MaintenanceRequest>> {
        let open: Vec<_> = self
            .storage
            .scan::<MaintenanceRequest>()?
            .into_iter()
            .filter(|m| is_open(m) && m.priority >= HIGH_PRIORITY)
            .collect();
        let mut visible = self.collect_visible(actor, open, Page::all(), |parties, m| {
            let who = parties.of_maintenance(m)?;
            Ok(is_allowed(actor, Operation::ViewMaintenance, &who))
        })?;
        visible.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(visible)
    }

    /// Requests still pending `older_than_days` or more after they were filed, oldest first
    pub fn stale_requests(
        &self,
        actor: &User,
        older_than_days: Option<i64>,
    ) -> Result<Vec<MaintenanceRequest>> {
        let days = older_than_days.unwrap_or(self.policy.stale_request_days);
        if days < 0 {
            return Err(Error::invalid("days", "must be >= 0"));
        }
        let cutoff = self.today() - Duration::days(days);
        let waiting = self
            .storage
            .scan::<MaintenanceRequest>()?
            .into_iter()
            .filter(|m| m.status == MaintenanceStatus::Pending && m.request_date <= cutoff)
            .collect();
        let mut visible = self.collect_visible(actor, waiting, Page::all(), |parties, m| {
            let who = parties.of_maintenance(m)?;
            Ok(is_allowed(actor, Operation::ViewMaintenance, &who))
        })?;
        visible.sort_by_key(|m| (m.request_date, m.id));
        Ok(visible)
    }

    /// Open requests of type emergency
    pub fn emergency_requests(&self, actor: &User) -> Result<Vec<MaintenanceRequest>> {
        let open = self
            .storage
            .scan::<MaintenanceRequest>()?
            .into_iter()
            .filter(|m| is_open(m) && m.kind == MaintenanceType::Emergency)
            .collect();
        self.collect_visible(actor, open, Page::all(), |parties, m| {
            let who = parties.of_maintenance(m)?;
            Ok(is_allowed(actor, Operation::ViewMaintenance, &who))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::UserRole;
    use crate::registry::testing::{date, Fixture};

    fn new_request(property_id: Id, priority: u8, kind: MaintenanceType) -> NewMaintenanceRequest {
        NewMaintenanceRequest {
            title: "Boiler out".into(),
            description: "No hot water since Monday".into(),
            kind,
            priority,
            request_date: None,
            notes: None,
            property_id,
            requested_by_id: None,
            assigned_to_id: None,
        }
    }

    #[test]
    fn test_completed_cannot_return_to_in_progress() {
        let fx = Fixture::new(date(2024, 4, 1));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let property = fx.property(&owner);
        let request = fx
            .registry
            .create_maintenance_request(
                &owner,
                new_request(property.id, 3, MaintenanceType::Repair),
            )
            .unwrap();
        assert_eq!(request.requested_by_id, owner.id);

        let done = fx
            .registry
            .complete_maintenance_request(
                &owner,
                request.id,
                Completion {
                    cost: 180.0,
                    completion_date: None,
                },
            )
            .unwrap();
        assert_eq!(done.status, MaintenanceStatus::Completed);
        assert_eq!(done.completion_date, Some(date(2024, 4, 1)));

        let err = fx
            .registry
            .update_maintenance_request(
                &owner,
                request.id,
                MaintenanceUpdate {
                    status: Some(MaintenanceStatus::InProgress),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);

        let err = fx
            .registry
            .complete_maintenance_request(
                &owner,
                request.id,
                Completion {
                    cost: 10.0,
                    completion_date: None,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }

    #[test]
    fn test_completion_date_and_cost_checked() {
        let fx = Fixture::new(date(2024, 4, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let property = fx.property(&owner);
        let request = fx
            .registry
            .create_maintenance_request(
                &owner,
                new_request(property.id, 2, MaintenanceType::Inspection),
            )
            .unwrap();
        let err = fx
            .registry
            .complete_maintenance_request(
                &owner,
                request.id,
                Completion {
                    cost: -1.0,
                    completion_date: Some(date(2024, 4, 1)),
                },
            )
            .unwrap_err();
        assert_eq!(err.fields(), vec!["cost", "completion_date"]);
    }

    #[test]
    fn test_update_to_completed_needs_cost() {
        let fx = Fixture::new(date(2024, 4, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let property = fx.property(&owner);
        let request = fx
            .registry
            .create_maintenance_request(
                &owner,
                new_request(property.id, 2, MaintenanceType::Repair),
            )
            .unwrap();
        let started = fx
            .registry
            .update_maintenance_request(
                &owner,
                request.id,
                MaintenanceUpdate {
                    status: Some(MaintenanceStatus::InProgress),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(started.status, MaintenanceStatus::InProgress);

        let finish = MaintenanceUpdate {
            status: Some(MaintenanceStatus::Completed),
            ..Default::default()
        };
        let err = fx
            .registry
            .update_maintenance_request(&owner, request.id, finish.clone())
            .unwrap_err();
        assert_eq!(err.fields(), vec!["cost"]);

        let done = fx
            .registry
            .update_maintenance_request(
                &owner,
                request.id,
                MaintenanceUpdate {
                    cost: Some(75.0),
                    ..finish
                },
            )
            .unwrap();
        assert_eq!(done.status, MaintenanceStatus::Completed);
        assert_eq!(done.cost, Some(75.0));
    }

    #[test]
    fn test_tenant_files_only_for_rented_property() {
        let fx = Fixture::new(date(2024, 4, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let tenant = fx.user("t@example.com", UserRole::Tenant);
        let rented = fx.property(&owner);
        let other = fx.property(&owner);
        fx.active_contract(&rented, &tenant, date(2024, 1, 1), date(2024, 12, 31));

        let mine = fx
            .registry
            .create_maintenance_request(
                &tenant,
                new_request(rented.id, 5, MaintenanceType::Emergency),
            )
            .unwrap();
        let err = fx
            .registry
            .create_maintenance_request(&tenant, new_request(other.id, 1, MaintenanceType::Repair))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        // the owner sees the tenant's request; the tenant sees their own
        assert_eq!(fx.registry.get_maintenance_request(&owner, mine.id).unwrap().id, mine.id);
        assert_eq!(fx.registry.emergency_requests(&tenant).unwrap().len(), 1);
    }

    #[test]
    fn test_owner_cannot_file_on_foreign_property() {
        let fx = Fixture::new(date(2024, 4, 10));
        let alice = fx.user("alice@example.com", UserRole::Owner);
        let bob = fx.user("bob@example.com", UserRole::Owner);
        let bobs = fx.property(&bob);

        let err = fx
            .registry
            .create_maintenance_request(&alice, new_request(bobs.id, 3, MaintenanceType::Repair))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let mut self_assigned = new_request(bobs.id, 3, MaintenanceType::Repair);
        self_assigned.assigned_to_id = Some(alice.id);
        let err = fx
            .registry
            .create_maintenance_request(&alice, self_assigned)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let stored = fx.registry.storage().scan::<MaintenanceRequest>().unwrap();
        assert!(stored.is_empty());
    }

    #[test]
    fn test_assignee_can_work_the_request() {
        let fx = Fixture::new(date(2024, 4, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let plumber = fx.user("plumber@example.com", UserRole::Owner);
        let property = fx.property(&owner);
        let mut input = new_request(property.id, 4, MaintenanceType::Repair);
        input.assigned_to_id = Some(plumber.id);
        let request = fx.registry.create_maintenance_request(&owner, input).unwrap();

        let done = fx
            .registry
            .complete_maintenance_request(
                &plumber,
                request.id,
                Completion {
                    cost: 120.0,
                    completion_date: None,
                },
            )
            .unwrap();
        assert_eq!(done.status, MaintenanceStatus::Completed);
        assert!(fx.registry.high_priority_requests(&owner).unwrap().is_empty());
    }

    #[test]
    fn test_high_priority_orders_by_urgency() {
        let fx = Fixture::new(date(2024, 4, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let property = fx.property(&owner);
        let four = fx
            .registry
            .create_maintenance_request(
                &owner,
                new_request(property.id, 4, MaintenanceType::Repair),
            )
            .unwrap();
        let five = fx
            .registry
            .create_maintenance_request(
                &owner,
                new_request(property.id, 5, MaintenanceType::Repair),
            )
            .unwrap();
        fx.registry
            .create_maintenance_request(
                &owner,
                new_request(property.id, 2, MaintenanceType::Repair),
            )
            .unwrap();
        let ids: Vec<Id> = fx
            .registry
            .high_priority_requests(&owner)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![five.id, four.id]);
    }

    #[test]
    fn test_stale_requests_are_old_and_pending() {
        let fx = Fixture::new(date(2024, 4, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let property = fx.property(&owner);
        let filed_on = |day: u32| {
            let mut input = new_request(property.id, 3, MaintenanceType::Repair);
            input.request_date = Some(date(2024, 4, day));
            fx.registry.create_maintenance_request(&owner, input).unwrap()
        };
        let old = filed_on(2);
        let yesterday = filed_on(9);
        filed_on(10);
        let started = filed_on(1);
        fx.registry
            .update_maintenance_request(
                &owner,
                started.id,
                MaintenanceUpdate {
                    status: Some(MaintenanceStatus::InProgress),
                    ..Default::default()
                },
            )
            .unwrap();

        let ids: Vec<Id> = fx
            .registry
            .stale_requests(&owner, None)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![old.id, yesterday.id]);
        assert_eq!(fx.registry.stale_requests(&owner, Some(7)).unwrap().len(), 1);

        let other = fx.user("other@example.com", UserRole::Owner);
        assert!(fx.registry.stale_requests(&other, None).unwrap().is_empty());
    }

    #[test]
    fn test_priority_bounds() {
        let fx = Fixture::new(date(2024, 4, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let property = fx.property(&owner);
        let err = fx
            .registry
            .create_maintenance_request(&owner, new_request(property.id, 6, MaintenanceType::Other))
            .unwrap_err();
        assert_eq!(err.fields(), vec!["priority"]);
    }
}

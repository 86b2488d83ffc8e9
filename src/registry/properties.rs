use crate::access::{authorize, is_allowed, Operation, Stakeholders};
use crate::error::{Error, Result, Validator};
use crate::integrity::{self, DeletionReport, References};
use crate::lifecycle::property_status;
use crate::models::{
    DeletePolicy, Id, NewProperty, Property, PropertyStatus, PropertyUpdate, User,
};
use crate::query::{Filter, PropertyFilter, Query};
use crate::storage::{fail, lift, Relation};

use super::Registry;

fn validate(p: &Property) -> Result<()> {
    let mut v = Validator::new();
    v.not_blank(&p.title, "title")
        .max_len(&p.title, 100, "title")
        .not_blank(&p.address, "address")
        .not_blank(&p.city, "city")
        .not_blank(&p.postal_code, "postal_code")
        .not_blank(&p.country, "country")
        .non_negative(p.surface_area, "surface_area")
        .non_negative(p.price, "price")
        .non_negative_opt(p.deposit, "deposit")
        .non_negative_opt(p.monthly_charges, "monthly_charges")
        .check(
            p.status != PropertyStatus::Rented,
            "status",
            "rented is derived from the active contract and cannot be set",
        );
    v.finish()
}

impl Registry {
    #[tracing::instrument(
        skip(self, actor, input),
        fields(actor = actor.id, owner_id = input.owner_id)
    )]
    pub fn create_property(&self, actor: &User, input: NewProperty) -> Result<Property> {
        let property = Property {
            id: self.storage.next_id()?,
            title: input.title,
            description: input.description,
            kind: input.kind,
            status: input.status.unwrap_or(PropertyStatus::Available),
            address: input.address,
            city: input.city,
            postal_code: input.postal_code,
            country: input.country,
            surface_area: input.surface_area,
            number_of_rooms: input.number_of_rooms,
            number_of_bathrooms: input.number_of_bathrooms,
            floor: input.floor,
            has_parking: input.has_parking,
            has_elevator: input.has_elevator,
            price: input.price,
            deposit: input.deposit,
            monthly_charges: input.monthly_charges,
            owner_id: input.owner_id,
        };
        validate(&property)?;
        authorize(
            actor,
            Operation::CreateProperty,
            &Stakeholders::property(&property, None),
        )?;

        self.storage.transaction(|tx| {
            let mut refs = References::new(tx);
            refs.user("owner_id", property.owner_id)?;
            refs.finish()?;
            tx.put(&property)?;
            tx.link(Relation::OwnedProperties, property.owner_id, property.id)
        })?;
        tracing::info!(property_id = property.id, "property created");
        Ok(property)
    }

    pub fn get_property(&self, actor: &User, id: Id) -> Result<Property> {
        let today = self.today();
        let property = self.storage.fetch::<Property>(id)?;
        let tenant = self.active_contract_on(id, today)?.map(|c| c.tenant_id);
        authorize(
            actor,
            Operation::ViewProperty,
            &Stakeholders::property(&property, tenant),
        )?;
        self.present_property(property, today)
    }

    #[tracing::instrument(skip(self, actor, patch), fields(actor = actor.id))]
    pub fn update_property(&self, actor: &User, id: Id, patch: PropertyUpdate) -> Result<Property> {
        let today = self.today();
        let updated = self.storage.transaction(|tx| {
            let current: Property = tx.fetch(id)?;
            let active = integrity::live_active_contract(tx, id, today)?;
            let tenant = active.as_ref().map(|c| c.tenant_id);
            lift(authorize(
                actor,
                Operation::UpdateProperty,
                &Stakeholders::property(&current, tenant),
            ))?;

            let mut next = current.clone();
            merge(&mut next, &patch);
            lift(validate(&next))?;

            if let Some(contract) = &active {
                if matches!(next.status, PropertyStatus::Sold | PropertyStatus::Maintenance)
                    && next.status != current.status
                {
                    return fail(Error::conflict_on(
                        "status",
                        format!(
                            "property {} has active contract {}; terminate it before marking the property {}",
                            id, contract.id, next.status
                        ),
                    ));
                }
            }

            if next.owner_id != current.owner_id {
                lift(authorize(
                    actor,
                    Operation::TransferProperty,
                    &Stakeholders::property(&current, tenant),
                ))?;
                let mut refs = References::new(tx);
                refs.user("owner_id", next.owner_id)?;
                refs.finish()?;
                tx.unlink(Relation::OwnedProperties, current.owner_id, id)?;
                tx.link(Relation::OwnedProperties, next.owner_id, id)?;
            }

            tx.put(&next)?;
            next.status = property_status(next.status, active.is_some());
            Ok(next)
        })?;
        tracing::info!(property_id = id, "property updated");
        Ok(updated)
    }

    /// Set the manually managed base status (available, sold, maintenance)
    pub fn set_property_status(
        &self,
        actor: &User,
        id: Id,
        status: PropertyStatus,
    ) -> Result<Property> {
        self.update_property(
            actor,
            id,
            PropertyUpdate {
                status: Some(status),
                ..Default::default()
            },
        )
    }

    /// Delete a property with its contracts, payments and maintenance history.
    ///
    /// `Restrict` refuses while a contract is active; `Cascade` removes it too.
    #[tracing::instrument(skip(self, actor), fields(actor = actor.id))]
    pub fn delete_property(
        &self,
        actor: &User,
        id: Id,
        policy: DeletePolicy,
    ) -> Result<DeletionReport> {
        let today = self.today();
        let report = self.storage.transaction(|tx| {
            let property: Property = tx.fetch(id)?;
            lift(authorize(
                actor,
                Operation::DeleteProperty,
                &Stakeholders::property(&property, None),
            ))?;
            integrity::delete_property(tx, &property, policy, today)
        })?;
        tracing::info!(
            property_id = id,
            contracts = report.contracts,
            payments = report.payments,
            maintenance_requests = report.maintenance_requests,
            "property deleted"
        );
        Ok(report)
    }

    pub fn list_properties(
        &self,
        actor: &User,
        query: &Query<PropertyFilter>,
    ) -> Result<Vec<Property>> {
        let today = self.today();
        let mut presented = Vec::new();
        for property in self.storage.scan::<Property>()? {
            presented.push(self.present_property(property, today)?);
        }
        self.collect_visible(actor, presented, query.page, |parties, p| {
            if !query.filter.matches(p) {
                return Ok(false);
            }
            let who = parties.of_property(p)?;
            Ok(is_allowed(actor, Operation::ViewProperty, &who))
        })
    }
}

fn merge(p: &mut Property, patch: &PropertyUpdate) {
    if let Some(v) = &patch.title {
        p.title = v.clone();
    }
    if let Some(v) = &patch.description {
        p.description = Some(v.clone());
    }
    if let Some(v) = patch.kind {
        p.kind = v;
    }
    if let Some(v) = patch.status {
        p.status = v;
    }
    if let Some(v) = &patch.address {
        p.address = v.clone();
    }
    if let Some(v) = &patch.city {
        p.city = v.clone();
    }
    if let Some(v) = &patch.postal_code {
        p.postal_code = v.clone();
    }
    if let Some(v) = &patch.country {
        p.country = v.clone();
    }
    if let Some(v) = patch.surface_area {
        p.surface_area = v;
    }
    if let Some(v) = patch.number_of_rooms {
        p.number_of_rooms = Some(v);
    }
    if let Some(v) = patch.number_of_bathrooms {
        p.number_of_bathrooms = Some(v);
    }
    if let Some(v) = patch.floor {
        p.floor = Some(v);
    }
    if let Some(v) = patch.has_parking {
        p.has_parking = v;
    }
    if let Some(v) = patch.has_elevator {
        p.has_elevator = v;
    }
    if let Some(v) = patch.price {
        p.price = v;
    }
    if let Some(v) = patch.deposit {
        p.deposit = Some(v);
    }
    if let Some(v) = patch.monthly_charges {
        p.monthly_charges = Some(v);
    }
    if let Some(v) = patch.owner_id {
        p.owner_id = v;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::error::ErrorKind;
    use crate::models::{ContractStatus, DeletePolicy, PropertyStatus, PropertyUpdate, UserRole};
    use crate::query::Query;
    use crate::registry::testing::{date, new_property, Fixture};

    #[test]
    fn test_create_validates_every_field_together() {
        let fx = Fixture::new(date(2024, 1, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let mut input = new_property(owner.id);
        input.title = " ".into();
        input.price = -5.0;
        input.deposit = Some(-1.0);
        input.status = Some(PropertyStatus::Rented);
        let err = fx.registry.create_property(&fx.admin, input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.fields(), vec!["title", "price", "deposit", "status"]);
    }

    #[test]
    fn test_create_reports_missing_owner() {
        let fx = Fixture::new(date(2024, 1, 10));
        let err = fx
            .registry
            .create_property(&fx.admin, new_property(4242))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.fields(), vec!["owner_id"]);
    }

    #[test]
    fn test_owner_creates_only_for_themselves() {
        let fx = Fixture::new(date(2024, 1, 10));
        let a = fx.user("a@example.com", UserRole::Owner);
        let b = fx.user("b@example.com", UserRole::Owner);
        assert!(fx.registry.create_property(&a, new_property(a.id)).is_ok());
        let err = fx.registry.create_property(&a, new_property(b.id)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn test_only_staff_transfer_ownership() {
        let fx = Fixture::new(date(2024, 1, 10));
        let a = fx.user("a@example.com", UserRole::Owner);
        let b = fx.user("b@example.com", UserRole::Owner);
        let property = fx.property(&a);
        let handover = PropertyUpdate {
            owner_id: Some(b.id),
            ..Default::default()
        };

        let err = fx
            .registry
            .update_property(&a, property.id, handover.clone())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(fx.registry.get_property(&a, property.id).unwrap().owner_id, a.id);

        let moved = fx.registry.update_property(&fx.admin, property.id, handover).unwrap();
        assert_eq!(moved.owner_id, b.id);
        assert!(fx.registry.get_property(&b, property.id).is_ok());
        let err = fx.registry.get_property(&a, property.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn test_rented_is_derived_and_cleared_by_termination() {
        let fx = Fixture::new(date(2024, 1, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let tenant = fx.user("t@example.com", UserRole::Tenant);
        let property = fx.property(&owner);
        assert_eq!(property.status, PropertyStatus::Available);

        let contract = fx.active_contract(&property, &tenant, date(2024, 1, 1), date(2024, 12, 31));
        let rented = fx.registry.get_property(&owner, property.id).unwrap();
        assert_eq!(rented.status, PropertyStatus::Rented);
        // stored base status is untouched
        let stored: crate::models::Property = fx.registry.storage().fetch(property.id).unwrap();
        assert_eq!(stored.status, PropertyStatus::Available);

        let terminated = fx
            .registry
            .terminate_contract(&fx.admin, contract.id, Default::default())
            .unwrap();
        assert_eq!(terminated.status, ContractStatus::Terminated);
        let freed = fx.registry.get_property(&owner, property.id).unwrap();
        assert_eq!(freed.status, PropertyStatus::Available);
    }

    #[test]
    fn test_cannot_sell_property_under_active_contract() {
        let fx = Fixture::new(date(2024, 1, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let tenant = fx.user("t@example.com", UserRole::Tenant);
        let property = fx.property(&owner);
        fx.active_contract(&property, &tenant, date(2024, 1, 1), date(2024, 12, 31));

        let err = fx
            .registry
            .set_property_status(&owner, property.id, PropertyStatus::Sold)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // other edits still go through and keep the derived status
        let updated = fx
            .registry
            .update_property(
                &owner,
                property.id,
                PropertyUpdate {
                    price: Some(990.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.price, 990.0);
        assert_eq!(updated.status, PropertyStatus::Rented);
    }

    #[test]
    fn test_update_validates_merged_record() {
        let fx = Fixture::new(date(2024, 1, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let property = fx.property(&owner);
        let err = fx
            .registry
            .update_property(
                &owner,
                property.id,
                PropertyUpdate {
                    city: Some("".into()),
                    monthly_charges: Some(-3.0),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.fields(), vec!["city", "monthly_charges"]);
        let unchanged = fx.registry.get_property(&owner, property.id).unwrap();
        assert_eq!(unchanged.city, "Lyon");
    }

    #[test]
    fn test_delete_restrict_then_cascade() {
        let fx = Fixture::new(date(2024, 1, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let tenant = fx.user("t@example.com", UserRole::Tenant);
        let property = fx.property(&owner);
        let active = fx.active_contract(&property, &tenant, date(2024, 1, 1), date(2024, 12, 31));

        let err = fx
            .registry
            .delete_property(&owner, property.id, DeletePolicy::Restrict)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(fx.registry.get_property(&owner, property.id).is_ok());

        let report = fx
            .registry
            .delete_property(&owner, property.id, DeletePolicy::Cascade)
            .unwrap();
        assert_eq!(report.contracts, 1);
        assert_eq!(
            fx.registry.get_contract(&fx.admin, active.id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(fx.registry.storage().active_contract_for(property.id).unwrap(), None);
    }

    #[test]
    fn test_delete_with_only_terminated_contracts_removes_them() {
        let fx = Fixture::new(date(2024, 1, 10));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let tenant = fx.user("t@example.com", UserRole::Tenant);
        let property = fx.property(&owner);
        let contract = fx.active_contract(&property, &tenant, date(2024, 1, 1), date(2024, 12, 31));
        fx.registry
            .terminate_contract(&fx.admin, contract.id, Default::default())
            .unwrap();

        let report = fx
            .registry
            .delete_property(&owner, property.id, DeletePolicy::Restrict)
            .unwrap();
        assert_eq!(report.properties, 1);
        assert_eq!(report.contracts, 1);
        // the tenant no longer has a history blocking their own deletion
        fx.registry.delete_user(&fx.admin, tenant.id).unwrap();
    }

    #[test]
    fn test_list_scopes_to_actor_and_filters() {
        let fx = Fixture::new(date(2024, 1, 10));
        let a = fx.user("a@example.com", UserRole::Owner);
        let b = fx.user("b@example.com", UserRole::Owner);
        let pa = fx.property(&a);
        fx.property(&b);

        let all = Query::parse(&BTreeMap::new()).unwrap();
        let mine = fx.registry.list_properties(&a, &all).unwrap();
        assert_eq!(mine.iter().map(|p| p.id).collect::<Vec<_>>(), vec![pa.id]);
        assert_eq!(fx.registry.list_properties(&fx.admin, &all).unwrap().len(), 2);

        let mut params = BTreeMap::new();
        params.insert("max_price".to_string(), "100".to_string());
        let cheap = Query::parse(&params).unwrap();
        assert!(fx.registry.list_properties(&fx.admin, &cheap).unwrap().is_empty());
    }
}

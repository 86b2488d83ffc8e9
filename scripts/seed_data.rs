//! Seed a store with sample users, properties, contracts, payments and
//! maintenance requests.
//!
//! Run: cargo run --bin seed_data
//! All accounts share the password `password123`. Seeding an already seeded
//! store fails on the first duplicate email.

use std::sync::Arc;

use chrono::{Datelike, Months};

use property_ledger::clock::SystemClock;
use property_ledger::config::Settings;
use property_ledger::logging::init_cli_logging;
use property_ledger::models::{
    ContractStatus, ContractType, MaintenanceType, NewContract, NewMaintenanceRequest, NewProperty,
    NewUser, PropertyType, User, UserRole,
};
use property_ledger::registry::Registry;
use property_ledger::storage::Storage;

const PASSWORD: &str = "password123";

const LISTINGS: &[(&str, PropertyType, &str, f64, f64)] = &[
    ("Bright studio near the station", PropertyType::Apartment, "Lyon", 28.0, 620.0),
    ("Family house with garden", PropertyType::House, "Nantes", 120.0, 1650.0),
    ("Open-plan office, 3rd floor", PropertyType::Office, "Lille", 85.0, 2100.0),
    ("Corner shop", PropertyType::Commercial, "Bordeaux", 60.0, 1400.0),
    ("Two rooms with balcony", PropertyType::Apartment, "Lyon", 45.0, 890.0),
];

fn user(email: &str, name: &str, role: UserRole) -> NewUser {
    NewUser {
        email: email.to_string(),
        password: PASSWORD.to_string(),
        full_name: Some(name.to_string()),
        phone: None,
        role,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    init_cli_logging("info").map_err(|e| e.to_string())?;
    let storage = Storage::open(&settings.database_path)?;
    let registry = Registry::new(storage, Arc::new(SystemClock), settings.policy());
    let today = registry.today();

    let admin = registry.bootstrap_admin("admin@ledger.local", PASSWORD)?;
    registry.create_user(&admin, user("agent@ledger.local", "Alex Agent", UserRole::Agent))?;
    let owner =
        registry.register_user(user("owner@ledger.local", "Olivia Owner", UserRole::Owner))?;
    let tenants = ["tom", "tina", "theo"]
        .iter()
        .map(|name| {
            registry.register_user(user(
                &format!("{}@ledger.local", name),
                &format!("{} Tenant", name),
                UserRole::Tenant,
            ))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut properties = Vec::new();
    for (title, kind, city, surface, price) in LISTINGS {
        let property = registry.create_property(
            &admin,
            NewProperty {
                title: title.to_string(),
                description: None,
                kind: *kind,
                status: None,
                address: format!("{} Grande Rue", properties.len() + 1),
                city: city.to_string(),
                postal_code: "00000".to_string(),
                country: "France".to_string(),
                surface_area: *surface,
                number_of_rooms: None,
                number_of_bathrooms: None,
                floor: None,
                has_parking: false,
                has_elevator: false,
                price: *price,
                deposit: Some(price * 2.0),
                monthly_charges: None,
                owner_id: owner.id,
            },
        )?;
        properties.push(property);
    }

    // One running lease per tenant, started two months ago for a year
    let start = today
        .with_day(1)
        .and_then(|d| d.checked_sub_months(Months::new(2)))
        .ok_or("date out of range")?;
    let end = start
        .checked_add_months(Months::new(12))
        .and_then(|d| d.pred_opt())
        .ok_or("date out of range")?;
    let mut payments = 0;
    for (property, tenant) in properties.iter().zip(&tenants) {
        let contract = registry.create_contract(
            &admin,
            NewContract {
                kind: ContractType::Rental,
                status: Some(ContractStatus::Active),
                start_date: start,
                end_date: end,
                rent_amount: property.price,
                deposit_amount: property.deposit,
                payment_day: 5,
                terms: None,
                notes: None,
                property_id: property.id,
                tenant_id: tenant.id,
            },
        )?;
        payments += registry.generate_rent_payments(&admin, contract.id)?.created.len();
    }

    let rented = &properties[0];
    let tenant: User = registry.storage().fetch(tenants[0].id)?;
    registry.create_maintenance_request(
        &tenant,
        NewMaintenanceRequest {
            title: "Boiler makes noise".to_string(),
            description: "Loud knocking when the heating starts".to_string(),
            kind: MaintenanceType::Repair,
            priority: 3,
            request_date: None,
            notes: None,
            property_id: rented.id,
            requested_by_id: None,
            assigned_to_id: None,
        },
    )?;
    registry.create_maintenance_request(
        &admin,
        NewMaintenanceRequest {
            title: "Water leak in the shop".to_string(),
            description: "Ceiling leak above the counter".to_string(),
            kind: MaintenanceType::Emergency,
            priority: 5,
            request_date: None,
            notes: None,
            property_id: properties[3].id,
            requested_by_id: None,
            assigned_to_id: None,
        },
    )?;

    let report = registry.reconcile_on(today)?;
    registry.storage().flush()?;

    println!(
        "Seeded {} properties, {} leases, {} rent payments into {}",
        properties.len(),
        tenants.len(),
        payments,
        settings.database_path.display()
    );
    println!("Reconciliation: {}", report);
    Ok(())
}

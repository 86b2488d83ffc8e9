//! Records persisted in the ledger and the payloads that create or patch them.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub type Id = u64;

/// Declares a snake_case string enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "unknown value '{}', expected one of: {}",
                        other,
                        [$($text),+].join(", ")
                    )),
                }
            }
        }
    };
}

string_enum!(
    /// Kinds of records, used in errors and logs.
    EntityKind {
        User => "user",
        Property => "property",
        Contract => "contract",
        Payment => "payment",
        MaintenanceRequest => "maintenance request",
    }
);

string_enum!(UserRole {
    Admin => "admin",
    Agent => "agent",
    Owner => "owner",
    Tenant => "tenant",
});

string_enum!(PropertyType {
    Apartment => "apartment",
    House => "house",
    Office => "office",
    Commercial => "commercial",
});

string_enum!(
    /// `Rented` is never stored; it is derived from the active-contract index.
    PropertyStatus {
        Available => "available",
        Rented => "rented",
        Sold => "sold",
        Maintenance => "maintenance",
    }
);

string_enum!(ContractType {
    Rental => "rental",
    Sale => "sale",
});

string_enum!(ContractStatus {
    Draft => "draft",
    Active => "active",
    Terminated => "terminated",
    Expired => "expired",
});

string_enum!(PaymentType {
    Rent => "rent",
    Deposit => "deposit",
    Charges => "charges",
    Maintenance => "maintenance",
    Other => "other",
});

string_enum!(PaymentStatus {
    Pending => "pending",
    Paid => "paid",
    Overdue => "overdue",
    Cancelled => "cancelled",
});

string_enum!(MaintenanceType {
    Repair => "repair",
    Renovation => "renovation",
    Inspection => "inspection",
    Emergency => "emergency",
    Other => "other",
});

string_enum!(MaintenanceStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub id: Id,
    pub email: String,
    pub hashed_password: String,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub role: UserRole,
    pub is_active: bool,
}

/// User as exposed to API clients: no password hash
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PublicUser {
    pub id: Id,
    pub email: String,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub role: UserRole,
    pub is_active: bool,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            full_name: u.full_name,
            phone: u.phone,
            role: u.role,
            is_active: u.is_active,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Property {
    pub id: Id,
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: PropertyType,
    pub status: PropertyStatus,
    pub address: String,
    pub city: String,
    pub postal_code: String,
    pub country: String,
    pub surface_area: f64,
    pub number_of_rooms: Option<u32>,
    pub number_of_bathrooms: Option<u32>,
    pub floor: Option<i32>,
    pub has_parking: bool,
    pub has_elevator: bool,
    pub price: f64,
    pub deposit: Option<f64>,
    pub monthly_charges: Option<f64>,
    pub owner_id: Id,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Contract {
    pub id: Id,
    #[serde(rename = "type")]
    pub kind: ContractType,
    pub status: ContractStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub rent_amount: f64,
    pub deposit_amount: Option<f64>,
    pub payment_day: u8,
    pub terms: Option<String>,
    pub notes: Option<String>,
    pub termination_date: Option<NaiveDate>,
    pub property_id: Id,
    pub tenant_id: Id,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Payment {
    pub id: Id,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: PaymentType,
    pub status: PaymentStatus,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub contract_id: Id,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MaintenanceRequest {
    pub id: Id,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: MaintenanceType,
    pub status: MaintenanceStatus,
    pub priority: u8,
    pub request_date: NaiveDate,
    pub completion_date: Option<NaiveDate>,
    pub cost: Option<f64>,
    pub notes: Option<String>,
    pub property_id: Id,
    pub requested_by_id: Id,
    pub assigned_to_id: Option<Id>,
}

// --- Payloads ---

#[derive(Deserialize, Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub role: UserRole,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub password: Option<String>,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub role: Option<UserRole>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewProperty {
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: PropertyType,
    #[serde(default)]
    pub status: Option<PropertyStatus>,
    pub address: String,
    pub city: String,
    pub postal_code: String,
    pub country: String,
    pub surface_area: f64,
    pub number_of_rooms: Option<u32>,
    pub number_of_bathrooms: Option<u32>,
    pub floor: Option<i32>,
    #[serde(default)]
    pub has_parking: bool,
    #[serde(default)]
    pub has_elevator: bool,
    pub price: f64,
    pub deposit: Option<f64>,
    pub monthly_charges: Option<f64>,
    pub owner_id: Id,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PropertyUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<PropertyType>,
    pub status: Option<PropertyStatus>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub surface_area: Option<f64>,
    pub number_of_rooms: Option<u32>,
    pub number_of_bathrooms: Option<u32>,
    pub floor: Option<i32>,
    pub has_parking: Option<bool>,
    pub has_elevator: Option<bool>,
    pub price: Option<f64>,
    pub deposit: Option<f64>,
    pub monthly_charges: Option<f64>,
    pub owner_id: Option<Id>,
}

/// What happens to a property's active contracts when it is deleted.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    #[default]
    Restrict,
    Cascade,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewContract {
    #[serde(rename = "type")]
    pub kind: ContractType,
    /// `draft` (default) or `active` to create and activate in one step
    #[serde(default)]
    pub status: Option<ContractStatus>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub rent_amount: f64,
    pub deposit_amount: Option<f64>,
    pub payment_day: u8,
    pub terms: Option<String>,
    pub notes: Option<String>,
    pub property_id: Id,
    pub tenant_id: Id,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ContractUpdate {
    #[serde(rename = "type")]
    pub kind: Option<ContractType>,
    pub status: Option<ContractStatus>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub rent_amount: Option<f64>,
    pub deposit_amount: Option<f64>,
    pub payment_day: Option<u8>,
    pub terms: Option<String>,
    pub notes: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Termination {
    /// Defaults to today
    pub termination_date: Option<NaiveDate>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewPayment {
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: PaymentType,
    pub due_date: NaiveDate,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub contract_id: Id,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PaymentUpdate {
    pub amount: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<PaymentType>,
    pub due_date: Option<NaiveDate>,
    pub reference: Option<String>,
    pub notes: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct MarkPaid {
    /// Defaults to today
    pub paid_date: Option<NaiveDate>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewMaintenanceRequest {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: MaintenanceType,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Defaults to today
    pub request_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub property_id: Id,
    /// Defaults to the acting user
    pub requested_by_id: Option<Id>,
    pub assigned_to_id: Option<Id>,
}

fn default_priority() -> u8 {
    1
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct MaintenanceUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<MaintenanceType>,
    pub status: Option<MaintenanceStatus>,
    pub priority: Option<u8>,
    pub cost: Option<f64>,
    pub notes: Option<String>,
    pub assigned_to_id: Option<Id>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Completion {
    pub cost: f64,
    /// Defaults to today
    pub completion_date: Option<NaiveDate>,
}

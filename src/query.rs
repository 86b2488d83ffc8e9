//! Typed list filters.
//!
//! Filters are parsed from string key/value pairs (REST query strings, CLI
//! `k=v` arguments) into one struct per entity. Predicates combine with AND.
//! Unknown keys and malformed values are all reported in a single validation
//! error. Status predicates are evaluated against the derived status, so
//! callers hand in records already evaluated as of today.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::str::FromStr;

use chrono::NaiveDate;

use crate::error::{Error, Result, Violation, Violations};
use crate::models::{
    Contract, ContractStatus, ContractType, Id, MaintenanceRequest, MaintenanceStatus,
    MaintenanceType, Payment, PaymentStatus, PaymentType, Property, PropertyStatus, PropertyType,
};

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl Page {
    /// No paging, for internal reports
    pub fn all() -> Self {
        Self {
            skip: 0,
            limit: usize::MAX,
        }
    }
}

/// Inclusive range; either end may be open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds<T> {
    pub min: Option<T>,
    pub max: Option<T>,
}

impl<T> Default for Bounds<T> {
    fn default() -> Self {
        Self {
            min: None,
            max: None,
        }
    }
}

impl<T: PartialOrd + Copy> Bounds<T> {
    pub fn contains(&self, value: T) -> bool {
        self.min.map_or(true, |m| value >= m) && self.max.map_or(true, |m| value <= m)
    }
}

/// Key/value parameters being consumed by a filter parser.
pub struct Params<'p> {
    raw: &'p BTreeMap<String, String>,
    seen: BTreeSet<&'p str>,
    violations: Vec<Violation>,
}

impl<'p> Params<'p> {
    fn new(raw: &'p BTreeMap<String, String>) -> Self {
        Self {
            raw,
            seen: BTreeSet::new(),
            violations: Vec::new(),
        }
    }

    pub fn get<T>(&mut self, key: &'static str) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let (k, value) = self.raw.get_key_value(key)?;
        self.seen.insert(k.as_str());
        match value.trim().parse() {
            Ok(v) => Some(v),
            Err(e) => {
                self.violations.push(Violation::new(key, e.to_string()));
                None
            }
        }
    }

    pub fn bounds<T>(&mut self, min_key: &'static str, max_key: &'static str) -> Bounds<T>
    where
        T: FromStr + PartialOrd + Copy,
        T::Err: Display,
    {
        let bounds = Bounds {
            min: self.get(min_key),
            max: self.get(max_key),
        };
        if let (Some(lo), Some(hi)) = (bounds.min, bounds.max) {
            if lo > hi {
                self.violations
                    .push(Violation::new(min_key, format!("must not exceed {}", max_key)));
            }
        }
        bounds
    }

    fn page(&mut self) -> Page {
        let mut page = Page::default();
        if let Some(skip) = self.get::<i64>("skip") {
            match usize::try_from(skip) {
                Ok(s) => page.skip = s,
                Err(_) => self.violations.push(Violation::new("skip", "must be >= 0")),
            }
        }
        if let Some(limit) = self.get::<i64>("limit") {
            if (1..=MAX_LIMIT as i64).contains(&limit) {
                page.limit = limit as usize;
            } else {
                self.violations.push(Violation::new(
                    "limit",
                    format!("must be between 1 and {}", MAX_LIMIT),
                ));
            }
        }
        page
    }

    fn finish(mut self, accepted: &[&str]) -> Result<()> {
        let raw = self.raw;
        for key in raw.keys() {
            if !self.seen.contains(key.as_str()) {
                self.violations.push(Violation::new(
                    key.as_str(),
                    format!("unknown filter, expected one of: {}", accepted.join(", ")),
                ));
            }
        }
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(Violations(self.violations)))
        }
    }
}

pub trait Filter: Sized {
    type Record;

    /// Accepted keys, pagination aside
    const KEYS: &'static [&'static str];

    fn from_params(params: &mut Params<'_>) -> Self;

    fn matches(&self, record: &Self::Record) -> bool;
}

/// A filter plus pagination
#[derive(Debug, Clone)]
pub struct Query<F> {
    pub filter: F,
    pub page: Page,
}

impl<F: Filter> Query<F> {
    pub fn parse(raw: &BTreeMap<String, String>) -> Result<Self> {
        let mut params = Params::new(raw);
        let filter = F::from_params(&mut params);
        let page = params.page();
        let mut accepted = F::KEYS.to_vec();
        accepted.extend(["skip", "limit"]);
        params.finish(&accepted)?;
        Ok(Self { filter, page })
    }
}

fn eq<T: PartialEq>(want: &Option<T>, have: &T) -> bool {
    want.as_ref().map_or(true, |w| w == have)
}

#[derive(Debug, Clone, Default)]
pub struct PropertyFilter {
    pub kind: Option<PropertyType>,
    pub status: Option<PropertyStatus>,
    pub owner_id: Option<Id>,
    pub city: Option<String>,
    pub price: Bounds<f64>,
    pub surface: Bounds<f64>,
}

impl Filter for PropertyFilter {
    type Record = Property;

    const KEYS: &'static [&'static str] = &[
        "type",
        "status",
        "owner_id",
        "city",
        "min_price",
        "max_price",
        "min_surface",
        "max_surface",
    ];

    fn from_params(p: &mut Params<'_>) -> Self {
        Self {
            kind: p.get("type"),
            status: p.get("status"),
            owner_id: p.get("owner_id"),
            city: p.get("city"),
            price: p.bounds("min_price", "max_price"),
            surface: p.bounds("min_surface", "max_surface"),
        }
    }

    fn matches(&self, r: &Property) -> bool {
        eq(&self.kind, &r.kind)
            && eq(&self.status, &r.status)
            && eq(&self.owner_id, &r.owner_id)
            && self
                .city
                .as_ref()
                .map_or(true, |c| c.eq_ignore_ascii_case(r.city.trim()))
            && self.price.contains(r.price)
            && self.surface.contains(r.surface_area)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContractFilter {
    pub kind: Option<ContractType>,
    pub status: Option<ContractStatus>,
    pub property_id: Option<Id>,
    pub tenant_id: Option<Id>,
    pub start: Bounds<NaiveDate>,
    pub end: Bounds<NaiveDate>,
}

impl Filter for ContractFilter {
    type Record = Contract;

    const KEYS: &'static [&'static str] = &[
        "type",
        "status",
        "property_id",
        "tenant_id",
        "start_from",
        "start_to",
        "end_from",
        "end_to",
    ];

    fn from_params(p: &mut Params<'_>) -> Self {
        Self {
            kind: p.get("type"),
            status: p.get("status"),
            property_id: p.get("property_id"),
            tenant_id: p.get("tenant_id"),
            start: p.bounds("start_from", "start_to"),
            end: p.bounds("end_from", "end_to"),
        }
    }

    fn matches(&self, r: &Contract) -> bool {
        eq(&self.kind, &r.kind)
            && eq(&self.status, &r.status)
            && eq(&self.property_id, &r.property_id)
            && eq(&self.tenant_id, &r.tenant_id)
            && self.start.contains(r.start_date)
            && self.end.contains(r.end_date)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PaymentFilter {
    pub kind: Option<PaymentType>,
    pub status: Option<PaymentStatus>,
    pub contract_id: Option<Id>,
    pub amount: Bounds<f64>,
    pub due: Bounds<NaiveDate>,
}

impl Filter for PaymentFilter {
    type Record = Payment;

    const KEYS: &'static [&'static str] = &[
        "type",
        "status",
        "contract_id",
        "min_amount",
        "max_amount",
        "due_from",
        "due_to",
    ];

    fn from_params(p: &mut Params<'_>) -> Self {
        Self {
            kind: p.get("type"),
            status: p.get("status"),
            contract_id: p.get("contract_id"),
            amount: p.bounds("min_amount", "max_amount"),
            due: p.bounds("due_from", "due_to"),
        }
    }

    fn matches(&self, r: &Payment) -> bool {
        eq(&self.kind, &r.kind)
            && eq(&self.status, &r.status)
            && eq(&self.contract_id, &r.contract_id)
            && self.amount.contains(r.amount)
            && self.due.contains(r.due_date)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceFilter {
    pub kind: Option<MaintenanceType>,
    pub status: Option<MaintenanceStatus>,
    pub property_id: Option<Id>,
    pub requested_by_id: Option<Id>,
    pub assigned_to_id: Option<Id>,
    pub priority: Option<u8>,
    pub priority_range: Bounds<u8>,
    pub requested: Bounds<NaiveDate>,
}

impl Filter for MaintenanceFilter {
    type Record = MaintenanceRequest;

    const KEYS: &'static [&'static str] = &[
        "type",
        "status",
        "property_id",
        "requested_by_id",
        "assigned_to_id",
        "priority",
        "min_priority",
        "max_priority",
        "requested_from",
        "requested_to",
    ];

    fn from_params(p: &mut Params<'_>) -> Self {
        Self {
            kind: p.get("type"),
            status: p.get("status"),
            property_id: p.get("property_id"),
            requested_by_id: p.get("requested_by_id"),
            assigned_to_id: p.get("assigned_to_id"),
            priority: p.get("priority"),
            priority_range: p.bounds("min_priority", "max_priority"),
            requested: p.bounds("requested_from", "requested_to"),
        }
    }

    fn matches(&self, r: &MaintenanceRequest) -> bool {
        eq(&self.kind, &r.kind)
            && eq(&self.status, &r.status)
            && eq(&self.property_id, &r.property_id)
            && eq(&self.requested_by_id, &r.requested_by_id)
            && self
                .assigned_to_id
                .map_or(true, |a| r.assigned_to_id == Some(a))
            && eq(&self.priority, &r.priority)
            && self.priority_range.contains(r.priority)
            && self.requested.contains(r.request_date)
    }
}

/// Parse `key=value` pairs as given on a command line
pub fn params_from_pairs<I, S>(pairs: I) -> Result<BTreeMap<String, String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = BTreeMap::new();
    let mut bad = Vec::new();
    for pair in pairs {
        let pair = pair.as_ref();
        match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                out.insert(k.trim().to_string(), v.to_string());
            }
            _ => bad.push(Violation::new(pair, "expected key=value")),
        }
    }
    if bad.is_empty() {
        Ok(out)
    } else {
        Err(Error::Validation(Violations(bad)))
    }
}

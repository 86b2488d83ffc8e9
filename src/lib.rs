//! Property ledger: properties, rental contracts, payments and maintenance
//! requests over an embedded sled store.
//!
//! The core (`registry` and the modules it builds on) is synchronous and
//! transport-agnostic; `rest` exposes it over HTTP.

pub mod access;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod integrity;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod query;
pub mod reconcile;
pub mod registry;
// REST API: axum handlers on port 11111
pub mod rest;
pub mod storage;

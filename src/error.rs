//! Error types for the ledger core.
//!
//! Every operation returns one of a small set of recoverable error kinds.
//! The REST layer maps [`ErrorKind`] to transport status codes; the core never
//! knows about HTTP.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::models::{EntityKind, Id};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// A single violated constraint, tied to the field that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Aggregated list of violations, rendered as `field: message; ...`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Violations(pub Vec<Violation>);

impl Violations {
    pub fn fields(&self) -> Vec<String> {
        self.0.iter().map(|v| v.field.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", v.field, v.message)?;
        }
        Ok(())
    }
}

/// Coarse error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    InvalidStateTransition,
    Forbidden,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    /// One or more fields are malformed or out of range
    #[error("validation failed: {0}")]
    Validation(Violations),

    /// The addressed record does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: Id },

    /// Foreign keys of a write point at missing or deactivated rows
    #[error("broken references: {0}")]
    BrokenReferences(Violations),

    /// Referential, uniqueness or concurrent-transition conflict
    #[error("conflict: {detail}")]
    Conflict {
        detail: String,
        fields: Vec<String>,
    },

    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        entity: EntityKind,
        id: Id,
        from: String,
        to: String,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound { .. } | Error::BrokenReferences(_) => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::Storage(_) | Error::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Offending fields, when the error is tied to specific ones
    pub fn fields(&self) -> Vec<String> {
        match self {
            Error::Validation(v) | Error::BrokenReferences(v) => v.fields(),
            Error::Conflict { fields, .. } => fields.clone(),
            _ => Vec::new(),
        }
    }

    pub fn not_found(entity: EntityKind, id: Id) -> Self {
        Error::NotFound { entity, id }
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Error::Conflict {
            detail: detail.into(),
            fields: Vec::new(),
        }
    }

    pub fn conflict_on(field: &str, detail: impl Into<String>) -> Self {
        Error::Conflict {
            detail: detail.into(),
            fields: vec![field.to_string()],
        }
    }

    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Error::Validation(Violations(vec![Violation::new(field, message)]))
    }
}

/// Collects violations so a whole record is checked before reporting.
#[derive(Debug, Default)]
pub struct Validator {
    violations: Vec<Violation>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ok: bool, field: &str, message: impl Into<String>) -> &mut Self {
        if !ok {
            self.violations.push(Violation::new(field, message));
        }
        self
    }

    pub fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    pub fn not_blank(&mut self, value: &str, field: &str) -> &mut Self {
        self.check(!value.trim().is_empty(), field, "must not be empty")
    }

    pub fn max_len(&mut self, value: &str, max: usize, field: &str) -> &mut Self {
        self.check(
            value.chars().count() <= max,
            field,
            format!("must be at most {} characters", max),
        )
    }

    pub fn non_negative(&mut self, value: f64, field: &str) -> &mut Self {
        self.check(value.is_finite() && value >= 0.0, field, "must be a finite number >= 0")
    }

    pub fn non_negative_opt(&mut self, value: Option<f64>, field: &str) -> &mut Self {
        match value {
            Some(v) => self.non_negative(v, field),
            None => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn finish(self) -> Result<()> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(Violations(self.violations)))
        }
    }
}

//! Error types for planning and applying schema changes.

use std::borrow::Cow;

use schemaguard_core::ssot::ParseError;
use sqlx::postgres::PgDatabaseError;

/// SQLSTATE raised when a called function does not exist.
pub const UNDEFINED_FUNCTION: &str = "42883";

/// Errors that can occur while planning, applying or auditing.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Missing or invalid settings. Fatal.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The privileged procedures are not installed on the tenant database.
    #[error("Tenant database is not bootstrapped: {procedure}() is missing")]
    NotBootstrapped {
        /// The procedure that was called.
        procedure: String,
        /// SQL that installs the procedures.
        remediation_sql: String,
    },

    /// The caller asked for something invalid. Raised before any SQL runs.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The SSOT script could not be parsed.
    #[error("Failed to parse SSOT: {0}")]
    Parse(#[from] ParseError),

    /// Database error, classified from the driver error.
    #[error("Database error: {message}{}", .code.as_deref().map(|c| format!(" (SQLSTATE {c})")).unwrap_or_default())]
    Database {
        /// Primary message.
        message: String,
        /// SQLSTATE code.
        code: Option<String>,
        /// Detail line.
        detail: Option<String>,
        /// Hint line.
        hint: Option<String>,
    },

    /// Another apply is running for the tenant.
    #[error("Another apply is already running for tenant '{tenant_id}'")]
    LockContention {
        /// The locked tenant.
        tenant_id: String,
    },

    /// An audit record is not in a state that allows the operation.
    #[error("Invalid plan state: {0}")]
    InvalidState(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (reading the SSOT or snapshot files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// Classifies a driver error, keeping message, code, detail and hint
    /// of server-side errors.
    #[must_use]
    pub fn from_sqlx(err: &sqlx::Error) -> Self {
        let Some(db) = err.as_database_error() else {
            return Self::Database {
                message: err.to_string(),
                code: None,
                detail: None,
                hint: None,
            };
        };
        let (detail, hint) = db
            .try_downcast_ref::<PgDatabaseError>()
            .map_or((None, None), |pg| {
                (pg.detail().map(str::to_string), pg.hint().map(str::to_string))
            });
        Self::Database {
            message: db.message().to_string(),
            code: db.code().map(Cow::into_owned),
            detail,
            hint,
        }
    }

    /// SQLSTATE of a database error.
    #[must_use]
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Returns true for errors the operator fixes by running SQL.
    #[must_use]
    pub const fn is_not_bootstrapped(&self) -> bool {
        matches!(self, Self::NotBootstrapped { .. })
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_sqlx(&err)
    }
}

/// Result type for schemaguard operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

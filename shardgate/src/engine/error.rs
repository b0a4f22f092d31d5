//! Engine error taxonomy.
//!
//! Both adapters classify their engine's native failures into this one
//! enum. The `code()` symbols and the constraint sub-kinds are a stable
//! part of the external interface.

use std::time::Duration;

use thiserror::Error;

/// Which constraint a write violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    NotNull,
    Check,
    ForeignKey,
    PrimaryKey,
    Unknown,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("constraint violation: {message}")]
    Constraint {
        kind: ConstraintKind,
        message: String,
        /// SQLSTATE when the engine reports one (23xxx for integrity).
        sql_state: Option<String>,
    },

    #[error("type error: {0}")]
    Type(String),

    #[error("engine not ready")]
    NotReady,

    #[error("engine already closed")]
    AlreadyClosed,

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("transaction expired")]
    TransactionExpired,

    #[error("transaction \"{0}\" not found")]
    TransactionNotFound(String),

    #[error("transaction is read-only")]
    ReadOnlyTransaction,

    #[error("invalid placeholder: {0}")]
    InvalidPlaceholder(String),

    #[error("missing parameter ${0}")]
    MissingParam(usize),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Stable code symbol for the wire error body.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Syntax(_) => "SYNTAX_ERROR",
            Error::Query(_) => "QUERY_ERROR",
            Error::Constraint { .. } => "CONSTRAINT_VIOLATION",
            Error::Type(_) => "TYPE_ERROR",
            Error::NotReady => "NOT_READY",
            Error::AlreadyClosed => "ALREADY_CLOSED",
            Error::Transaction(_) => "TRANSACTION_ERROR",
            Error::TransactionExpired => "TRANSACTION_EXPIRED",
            Error::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            Error::ReadOnlyTransaction => "READ_ONLY_TRANSACTION",
            Error::InvalidPlaceholder(_) => "INVALID_PLACEHOLDER",
            Error::MissingParam(_) => "MISSING_PARAM",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::ConnectionFailed(_) => "CONNECTION_FAILED",
            Error::Timeout(_) => "TIMEOUT",
        }
    }

    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Constraint { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }
}

/// What the raw backend reports before classification.
#[derive(Debug, Clone, Default)]
pub struct BackendError {
    pub message: String,
    /// Postgres-family engines report SQLSTATE.
    pub sql_state: Option<String>,
    /// SQLite-family engines report a numeric result code.
    pub code: Option<i32>,
}

impl BackendError {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_sql_state(message: &str, sql_state: &str) -> Self {
        Self {
            message: message.into(),
            sql_state: Some(sql_state.into()),
            code: None,
        }
    }

    pub fn with_code(message: &str, code: i32) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
            code: Some(code),
        }
    }
}

fn constraint_kind_from_message(message: &str) -> ConstraintKind {
    let lower = message.to_lowercase();
    if lower.contains("primary key") {
        ConstraintKind::PrimaryKey
    } else if lower.contains("unique") {
        ConstraintKind::Unique
    } else if lower.contains("not null") || lower.contains("not-null") {
        ConstraintKind::NotNull
    } else if lower.contains("foreign key") {
        ConstraintKind::ForeignKey
    } else if lower.contains("check") {
        ConstraintKind::Check
    } else {
        ConstraintKind::Unknown
    }
}

enum SqlStateClass {
    Syntax,
    Constraint(ConstraintKind),
    Query,
    Type,
    Transaction,
    Connection,
    Timeout,
}

/// Classify a Postgres-family error by SQLSTATE class.
pub fn classify_postgres(error: BackendError) -> Error {
    let BackendError {
        message, sql_state, ..
    } = error;

    let Some(state) = sql_state else {
        return Error::Query(message);
    };

    let class = match state.as_str() {
        "42601" => SqlStateClass::Syntax,
        "23505" => SqlStateClass::Constraint(ConstraintKind::Unique),
        "23502" => SqlStateClass::Constraint(ConstraintKind::NotNull),
        "23503" => SqlStateClass::Constraint(ConstraintKind::ForeignKey),
        "23514" => SqlStateClass::Constraint(ConstraintKind::Check),
        other => match other.get(..2).unwrap_or("") {
            "42" => SqlStateClass::Query,
            "23" => SqlStateClass::Constraint(constraint_kind_from_message(&message)),
            "22" => SqlStateClass::Type,
            "25" | "2D" | "40" => SqlStateClass::Transaction,
            "08" => SqlStateClass::Connection,
            "57" => SqlStateClass::Timeout,
            _ => SqlStateClass::Query,
        },
    };

    match class {
        SqlStateClass::Syntax => Error::Syntax(message),
        SqlStateClass::Constraint(kind) => Error::Constraint {
            kind,
            message,
            sql_state: Some(state),
        },
        SqlStateClass::Query => Error::Query(message),
        SqlStateClass::Type => Error::Type(message),
        SqlStateClass::Transaction => Error::Transaction(message),
        SqlStateClass::Connection => Error::ConnectionFailed(message),
        SqlStateClass::Timeout => Error::Timeout(Duration::ZERO),
    }
}

/// Classify a SQLite-family error by result code, message as fallback.
pub fn classify_sqlite(error: BackendError) -> Error {
    let BackendError { message, code, .. } = error;

    match code {
        // SQLITE_ERROR covers syntax problems; disambiguate by message.
        Some(1) => {
            if message.to_lowercase().contains("syntax") {
                Error::Syntax(message)
            } else {
                Error::Query(message)
            }
        }
        // SQLITE_CONSTRAINT and its extended codes.
        Some(19) | Some(1555) | Some(2067) | Some(787) | Some(1299) | Some(275) => {
            let kind = match code {
                Some(1555) => ConstraintKind::PrimaryKey,
                Some(2067) => ConstraintKind::Unique,
                Some(787) => ConstraintKind::ForeignKey,
                Some(1299) => ConstraintKind::NotNull,
                Some(275) => ConstraintKind::Check,
                _ => constraint_kind_from_message(&message),
            };
            Error::Constraint {
                kind,
                message,
                sql_state: None,
            }
        }
        // SQLITE_MISMATCH.
        Some(20) => Error::Type(message),
        // SQLITE_BUSY / SQLITE_LOCKED.
        Some(5) | Some(6) => Error::Transaction(message),
        // SQLITE_CANTOPEN / SQLITE_IOERR.
        Some(14) | Some(10) => Error::ConnectionFailed(message),
        _ => {
            let lower = message.to_lowercase();
            if lower.contains("syntax") {
                Error::Syntax(message)
            } else if lower.contains("constraint") {
                Error::Constraint {
                    kind: constraint_kind_from_message(&message),
                    message,
                    sql_state: None,
                }
            } else {
                Error::Query(message)
            }
        }
    }
}

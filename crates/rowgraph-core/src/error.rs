//! Error types for rowgraph operations.

use crate::object_id::ObjectId;
use std::fmt;

/// The primary error type for all rowgraph operations.
#[derive(Debug)]
pub enum Error {
    /// A lazy attribute or relationship could not be resolved.
    Fault(FaultError),
    /// Validation raised during the commit's validation phase.
    Validation(ValidationError),
    /// A persistence/constraint failure aborted a commit transaction.
    Commit(CommitError),
    /// A `deny` delete rule matched a non-empty relationship.
    DeleteDenied {
        /// Identity of the object whose deletion was denied.
        id: ObjectId,
        /// The relationship that still has related objects.
        relationship: String,
    },
    /// Query translation or execution errors.
    Query(QueryError),
    /// Type conversion errors.
    Type(TypeError),
    /// Mapping metadata lookup errors (unknown entity, attribute, ...).
    Mapping(String),
    /// Operation timed out.
    Timeout,
    /// Custom error with message.
    Custom(String),
}

/// A fault (lazy placeholder) that could not be resolved.
#[derive(Debug)]
pub struct FaultError {
    /// Identity of the object whose fault failed to resolve.
    pub id: ObjectId,
    /// Relationship or attribute name, if the fault was not a whole-row fault.
    pub member: Option<String>,
    /// What went wrong.
    pub kind: FaultErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultErrorKind {
    /// The backing row no longer exists in the database.
    RowMissing,
    /// The identity is a temporary id with no backing diff or row.
    UnresolvableTemporaryId,
}

/// Validation failures collected during commit.
#[derive(Debug, Clone, Default)]
pub struct ValidationError {
    /// Individual failures, one per object/member.
    pub failures: Vec<ValidationFailure>,
}

/// A single validation failure.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    /// Identity of the failing object.
    pub id: ObjectId,
    /// Attribute or relationship name, if field-level.
    pub member: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl ValidationError {
    /// Create an empty validation result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if any failures were recorded.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Record a failure.
    pub fn add(&mut self, id: ObjectId, member: Option<String>, message: impl Into<String>) {
        self.failures.push(ValidationFailure {
            id,
            member,
            message: message.into(),
        });
    }
}

/// A commit transaction failure.
#[derive(Debug)]
pub struct CommitError {
    pub kind: CommitErrorKind,
    /// SQL of the failing statement, if the failure came from the client.
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitErrorKind {
    /// Constraint violation (unique, foreign key, ...).
    Constraint,
    /// Transaction could not be started or finished.
    Transaction,
    /// Key generation failed for a new row.
    KeyGeneration,
    /// Other database error during commit.
    Database,
}

/// Query translation or execution failure.
#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// The declarative query could not be translated to SQL.
    Translation,
    /// The database client reported an execution error.
    Execution,
    /// The result set was shaped unexpectedly (missing column, ...).
    ResultShape,
    /// Statement timed out or was interrupted mid-read.
    Interrupted,
}

/// Type conversion failure when reading column values.
#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fault(e) => write!(f, "fault resolution failed: {e}"),
            Error::Validation(e) => write!(f, "validation failed: {e}"),
            Error::Commit(e) => write!(f, "commit failed: {e}"),
            Error::DeleteDenied { id, relationship } => write!(
                f,
                "delete of {id} denied: relationship '{relationship}' is not empty"
            ),
            Error::Query(e) => write!(f, "query failed: {e}"),
            Error::Type(e) => write!(f, "type error: {e}"),
            Error::Mapping(msg) => write!(f, "mapping error: {msg}"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            FaultErrorKind::RowMissing => "backing row no longer exists",
            FaultErrorKind::UnresolvableTemporaryId => "temporary id has no backing row or diff",
        };
        match &self.member {
            Some(m) => write!(f, "{what} for {}.{m}", self.id),
            None => write!(f, "{what} for {}", self.id),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure(s)", self.failures.len())?;
        if let Some(first) = self.failures.first() {
            write!(f, "; first: {} - {}", first.id, first.message)?;
        }
        Ok(())
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(sql) = &self.sql {
            write!(f, " (sql: {sql})")?;
        }
        Ok(())
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(sql) = &self.sql {
            write!(f, " (sql: {sql})")?;
        }
        Ok(())
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(col) => write!(
                f,
                "expected {} but column '{col}' holds {}",
                self.expected, self.actual
            ),
            None => write!(f, "expected {} but found {}", self.expected, self.actual),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Commit(e) => e.source.as_deref().map(|s| s as _),
            Error::Query(e) => e.source.as_deref().map(|s| s as _),
            _ => None,
        }
    }
}

impl Error {
    /// Shorthand for a translation-phase query error.
    pub fn translation(message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Translation,
            sql: None,
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for an execution-phase query error.
    pub fn execution(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Execution,
            sql: Some(sql.into()),
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for an unexpectedly shaped result set.
    pub fn result_shape(message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::ResultShape,
            sql: None,
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for a constraint failure during commit.
    pub fn constraint(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Commit(CommitError {
            kind: CommitErrorKind::Constraint,
            sql: Some(sql.into()),
            message: message.into(),
            source: None,
        })
    }
}

/// Convenience result type for rowgraph operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the automation engine.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
///
/// Raised by the record store. Inside the dispatcher these are systemic:
/// they abort the pass and surface to the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failure of a single automation action.
///
/// Never propagated out of the dispatcher; recorded on the audit log instead.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Pattern '{pattern}' not found in subject")]
    NoPatternMatch { pattern: String },

    #[error("Invalid parameters for action {action_type}: {reason}")]
    InvalidParams { action_type: String, reason: String },

    #[error("Duplicate check failed: {0}")]
    DuplicateCheck(String),

    #[error("Operation create rejected: {0}")]
    CreateRejected(String),
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        DatabaseError::Serialization(e.to_string())
    }
}

/// Unified error type for the approximate query engine
/// Separates client mistakes from engine failures and background-task faults
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AqeError {
    /// Malformed input: missing SQL, out-of-range fraction, bad identifier
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// SQL engine failure: syntax error, missing table, constraint violation
    #[error("SQL error: {message}")]
    Sql {
        message: String,
        statement: Option<String>,
    },

    /// Deadline exceeded on a database call or background task
    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    /// Sketch codec or merge failure
    #[error("Sketch error: {message}")]
    Sketch { message: String },

    /// Internal errors: should never happen, indicates a bug
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AqeError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn sql(message: impl Into<String>) -> Self {
        Self::Sql {
            message: message.into(),
            statement: None,
        }
    }

    pub fn sql_with_statement(message: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::Sql {
            message: message.into(),
            statement: Some(statement.into()),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn sketch(message: impl Into<String>) -> Self {
        Self::Sketch {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for AqeError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sql {
            message: err.to_string(),
            statement: None,
        }
    }
}

/// Result type alias for engine operations
pub type AqeResult<T> = Result<T, AqeError>;

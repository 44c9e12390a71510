use snafu::Snafu;

/// Errors crossing the tool boundary. Every tool call converts one of these
/// into an error envelope; the server itself never terminates on a tool
/// error.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DbaError {
    #[snafu(display("Configuration error: {message}"))]
    Configuration { message: String },

    #[snafu(display("Failed to connect to database: {source}"))]
    Connection { source: sqlx::Error },

    #[snafu(display("SQL syntax error: {message}"))]
    SqlSyntax { message: String },

    #[snafu(display("Statement not allowed in restricted mode: {node}"))]
    StatementNotAllowed { node: String },

    #[snafu(display("Option '{option}' requires PostgreSQL {required_major} or newer"))]
    UnsupportedOption { option: String, required_major: i32 },

    #[snafu(display(
        "Restricted mode cannot validate this syntax ({construct}); \
         the SQL parser does not support it yet"
    ))]
    UnsupportedSyntaxForRestrictedMode { construct: String },

    #[snafu(display("Query cancelled by statement_timeout after {limit_ms} ms"))]
    QueryTimeout { limit_ms: u64 },

    #[snafu(display(
        "The '{extension}' extension is required but not installed. \
         Install it with: CREATE EXTENSION {extension};"
    ))]
    ExtensionUnavailable { extension: String },

    #[snafu(display("Object not found: {object}"))]
    ObjectNotFound { object: String },

    #[snafu(display("Invalid arguments: {message}"))]
    InvalidArguments { message: String },

    #[snafu(display("Internal error [{trace_id}]: {message}"))]
    Internal { message: String, trace_id: String },
}

impl DbaError {
    pub fn internal(message: impl Into<String>) -> Self {
        DbaError::Internal {
            message: message.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Map a driver-level error to a structured kind. `statement_timeout`
    /// firing server-side reports SQLSTATE 57014.
    pub fn from_sqlx(source: sqlx::Error, limit_ms: u64) -> Self {
        if let sqlx::Error::Database(db) = &source {
            match db.code().as_deref() {
                Some("57014") => return DbaError::QueryTimeout { limit_ms },
                Some("42601") => {
                    return DbaError::SqlSyntax {
                        message: db.message().to_string(),
                    }
                }
                Some("42P01") | Some("42704") | Some("3F000") => {
                    return DbaError::ObjectNotFound {
                        object: db.message().to_string(),
                    }
                }
                _ => {}
            }
        }
        match &source {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DbaError::Connection { source }
            }
            _ => DbaError::internal(source.to_string()),
        }
    }
}

pub type Result<T, E = DbaError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_carry_a_trace_id() {
        let err = DbaError::internal("boom");
        let DbaError::Internal { trace_id, .. } = &err else {
            panic!("expected Internal");
        };
        assert!(!trace_id.is_empty());
        assert!(err.to_string().contains(trace_id));
    }

    #[test]
    fn pool_errors_map_to_connection() {
        let err = DbaError::from_sqlx(sqlx::Error::PoolClosed, 30_000);
        assert!(matches!(err, DbaError::Connection { .. }));
    }
}

use serde_json::json;
use std::collections::BTreeMap;

/// Per-request failure. Every variant maps to a stable wire code; none of
/// them terminate the daemon.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("{0}")]
    BadParams(String),
    #[error("validation failed")]
    Validation(FieldErrors),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Constraint(String),
    #[error("{0}")]
    Transaction(String),
    #[error("stored setting is not valid JSON: {0}")]
    Settings(#[from] serde_json::Error),
    #[error(transparent)]
    Db(rusqlite::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NoWorkspace => "no_workspace",
            AppError::BadParams(_) | AppError::Validation(_) => "bad_params",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Constraint(_) => "constraint_violation",
            AppError::Transaction(_) => "db_tx_failed",
            AppError::Settings(_) | AppError::Db(_) => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::Validation(fields) => Some(json!({ "fields": fields.0 })),
            _ => None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        AppError::BadParams(message.into())
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        AppError::Constraint(message.into())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, msg)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::Constraint(msg.clone().unwrap_or_else(|| f.to_string()))
            }
            _ => AppError::Db(e),
        }
    }
}

/// Field-level validation messages collected before any write.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FieldErrors(pub BTreeMap<String, String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_insert_with(|| message.into());
    }

    pub fn has(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn into_result(self) -> Result<(), AppError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(self))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn unique_violation_maps_to_constraint() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute("CREATE TABLE t(x TEXT UNIQUE)", []).expect("create");
        conn.execute("INSERT INTO t(x) VALUES('a')", []).expect("insert");
        let e: AppError = conn
            .execute("INSERT INTO t(x) VALUES('a')", [])
            .expect_err("duplicate")
            .into();
        assert_eq!(e.code(), "constraint_violation");
    }

    #[test]
    fn first_message_per_field_wins() {
        let mut f = FieldErrors::new();
        f.add("score", "Score must be between 0 and 100");
        f.add("score", "ignored");
        let e = f.into_result().expect_err("invalid");
        assert_eq!(e.code(), "bad_params");
        assert_eq!(
            e.details(),
            Some(json!({ "fields": { "score": "Score must be between 0 and 100" } }))
        );
    }
}

use crate::error::AppError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn app_err(id: &str, method: &str, e: &AppError) -> serde_json::Value {
    match e {
        AppError::Db(_) | AppError::Transaction(_) | AppError::Settings(_) => {
            tracing::error!(method, code = e.code(), error = %e, "storage failure");
        }
        _ => tracing::debug!(method, code = e.code(), error = %e, "request rejected"),
    }
    err(id, e.code(), e.to_string(), e.details())
}

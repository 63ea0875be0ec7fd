use crate::error::{AppError, FieldErrors};
use crate::ipc::error::{app_err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{NaiveDate, NaiveTime};
use rusqlite::{Connection, Transaction};
use serde_json::Value;

pub type HandlerResult = Result<Value, AppError>;

pub const DATE_FMT: &str = "%Y-%m-%d";
pub const TIME_FMT: &str = "%H:%M";

/// Runs `f` against the open workspace database and wraps the outcome in a
/// response envelope.
pub fn with_db<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, &Value) -> HandlerResult,
{
    tracing::debug!(method = %req.method, id = %req.id, "dispatch");
    let result = match state.db.as_ref() {
        Some(conn) => f(conn, &req.params),
        None => Err(AppError::NoWorkspace),
    };
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => app_err(&req.id, &req.method, &e),
    }
}

pub fn begin(conn: &Connection) -> Result<Transaction<'_>, AppError> {
    conn.unchecked_transaction()
        .map_err(|e| AppError::Transaction(e.to_string()))
}

pub fn commit(tx: Transaction<'_>) -> Result<(), AppError> {
    tx.commit().map_err(|e| AppError::Transaction(e.to_string()))
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn current_year() -> String {
    today().format("%Y").to_string()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FMT).ok()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FMT).to_string()
}

fn non_null<'a>(params: &'a Value, key: &str) -> Option<&'a Value> {
    params.get(key).filter(|v| !v.is_null())
}

pub fn required_id(params: &Value, key: &str) -> Result<i64, AppError> {
    let v = non_null(params, key).ok_or_else(|| AppError::bad_params(format!("missing {}", key)))?;
    v.as_i64()
        .ok_or_else(|| AppError::bad_params(format!("{} must be an integer", key)))
}

pub fn optional_id(params: &Value, key: &str) -> Result<Option<i64>, AppError> {
    match non_null(params, key) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| AppError::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn optional_text(params: &Value, key: &str) -> Result<Option<String>, AppError> {
    match non_null(params, key) {
        None => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| AppError::bad_params(format!("{} must be a string", key)))?;
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
    }
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, AppError> {
    match non_null(params, key) {
        None => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| AppError::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn optional_enum<T>(
    params: &Value,
    key: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<Option<T>, AppError> {
    match optional_text(params, key)? {
        None => Ok(None),
        Some(s) => parse(&s)
            .map(Some)
            .ok_or_else(|| AppError::bad_params(format!("unknown {}: {}", key, s))),
    }
}

pub fn required_enum<T>(
    params: &Value,
    key: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, AppError> {
    optional_enum(params, key, parse)?.ok_or_else(|| AppError::bad_params(format!("missing {}", key)))
}

pub fn optional_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, AppError> {
    match optional_text(params, key)? {
        None => Ok(None),
        Some(s) => parse_date(&s)
            .map(Some)
            .ok_or_else(|| AppError::bad_params(format!("{} must be YYYY-MM-DD", key))),
    }
}

/// Fails when any of `keys` is present at all, even as null.
pub fn reject_keys(params: &Value, keys: &[&str]) -> Result<(), AppError> {
    for k in keys {
        if params.get(*k).is_some() {
            return Err(AppError::bad_params(format!("{} is computed and cannot be set", k)));
        }
    }
    Ok(())
}

/// Field-by-field reader that collects validation messages instead of
/// failing on the first one. Every accessor returns `None` for absent,
/// null and invalid values; `finish` reports what went wrong.
pub struct Fields<'a> {
    params: &'a Value,
    errors: FieldErrors,
}

impl<'a> Fields<'a> {
    pub fn new(params: &'a Value) -> Self {
        Self {
            params,
            errors: FieldErrors::new(),
        }
    }

    /// True when the key was sent, null included.
    pub fn present(&self, key: &str) -> bool {
        self.params.get(key).is_some()
    }

    pub fn error(&mut self, key: &str, message: impl Into<String>) {
        self.errors.add(key, message);
    }

    pub fn has_error(&self, key: &str) -> bool {
        self.errors.has(key)
    }

    fn raw(&mut self, key: &str, required: bool) -> Option<&'a Value> {
        let v = non_null(self.params, key);
        if v.is_none() && required {
            self.errors.add(key, format!("{} is required", key));
        }
        v
    }

    pub fn text(&mut self, key: &str, max_len: usize, required: bool) -> Option<String> {
        let v = self.raw(key, required)?;
        let Some(s) = v.as_str() else {
            self.errors.add(key, format!("{} must be a string", key));
            return None;
        };
        let s = s.trim();
        if s.is_empty() {
            if required {
                self.errors.add(key, format!("{} is required", key));
            }
            return None;
        }
        if s.chars().count() > max_len {
            self.errors
                .add(key, format!("{} must be at most {} characters", key, max_len));
            return None;
        }
        Some(s.to_string())
    }

    pub fn email(&mut self, key: &str, required: bool) -> Option<String> {
        let s = self.text(key, 100, required)?;
        let valid = match s.split_once('@') {
            Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
            None => false,
        };
        if !valid {
            self.errors.add(key, format!("{} must be a valid email address", key));
            return None;
        }
        Some(s)
    }

    pub fn int(&mut self, key: &str, min: i64, max: i64, required: bool) -> Option<i64> {
        let v = self.raw(key, required)?;
        let Some(n) = v.as_i64() else {
            self.errors.add(key, format!("{} must be an integer", key));
            return None;
        };
        if !(min..=max).contains(&n) {
            self.errors
                .add(key, format!("{} must be between {} and {}", key, min, max));
            return None;
        }
        Some(n)
    }

    pub fn number(&mut self, key: &str, min: f64, max: f64, required: bool) -> Option<f64> {
        let v = self.raw(key, required)?;
        let Some(n) = v.as_f64().filter(|n| n.is_finite()) else {
            self.errors.add(key, format!("{} must be a number", key));
            return None;
        };
        if n < min || n > max {
            self.errors
                .add(key, format!("{} must be between {} and {}", key, min, max));
            return None;
        }
        Some(n)
    }

    pub fn flag(&mut self, key: &str) -> Option<bool> {
        let v = self.raw(key, false)?;
        let b = v.as_bool();
        if b.is_none() {
            self.errors.add(key, format!("{} must be boolean", key));
        }
        b
    }

    pub fn choice<T>(&mut self, key: &str, parse: fn(&str) -> Option<T>, required: bool) -> Option<T> {
        let s = self.text(key, 40, required)?;
        let parsed = parse(&s);
        if parsed.is_none() {
            self.errors.add(key, format!("unknown {}: {}", key, s));
        }
        parsed
    }

    pub fn date(&mut self, key: &str, required: bool) -> Option<NaiveDate> {
        let s = self.text(key, 10, required)?;
        let d = parse_date(&s);
        if d.is_none() {
            self.errors.add(key, format!("{} must be YYYY-MM-DD", key));
        }
        d
    }

    pub fn time(&mut self, key: &str) -> Option<NaiveTime> {
        let s = self.text(key, 8, false)?;
        let t = NaiveTime::parse_from_str(&s, TIME_FMT)
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
            .ok();
        if t.is_none() {
            self.errors.add(key, format!("{} must be HH:MM", key));
        }
        t
    }

    pub fn finish(self) -> Result<(), AppError> {
        self.errors.into_result()
    }
}

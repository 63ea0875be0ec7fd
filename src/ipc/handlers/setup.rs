use crate::db;
use crate::error::AppError;
use crate::ipc::helpers::{current_year, with_db, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::model::Term;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Reports,
    Attendance,
}

impl SetupSection {
    const ALL: [SetupSection; 2] = [SetupSection::Reports, SetupSection::Attendance];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "reports" => Some(Self::Reports),
            "attendance" => Some(Self::Attendance),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Reports => "reports",
            Self::Attendance => "attendance",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Reports => "setup.reports",
            Self::Attendance => "setup.attendance",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Reports => json!({
            "defaultTerm": Term::Term1.as_str(),
            "defaultAcademicYear": null
        }),
        SetupSection::Attendance => json!({
            "studentLookbackDays": 30,
            "courseLookbackDays": 30,
            "reportLookbackDays": 7
        }),
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Reports => match k.as_str() {
                "defaultTerm" => {
                    let raw = parse_string_max(v, k, 16)?;
                    let term = Term::parse(&raw).ok_or_else(|| format!("unknown term: {}", raw))?;
                    obj.insert(k.clone(), Value::String(term.as_str().to_string()));
                }
                "defaultAcademicYear" => {
                    if v.is_null() {
                        obj.insert(k.clone(), Value::Null);
                        continue;
                    }
                    let s = parse_string_max(v, k, 10)?;
                    if s.is_empty() {
                        obj.insert(k.clone(), Value::Null);
                    } else {
                        obj.insert(k.clone(), Value::String(s));
                    }
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "studentLookbackDays" | "courseLookbackDays" | "reportLookbackDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 366)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> Result<Value, AppError> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            if let Err(msg) = merge_section_patch(section, &mut current, saved_obj) {
                tracing::warn!(section = section.name(), %msg, "ignoring stored setup values");
                current = default_section(section);
            }
        }
    }
    Ok(current)
}

/// Academic year and term used when a report request omits them.
pub fn report_period_defaults(conn: &Connection) -> Result<(String, Term), AppError> {
    let reports = load_section(conn, SetupSection::Reports)?;
    let term = reports
        .get("defaultTerm")
        .and_then(|v| v.as_str())
        .and_then(Term::parse)
        .unwrap_or(Term::Term1);
    let year = reports
        .get("defaultAcademicYear")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(current_year);
    Ok((year, term))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookback {
    Student,
    Course,
    Report,
}

pub fn attendance_lookback_days(conn: &Connection, which: Lookback) -> Result<i64, AppError> {
    let section = load_section(conn, SetupSection::Attendance)?;
    let (key, fallback) = match which {
        Lookback::Student => ("studentLookbackDays", 30),
        Lookback::Course => ("courseLookbackDays", 30),
        Lookback::Report => ("reportLookbackDays", 7),
    };
    Ok(section.get(key).and_then(|v| v.as_i64()).unwrap_or(fallback))
}

fn setup_get(conn: &Connection, _params: &Value) -> HandlerResult {
    let mut out = Map::new();
    for section in SetupSection::ALL {
        out.insert(section.name().to_string(), load_section(conn, section)?);
    }
    Ok(Value::Object(out))
}

fn setup_update(conn: &Connection, params: &Value) -> HandlerResult {
    let section_raw = params
        .get("section")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::bad_params("missing section"))?;
    let section = SetupSection::parse(section_raw)
        .ok_or_else(|| AppError::bad_params("unknown section"))?;
    let patch_obj = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| AppError::bad_params("patch must be an object"))?;

    let mut current = load_section(conn, section)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(AppError::BadParams)?;
    db::settings_set_json(conn, section.key(), &current)?;
    tracing::info!(section = section.name(), "setup section updated");
    let mut out = json!({ "ok": true });
    out[section.name()] = current;
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(with_db(state, req, setup_get)),
        "setup.update" => Some(with_db(state, req, setup_update)),
        _ => None,
    }
}

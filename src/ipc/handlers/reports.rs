use crate::calc::{self, ReportPeriod};
use crate::ipc::handlers::setup::report_period_defaults;
use crate::ipc::helpers::{optional_enum, optional_text, required_enum, required_id, with_db, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::model::{EducationLevel, Stream, Term};
use rusqlite::Connection;
use serde_json::{json, Value};

/// Omitted year/term fall back to the configured defaults.
fn report_period(conn: &Connection, params: &Value) -> Result<ReportPeriod, crate::error::AppError> {
    let year = optional_text(params, "academicYear")?;
    let term = optional_enum(params, "term", Term::parse)?;
    if let (Some(academic_year), Some(term)) = (year.clone(), term) {
        return Ok(ReportPeriod { academic_year, term });
    }
    let (default_year, default_term) = report_period_defaults(conn)?;
    Ok(ReportPeriod {
        academic_year: year.unwrap_or(default_year),
        term: term.unwrap_or(default_term),
    })
}

fn reports_student(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_id(params, "studentId")?;
    let period = report_period(conn, params)?;
    Ok(json!(calc::student_report(conn, student_id, period)?))
}

fn reports_class(conn: &Connection, params: &Value) -> HandlerResult {
    let level = required_enum(params, "level", EducationLevel::parse)?;
    let stream = optional_enum(params, "stream", Stream::parse)?.unwrap_or(Stream::NotApplicable);
    let period = report_period(conn, params)?;
    Ok(json!(calc::class_report(conn, level, stream, period)?))
}

fn reports_subject(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = required_id(params, "subjectId")?;
    let period = report_period(conn, params)?;
    Ok(json!(calc::subject_report(conn, subject_id, period)?))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "reports.student" => Some(with_db(state, req, reports_student)),
        "reports.class" => Some(with_db(state, req, reports_class)),
        "reports.subject" => Some(with_db(state, req, reports_subject)),
        _ => None,
    }
}

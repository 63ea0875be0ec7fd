use crate::error::AppError;
use crate::ipc::helpers::{
    format_date, optional_bool, optional_enum, required_id, today, with_db, Fields, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{EducationLevel, QualificationLevel, Stream, SubjectType};
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRow {
    pub id: i64,
    pub name: String,
    pub code: Option<String>,
    pub level: EducationLevel,
    pub subject_type: SubjectType,
    pub stream: Stream,
    pub description: Option<String>,
    pub active: bool,
    pub credits: i64,
}

const SUBJECT_SELECT: &str =
    "SELECT id, name, code, level, subject_type, stream, description, active, credits FROM subjects";

fn subject_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SubjectRow> {
    Ok(SubjectRow {
        id: r.get(0)?,
        name: r.get(1)?,
        code: r.get(2)?,
        level: r.get(3)?,
        subject_type: r.get(4)?,
        stream: r.get(5)?,
        description: r.get(6)?,
        active: r.get::<_, i64>(7)? != 0,
        credits: r.get(8)?,
    })
}

/// Subjects for a stream include the general (`NotApplicable`) ones.
pub fn list_subjects(
    conn: &Connection,
    level: Option<EducationLevel>,
    stream: Option<Stream>,
    active_only: bool,
) -> Result<Vec<SubjectRow>, AppError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    if let Some(l) = level {
        clauses.push("level = ?");
        bind.push(SqlValue::Text(l.as_str().to_string()));
    }
    if let Some(s) = stream.filter(|s| *s != Stream::NotApplicable) {
        clauses.push("(stream = ? OR stream = 'NotApplicable')");
        bind.push(SqlValue::Text(s.as_str().to_string()));
    }
    if active_only {
        clauses.push("active = 1");
    }
    let mut sql = SUBJECT_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY level, name, id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), subject_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_subject(conn: &Connection, id: i64) -> Result<SubjectRow, AppError> {
    let sql = format!("{} WHERE id = ?", SUBJECT_SELECT);
    conn.query_row(&sql, [id], subject_from_row)
        .optional()?
        .ok_or(AppError::NotFound("subject"))
}

fn apply_subject_fields(f: &mut Fields<'_>, s: &mut SubjectRow, creating: bool) {
    if creating || f.present("name") {
        if let Some(v) = f.text("name", 100, true) {
            s.name = v;
        }
    }
    if f.present("code") {
        s.code = f.text("code", 20, false).map(|c| c.to_ascii_uppercase());
    }
    if creating || f.present("level") {
        if let Some(v) = f.choice("level", EducationLevel::parse, true) {
            s.level = v;
        }
    }
    if f.present("subjectType") {
        if let Some(v) = f.choice("subjectType", SubjectType::parse, true) {
            s.subject_type = v;
        }
    }
    if f.present("stream") {
        s.stream = f
            .choice("stream", Stream::parse, false)
            .unwrap_or(Stream::NotApplicable);
    }
    if f.present("description") {
        s.description = f.text("description", 500, false);
    }
    if f.present("credits") {
        if let Some(v) = f.int("credits", 1, 10, true) {
            s.credits = v;
        }
    }
    if f.present("active") {
        if let Some(v) = f.flag("active") {
            s.active = v;
        }
    }
}

fn subjects_list(conn: &Connection, params: &Value) -> HandlerResult {
    let level = optional_enum(params, "level", EducationLevel::parse)?;
    let stream = optional_enum(params, "stream", Stream::parse)?;
    let active_only = optional_bool(params, "activeOnly")?.unwrap_or(true);
    Ok(json!({ "subjects": list_subjects(conn, level, stream, active_only)? }))
}

fn subjects_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let subject = load_subject(conn, id)?;
    let teachers = list_assignments(conn, id)?;
    Ok(json!({ "subject": subject, "teachers": teachers }))
}

fn subjects_create(conn: &Connection, params: &Value) -> HandlerResult {
    let mut s = SubjectRow {
        id: 0,
        name: String::new(),
        code: None,
        level: EducationLevel::OLevel,
        subject_type: SubjectType::Compulsory,
        stream: Stream::NotApplicable,
        description: None,
        active: true,
        credits: 1,
    };
    let mut f = Fields::new(params);
    apply_subject_fields(&mut f, &mut s, true);
    f.finish()?;

    conn.execute(
        "INSERT INTO subjects(name, code, level, subject_type, stream, description, active, credits)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &s.name,
            s.code.as_deref(),
            s.level,
            s.subject_type,
            s.stream,
            s.description.as_deref(),
            s.active as i64,
            s.credits,
        ),
    )
    .map_err(|e| duplicate_name(e, &s))?;
    s.id = conn.last_insert_rowid();
    Ok(json!({ "subject": s }))
}

fn duplicate_name(e: rusqlite::Error, s: &SubjectRow) -> AppError {
    match AppError::from(e) {
        AppError::Constraint(_) => AppError::constraint(format!(
            "{} subject '{}' already exists",
            s.level.label(),
            s.name
        )),
        other => other,
    }
}

fn subjects_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let mut s = load_subject(conn, id)?;
    let mut f = Fields::new(params);
    apply_subject_fields(&mut f, &mut s, false);
    f.finish()?;

    conn.execute(
        "UPDATE subjects
         SET name = ?, code = ?, level = ?, subject_type = ?, stream = ?, description = ?,
             active = ?, credits = ?
         WHERE id = ?",
        (
            &s.name,
            s.code.as_deref(),
            s.level,
            s.subject_type,
            s.stream,
            s.description.as_deref(),
            s.active as i64,
            s.credits,
            id,
        ),
    )
    .map_err(|e| duplicate_name(e, &s))?;
    Ok(json!({ "subject": s }))
}

/// Soft delete: performance history keeps pointing at the subject.
fn subjects_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let s = load_subject(conn, id)?;
    conn.execute("UPDATE subjects SET active = 0 WHERE id = ?", [id])?;
    tracing::info!(subject_id = id, name = %s.name, "subject deactivated");
    Ok(json!({ "deleted": true, "active": false }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentRow {
    id: i64,
    teacher_id: i64,
    teacher_name: String,
    subject_id: i64,
    qualification_level: QualificationLevel,
    years_of_experience: i64,
    is_primary: bool,
    certification_date: Option<String>,
    qualification_details: Option<String>,
    active: bool,
    assigned_date: String,
}

fn list_assignments(conn: &Connection, subject_id: i64) -> Result<Vec<AssignmentRow>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT ts.id, ts.teacher_id, t.first_name, t.last_name, ts.subject_id,
                ts.qualification_level, ts.years_of_experience, ts.is_primary,
                ts.certification_date, ts.qualification_details, ts.active, ts.assigned_date
         FROM teacher_subjects ts
         JOIN teachers t ON t.id = ts.teacher_id
         WHERE ts.subject_id = ?
         ORDER BY ts.is_primary DESC, t.last_name, t.first_name, ts.id",
    )?;
    let rows = stmt
        .query_map([subject_id], |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(AssignmentRow {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                teacher_name: format!("{} {}", first, last),
                subject_id: r.get(4)?,
                qualification_level: r.get(5)?,
                years_of_experience: r.get(6)?,
                is_primary: r.get::<_, i64>(7)? != 0,
                certification_date: r.get(8)?,
                qualification_details: r.get(9)?,
                active: r.get::<_, i64>(10)? != 0,
                assigned_date: r.get(11)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn subjects_assign_teacher(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = required_id(params, "subjectId")?;
    let teacher_id = required_id(params, "teacherId")?;
    let mut f = Fields::new(params);
    let qualification_level = f.choice("qualificationLevel", QualificationLevel::parse, true);
    let years = f.int("yearsOfExperience", 0, 60, false).unwrap_or(0);
    let is_primary = f.flag("isPrimary").unwrap_or(false);
    let certification_date = f.date("certificationDate", false);
    let details = f.text("qualificationDetails", 500, false);
    f.finish()?;
    let Some(qualification_level) = qualification_level else {
        return Err(AppError::bad_params("missing qualificationLevel"));
    };

    load_subject(conn, subject_id)?;
    let teacher: Option<i64> = conn
        .query_row("SELECT id FROM teachers WHERE id = ?", [teacher_id], |r| r.get(0))
        .optional()?;
    if teacher.is_none() {
        return Err(AppError::NotFound("teacher"));
    }
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM teacher_subjects WHERE teacher_id = ? AND subject_id = ? AND active = 1",
            (teacher_id, subject_id),
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(AppError::constraint(
            "teacher is already assigned to this subject",
        ));
    }

    conn.execute(
        "INSERT INTO teacher_subjects(teacher_id, subject_id, qualification_level, years_of_experience,
                                      is_primary, certification_date, qualification_details, active, assigned_date)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            teacher_id,
            subject_id,
            qualification_level,
            years,
            is_primary as i64,
            certification_date.map(format_date),
            details.as_deref(),
            format_date(today()),
        ),
    )?;
    let id = conn.last_insert_rowid();
    Ok(json!({ "assignmentId": id }))
}

fn subjects_teachers(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = required_id(params, "subjectId")?;
    load_subject(conn, subject_id)?;
    Ok(json!({ "teachers": list_assignments(conn, subject_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "subjects.list" => Some(with_db(state, req, subjects_list)),
        "subjects.get" => Some(with_db(state, req, subjects_get)),
        "subjects.create" => Some(with_db(state, req, subjects_create)),
        "subjects.update" => Some(with_db(state, req, subjects_update)),
        "subjects.delete" => Some(with_db(state, req, subjects_delete)),
        "subjects.assignTeacher" => Some(with_db(state, req, subjects_assign_teacher)),
        "subjects.teachers" => Some(with_db(state, req, subjects_teachers)),
        _ => None,
    }
}

use crate::calc::{self, PerformanceFilter, PerformanceRow};
use crate::error::AppError;
use crate::grading;
use crate::ipc::handlers::scales::band_json;
use crate::ipc::handlers::setup::report_period_defaults;
use crate::ipc::handlers::subjects::list_subjects;
use crate::ipc::helpers::{
    begin, commit, format_date, now_rfc3339, optional_enum, optional_id, optional_text,
    reject_keys, required_enum, required_id, with_db, Fields, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{AssessmentType, EducationLevel, ResultStatus, Term};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Cached resolution fields; only the resolver writes them.
const COMPUTED_KEYS: [&str; 3] = ["letterGrade", "gradePoint", "gradeScaleId"];

fn ensure_student(conn: &Connection, id: i64) -> Result<(), AppError> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [id], |r| r.get::<_, i64>(0))
        .optional()?
        .map(|_| ())
        .ok_or(AppError::NotFound("student"))
}

fn ensure_active_subject(conn: &Connection, id: i64) -> Result<(), AppError> {
    let active: Option<i64> = conn
        .query_row("SELECT active FROM subjects WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    match active {
        None => Err(AppError::NotFound("subject")),
        Some(0) => Err(AppError::bad_params("subject is inactive")),
        Some(_) => Ok(()),
    }
}

fn record_json(row: &PerformanceRow) -> Value {
    json!({ "record": row })
}

fn grading_submit(conn: &Connection, params: &Value) -> HandlerResult {
    reject_keys(params, &COMPUTED_KEYS)?;
    let student_id = required_id(params, "studentId")?;
    let subject_id = required_id(params, "subjectId")?;

    let mut f = Fields::new(params);
    let academic_year = f.text("academicYear", 10, false);
    let term = f.choice("term", Term::parse, false);
    let assessment_type = f.choice("assessmentType", AssessmentType::parse, true);
    let score = f.number("score", 0.0, 100.0, false).map(grading::round_2dp);
    let result_status = f
        .choice("resultStatus", ResultStatus::parse, false)
        .unwrap_or(ResultStatus::Submitted);
    let comments = f.text("comments", 500, false);
    let assessment_date = f.date("assessmentDate", false);
    let is_final_grade = f.flag("isFinalGrade").unwrap_or(false);
    let weight_percentage = f.int("weightPercentage", 0, 100, false).unwrap_or(100);
    f.finish()?;
    let Some(assessment_type) = assessment_type else {
        return Err(AppError::bad_params("missing assessmentType"));
    };

    ensure_student(conn, student_id)?;
    ensure_active_subject(conn, subject_id)?;
    let (default_year, default_term) = report_period_defaults(conn)?;
    let academic_year = academic_year.unwrap_or(default_year);
    let term = term.unwrap_or(default_term);

    let now = now_rfc3339();
    let tx = begin(conn)?;
    tx.execute(
        "INSERT INTO student_subject_performances(
            student_id, subject_id, academic_year, term, assessment_type, score,
            result_status, comments, assessment_date, submitted_at, last_modified,
            is_final_grade, weight_percentage, row_version)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        (
            student_id,
            subject_id,
            &academic_year,
            term,
            assessment_type,
            score,
            result_status,
            comments.as_deref(),
            assessment_date.map(format_date),
            &now,
            &now,
            is_final_grade as i64,
            weight_percentage,
        ),
    )?;
    let id = tx.last_insert_rowid();
    let resolution = grading::write_back(&tx, id)?;
    commit(tx)?;

    tracing::info!(
        performance_id = id,
        student_id,
        subject_id,
        grade = resolution.letter_grade.as_deref().unwrap_or("-"),
        "grade submitted"
    );
    Ok(record_json(&calc::get_performance(conn, id)?))
}

/// Rejects the write when the caller's view of the record is stale.
fn check_version(current: &PerformanceRow, expected: Option<i64>) -> Result<(), AppError> {
    match expected {
        Some(v) if v != current.row_version => Err(AppError::Conflict(format!(
            "performance record {} changed (expected version {}, found {})",
            current.id, v, current.row_version
        ))),
        _ => Ok(()),
    }
}

fn grading_edit(conn: &Connection, params: &Value) -> HandlerResult {
    reject_keys(params, &COMPUTED_KEYS)?;
    let id = required_id(params, "id")?;
    let expected = optional_id(params, "expectedVersion")?;

    let tx = begin(conn)?;
    let mut rec = calc::get_performance(&tx, id)?;
    check_version(&rec, expected)?;

    let mut f = Fields::new(params);
    if f.present("score") {
        rec.score = f.number("score", 0.0, 100.0, false).map(grading::round_2dp);
    }
    if f.present("academicYear") {
        if let Some(v) = f.text("academicYear", 10, true) {
            rec.academic_year = v;
        }
    }
    if f.present("term") {
        if let Some(v) = f.choice("term", Term::parse, true) {
            rec.term = v;
        }
    }
    if f.present("assessmentType") {
        if let Some(v) = f.choice("assessmentType", AssessmentType::parse, true) {
            rec.assessment_type = v;
        }
    }
    if f.present("resultStatus") {
        if let Some(v) = f.choice("resultStatus", ResultStatus::parse, true) {
            rec.result_status = v;
        }
    }
    if f.present("comments") {
        rec.comments = f.text("comments", 500, false);
    }
    if f.present("assessmentDate") {
        rec.assessment_date = f.date("assessmentDate", false).map(format_date);
    }
    if f.present("isFinalGrade") {
        if let Some(v) = f.flag("isFinalGrade") {
            rec.is_final_grade = v;
        }
    }
    if f.present("weightPercentage") {
        if let Some(v) = f.int("weightPercentage", 0, 100, true) {
            rec.weight_percentage = v;
        }
    }
    f.finish()?;

    let changed = tx.execute(
        "UPDATE student_subject_performances
         SET score = ?, academic_year = ?, term = ?, assessment_type = ?, result_status = ?,
             comments = ?, assessment_date = ?, is_final_grade = ?, weight_percentage = ?,
             last_modified = ?, row_version = row_version + 1
         WHERE id = ? AND row_version = ?",
        (
            rec.score,
            &rec.academic_year,
            rec.term,
            rec.assessment_type,
            rec.result_status,
            rec.comments.as_deref(),
            rec.assessment_date.as_deref(),
            rec.is_final_grade as i64,
            rec.weight_percentage,
            now_rfc3339(),
            id,
            rec.row_version,
        ),
    )?;
    if changed == 0 {
        return Err(AppError::Conflict(format!(
            "performance record {} changed during edit",
            id
        )));
    }
    grading::write_back(&tx, id)?;
    commit(tx)?;

    Ok(record_json(&calc::get_performance(conn, id)?))
}

fn grading_set_status(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let status = required_enum(params, "status", ResultStatus::parse)?;
    let expected = optional_id(params, "expectedVersion")?;

    let tx = begin(conn)?;
    let rec = calc::get_performance(&tx, id)?;
    check_version(&rec, expected)?;
    tx.execute(
        "UPDATE student_subject_performances
         SET result_status = ?, last_modified = ?, row_version = row_version + 1
         WHERE id = ?",
        (status, now_rfc3339(), id),
    )?;
    commit(tx)?;

    Ok(record_json(&calc::get_performance(conn, id)?))
}

fn grading_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let n = conn.execute("DELETE FROM student_subject_performances WHERE id = ?", [id])?;
    if n == 0 {
        return Err(AppError::NotFound("performance record"));
    }
    Ok(json!({ "deleted": true }))
}

fn grading_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    Ok(record_json(&calc::get_performance(conn, id)?))
}

fn grading_list(conn: &Connection, params: &Value) -> HandlerResult {
    let filter = PerformanceFilter {
        student_id: optional_id(params, "studentId")?,
        subject_id: optional_id(params, "subjectId")?,
        academic_year: optional_text(params, "academicYear")?,
        term: optional_enum(params, "term", Term::parse)?,
        level: optional_enum(params, "level", EducationLevel::parse)?,
        ..PerformanceFilter::default()
    };
    let records = calc::load_performances(conn, &filter)?;
    Ok(json!({ "records": records }))
}

/// Everything a grade-entry screen needs for one student: their records
/// grouped by period, the subjects offered at their level, and that level's
/// scale.
fn grading_student_overview(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_id(params, "studentId")?;
    let student = calc::get_student_header(conn, student_id)?;
    let records = calc::load_performances(
        conn,
        &PerformanceFilter {
            student_id: Some(student_id),
            ..PerformanceFilter::default()
        },
    )?;

    // Latest year first; terms in calendar order within a year.
    let term_pos = |t: Term| Term::ALL.iter().position(|x| *x == t).unwrap_or(usize::MAX);
    let mut periods: BTreeMap<(std::cmp::Reverse<String>, usize), (Term, Vec<PerformanceRow>)> =
        BTreeMap::new();
    for r in records {
        periods
            .entry((std::cmp::Reverse(r.academic_year.clone()), term_pos(r.term)))
            .or_insert_with(|| (r.term, Vec::new()))
            .1
            .push(r);
    }
    let periods: Vec<Value> = periods
        .into_iter()
        .map(|((std::cmp::Reverse(year), _), (term, rows))| {
            json!({
                "academicYear": year,
                "term": term,
                "stats": calc::student_stats(&rows),
                "records": rows,
            })
        })
        .collect();

    let subjects = list_subjects(conn, Some(student.current_level), None, true)?;
    let table = grading::load_scale_table(conn, Some(student.current_level))?;
    let scale: Vec<Value> = table.bands().iter().map(band_json).collect();

    Ok(json!({
        "student": student,
        "periods": periods,
        "subjects": subjects,
        "scale": scale,
    }))
}

fn grading_recompute(conn: &Connection, params: &Value) -> HandlerResult {
    let level = optional_enum(params, "level", EducationLevel::parse)?;
    let student_id = optional_id(params, "studentId")?;
    let tx = begin(conn)?;
    let summary = grading::recompute(&tx, level, student_id)?;
    commit(tx)?;
    tracing::info!(
        examined = summary.examined,
        changed = summary.changed,
        unresolved = summary.unresolved,
        "grade resolutions recomputed"
    );
    Ok(json!(summary))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "grading.submit" => Some(with_db(state, req, grading_submit)),
        "grading.edit" => Some(with_db(state, req, grading_edit)),
        "grading.setStatus" => Some(with_db(state, req, grading_set_status)),
        "grading.delete" => Some(with_db(state, req, grading_delete)),
        "grading.get" => Some(with_db(state, req, grading_get)),
        "grading.list" => Some(with_db(state, req, grading_list)),
        "grading.studentOverview" => Some(with_db(state, req, grading_student_overview)),
        "grading.recompute" => Some(with_db(state, req, grading_recompute)),
        _ => None,
    }
}

use crate::calc::{self, AttendanceCounts};
use crate::error::AppError;
use crate::ipc::handlers::setup::{attendance_lookback_days, Lookback};
use crate::ipc::helpers::{
    begin, commit, format_date, optional_date, optional_id, required_id, today, with_db, Fields,
    HandlerResult, TIME_FMT,
};
use crate::ipc::types::{AppState, Request};
use crate::model::AttendanceStatus;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceRow {
    id: i64,
    student_id: i64,
    student_name: String,
    student_no: String,
    course_id: i64,
    course_code: String,
    date: String,
    status: AttendanceStatus,
    notes: Option<String>,
    check_in_time: Option<String>,
}

const ATTENDANCE_SELECT: &str = "SELECT a.id, a.student_id, s.first_name, s.last_name, s.student_no,
        a.course_id, c.code, a.attendance_date, a.status, a.notes, a.check_in_time
     FROM attendance a
     JOIN students s ON s.id = a.student_id
     JOIN courses c ON c.id = a.course_id";

fn attendance_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRow> {
    let first: String = r.get(2)?;
    let last: String = r.get(3)?;
    Ok(AttendanceRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: format!("{} {}", first, last),
        student_no: r.get(4)?,
        course_id: r.get(5)?,
        course_code: r.get(6)?,
        date: r.get(7)?,
        status: r.get(8)?,
        notes: r.get(9)?,
        check_in_time: r.get(10)?,
    })
}

/// Records in `[from, to]`, newest date first.
fn load_attendance(
    conn: &Connection,
    student_id: Option<i64>,
    course_id: Option<i64>,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<AttendanceRow>, AppError> {
    let sql = format!(
        "{} WHERE (?1 IS NULL OR a.student_id = ?1)
           AND (?2 IS NULL OR a.course_id = ?2)
           AND a.attendance_date BETWEEN ?3 AND ?4
         ORDER BY a.attendance_date DESC, s.first_name, s.last_name, a.id",
        ATTENDANCE_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (student_id, course_id, format_date(from), format_date(to)),
            attendance_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_attendance_row(conn: &Connection, id: i64) -> Result<AttendanceRow, AppError> {
    let sql = format!("{} WHERE a.id = ?", ATTENDANCE_SELECT);
    conn.query_row(&sql, [id], attendance_from_row)
        .optional()?
        .ok_or(AppError::NotFound("attendance record"))
}

/// `to` defaults to today and `from` to `to` minus the configured lookback.
fn date_range(
    conn: &Connection,
    params: &Value,
    lookback: Lookback,
) -> Result<(NaiveDate, NaiveDate), AppError> {
    let to = optional_date(params, "to")?.unwrap_or_else(today);
    let from = match optional_date(params, "from")? {
        Some(d) => d,
        None => {
            let days = attendance_lookback_days(conn, lookback)?;
            to - chrono::Duration::days(days)
        }
    };
    if from > to {
        return Err(AppError::bad_params("from must not be after to"));
    }
    Ok((from, to))
}

fn is_enrolled(conn: &Connection, student_id: i64, course_id: i64) -> Result<bool, AppError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM course_enrollments WHERE student_id = ? AND course_id = ?",
            (student_id, course_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

fn course_header(conn: &Connection, course_id: i64) -> Result<Value, AppError> {
    conn.query_row(
        "SELECT id, code, name FROM courses WHERE id = ?",
        [course_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
            }))
        },
    )
    .optional()?
    .ok_or(AppError::NotFound("course"))
}

fn format_time(f: &mut Fields<'_>, key: &str) -> Option<String> {
    f.time(key).map(|t| t.format(TIME_FMT).to_string())
}

/// Marks a whole course for one day. Existing marks for that day are
/// replaced; students must be enrolled in the course.
fn attendance_take(conn: &Connection, params: &Value) -> HandlerResult {
    let course_id = required_id(params, "courseId")?;
    let date = optional_date(params, "date")?.unwrap_or_else(today);
    let entries = params
        .get("entries")
        .and_then(|v| v.as_array())
        .ok_or_else(|| AppError::bad_params("entries must be an array"))?;
    course_header(conn, course_id)?;

    let mut parsed: Vec<(i64, AttendanceStatus, Option<String>, Option<String>)> = Vec::new();
    let mut problems = crate::error::FieldErrors::new();
    for (i, entry) in entries.iter().enumerate() {
        let mut f = Fields::new(entry);
        let student_id = f.int("studentId", 1, i64::MAX, true);
        let status = f.choice("status", AttendanceStatus::parse, true);
        let notes = f.text("notes", 200, false);
        let check_in = format_time(&mut f, "checkInTime");
        if let Err(AppError::Validation(fields)) = f.finish() {
            for (k, msg) in fields.0 {
                problems.add(&format!("entries[{}].{}", i, k), msg);
            }
            continue;
        }
        let (Some(student_id), Some(status)) = (student_id, status) else {
            continue;
        };
        if !is_enrolled(conn, student_id, course_id)? {
            problems.add(
                &format!("entries[{}].studentId", i),
                format!("student {} is not enrolled in this course", student_id),
            );
            continue;
        }
        parsed.push((student_id, status, notes, check_in));
    }
    problems.into_result()?;

    let tx = begin(conn)?;
    for (student_id, status, notes, check_in) in &parsed {
        tx.execute(
            "INSERT INTO attendance(student_id, course_id, attendance_date, status, notes, check_in_time)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, course_id, attendance_date) DO UPDATE SET
               status = excluded.status,
               notes = excluded.notes,
               check_in_time = excluded.check_in_time",
            (
                student_id,
                course_id,
                format_date(date),
                status,
                notes.as_deref(),
                check_in.as_deref(),
            ),
        )?;
    }
    commit(tx)?;

    let counts = AttendanceCounts::from_statuses(parsed.iter().map(|p| p.1));
    tracing::info!(course_id, date = %format_date(date), saved = parsed.len(), "attendance taken");
    Ok(json!({
        "date": format_date(date),
        "saved": parsed.len(),
        "summary": counts.to_json(),
    }))
}

fn attendance_create(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_id(params, "studentId")?;
    let course_id = required_id(params, "courseId")?;
    let mut f = Fields::new(params);
    let date = f.date("date", true);
    let status = f.choice("status", AttendanceStatus::parse, true);
    let notes = f.text("notes", 200, false);
    let check_in = format_time(&mut f, "checkInTime");
    f.finish()?;
    let (Some(date), Some(status)) = (date, status) else {
        return Err(AppError::bad_params("missing date or status"));
    };
    course_header(conn, course_id)?;
    if !is_enrolled(conn, student_id, course_id)? {
        return Err(AppError::bad_params("student is not enrolled in this course"));
    }

    conn.execute(
        "INSERT INTO attendance(student_id, course_id, attendance_date, status, notes, check_in_time)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            student_id,
            course_id,
            format_date(date),
            status,
            notes.as_deref(),
            check_in.as_deref(),
        ),
    )
    .map_err(|e| match AppError::from(e) {
        AppError::Constraint(_) => AppError::constraint(format!(
            "attendance for this student and course on {} already exists",
            format_date(date)
        )),
        other => other,
    })?;
    let id = conn.last_insert_rowid();
    Ok(json!({ "record": load_attendance_row(conn, id)? }))
}

fn attendance_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let mut rec = load_attendance_row(conn, id)?;
    let mut f = Fields::new(params);
    if f.present("date") {
        if let Some(d) = f.date("date", true) {
            rec.date = format_date(d);
        }
    }
    if f.present("status") {
        if let Some(s) = f.choice("status", AttendanceStatus::parse, true) {
            rec.status = s;
        }
    }
    if f.present("notes") {
        rec.notes = f.text("notes", 200, false);
    }
    if f.present("checkInTime") {
        rec.check_in_time = format_time(&mut f, "checkInTime");
    }
    f.finish()?;

    conn.execute(
        "UPDATE attendance SET attendance_date = ?, status = ?, notes = ?, check_in_time = ? WHERE id = ?",
        (&rec.date, rec.status, rec.notes.as_deref(), rec.check_in_time.as_deref(), id),
    )?;
    Ok(json!({ "record": rec }))
}

fn attendance_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let n = conn.execute("DELETE FROM attendance WHERE id = ?", [id])?;
    if n == 0 {
        return Err(AppError::NotFound("attendance record"));
    }
    Ok(json!({ "deleted": true }))
}

fn attendance_student(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_id(params, "studentId")?;
    let course_id = optional_id(params, "courseId")?;
    let student = calc::get_student_header(conn, student_id)?;
    let (from, to) = date_range(conn, params, Lookback::Student)?;
    let records = load_attendance(conn, Some(student_id), course_id, from, to)?;
    let counts = AttendanceCounts::from_statuses(records.iter().map(|r| r.status));
    Ok(json!({
        "student": student,
        "from": format_date(from),
        "to": format_date(to),
        "summary": counts.to_json(),
        "records": records,
    }))
}

fn attendance_course(conn: &Connection, params: &Value) -> HandlerResult {
    let course_id = required_id(params, "courseId")?;
    let course = course_header(conn, course_id)?;
    let (from, to) = date_range(conn, params, Lookback::Course)?;
    let records = load_attendance(conn, None, Some(course_id), from, to)?;
    let overall = AttendanceCounts::from_statuses(records.iter().map(|r| r.status));

    // Rows arrive newest first; keep that order per date.
    let mut by_date: BTreeMap<std::cmp::Reverse<String>, Vec<AttendanceRow>> = BTreeMap::new();
    for r in records {
        by_date
            .entry(std::cmp::Reverse(r.date.clone()))
            .or_default()
            .push(r);
    }
    let days: Vec<Value> = by_date
        .into_iter()
        .map(|(std::cmp::Reverse(date), rows)| {
            let counts = AttendanceCounts::from_statuses(rows.iter().map(|r| r.status));
            json!({ "date": date, "summary": counts.to_json(), "records": rows })
        })
        .collect();

    Ok(json!({
        "course": course,
        "from": format_date(from),
        "to": format_date(to),
        "summary": overall.to_json(),
        "days": days,
    }))
}

/// Per-student rates over a range, best attendance first. The overall rate
/// is the mean of the per-student rates.
fn attendance_report(conn: &Connection, params: &Value) -> HandlerResult {
    let course_id = optional_id(params, "courseId")?;
    let (from, to) = date_range(conn, params, Lookback::Report)?;
    let records = load_attendance(conn, None, course_id, from, to)?;

    let mut per_student: HashMap<i64, (String, String, AttendanceCounts)> = HashMap::new();
    for r in &records {
        per_student
            .entry(r.student_id)
            .or_insert_with(|| (r.student_name.clone(), r.student_no.clone(), AttendanceCounts::default()))
            .2
            .record(r.status);
    }
    let mut rows: Vec<(i64, String, String, AttendanceCounts)> = per_student
        .into_iter()
        .map(|(id, (name, no, counts))| (id, name, no, counts))
        .collect();
    rows.sort_by(|a, b| {
        b.3.attendance_rate()
            .total_cmp(&a.3.attendance_rate())
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.0.cmp(&b.0))
    });

    let rates: Vec<f64> = rows.iter().map(|r| r.3.attendance_rate()).collect();
    let overall_rate = calc::round_1dp(calc::mean(&rates));
    let students: Vec<Value> = rows
        .into_iter()
        .map(|(id, name, no, counts)| {
            let mut v = counts.to_json();
            v["studentId"] = json!(id);
            v["studentName"] = json!(name);
            v["studentNo"] = json!(no);
            v
        })
        .collect();

    Ok(json!({
        "from": format_date(from),
        "to": format_date(to),
        "courseId": course_id,
        "overallRate": overall_rate,
        "students": students,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "attendance.take" => Some(with_db(state, req, attendance_take)),
        "attendance.create" => Some(with_db(state, req, attendance_create)),
        "attendance.update" => Some(with_db(state, req, attendance_update)),
        "attendance.delete" => Some(with_db(state, req, attendance_delete)),
        "attendance.student" => Some(with_db(state, req, attendance_student)),
        "attendance.course" => Some(with_db(state, req, attendance_course)),
        "attendance.report" => Some(with_db(state, req, attendance_report)),
        _ => None,
    }
}

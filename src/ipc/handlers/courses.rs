use crate::error::AppError;
use crate::ipc::helpers::{
    format_date, optional_bool, optional_enum, optional_id, optional_text, parse_date,
    required_enum, required_id, today, with_db, Fields, HandlerResult, TIME_FMT,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{EnrollmentStatus, Term};
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CourseRecord {
    id: i64,
    code: String,
    name: String,
    description: Option<String>,
    credits: i64,
    teacher_id: i64,
    teacher_name: String,
    subject_id: Option<i64>,
    academic_year: String,
    term: Term,
    start_date: String,
    end_date: Option<String>,
    max_enrollment: i64,
    days_of_week: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    room: Option<String>,
    schedule: Option<String>,
    enrolled_count: i64,
    is_active: bool,
}

const COURSE_SELECT: &str = "SELECT c.id, c.code, c.name, c.description, c.credits, c.teacher_id,
        t.first_name, t.last_name, c.subject_id, c.academic_year, c.term, c.start_date,
        c.end_date, c.max_enrollment, c.room, c.days_of_week, c.start_time, c.end_time,
        (SELECT COUNT(*) FROM course_enrollments e WHERE e.course_id = c.id AND e.status = 'Active')
     FROM courses c
     JOIN teachers t ON t.id = c.teacher_id";

/// A course without an end date, or ending after today, is active.
fn course_is_active(end_date: Option<&str>) -> bool {
    match end_date.and_then(parse_date) {
        None => true,
        Some(end) => end > today(),
    }
}

/// "Mon, Wed 08:00 - 09:20 (Lab 2)"; None until days or times are set.
fn schedule_label(
    days: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
    room: Option<&str>,
) -> Option<String> {
    if days.is_none() && start.is_none() && end.is_none() {
        return None;
    }
    let mut parts: Vec<String> = Vec::new();
    if let Some(d) = days {
        parts.push(d.to_string());
    }
    match (start, end) {
        (Some(s), Some(e)) => parts.push(format!("{} - {}", s, e)),
        (Some(t), None) | (None, Some(t)) => parts.push(t.to_string()),
        (None, None) => {}
    }
    if let Some(r) = room {
        parts.push(format!("({})", r));
    }
    Some(parts.join(" "))
}

fn course_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<CourseRecord> {
    let first: String = r.get(6)?;
    let last: String = r.get(7)?;
    let end_date: Option<String> = r.get(12)?;
    let room: Option<String> = r.get(14)?;
    let days_of_week: Option<String> = r.get(15)?;
    let start_time: Option<String> = r.get(16)?;
    let end_time: Option<String> = r.get(17)?;
    Ok(CourseRecord {
        id: r.get(0)?,
        code: r.get(1)?,
        name: r.get(2)?,
        description: r.get(3)?,
        credits: r.get(4)?,
        teacher_id: r.get(5)?,
        teacher_name: format!("{} {}", first, last),
        subject_id: r.get(8)?,
        academic_year: r.get(9)?,
        term: r.get(10)?,
        start_date: r.get(11)?,
        is_active: course_is_active(end_date.as_deref()),
        end_date,
        max_enrollment: r.get(13)?,
        schedule: schedule_label(
            days_of_week.as_deref(),
            start_time.as_deref(),
            end_time.as_deref(),
            room.as_deref(),
        ),
        days_of_week,
        start_time,
        end_time,
        room,
        enrolled_count: r.get(18)?,
    })
}

fn load_course(conn: &Connection, id: i64) -> Result<CourseRecord, AppError> {
    let sql = format!("{} WHERE c.id = ?", COURSE_SELECT);
    conn.query_row(&sql, [id], course_from_row)
        .optional()?
        .ok_or(AppError::NotFound("course"))
}

fn exists(conn: &Connection, table: &str, id: i64) -> Result<bool, AppError> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

fn apply_course_fields(f: &mut Fields<'_>, c: &mut CourseRecord, creating: bool) {
    if creating || f.present("code") {
        if let Some(v) = f.text("code", 20, true) {
            c.code = v.to_ascii_uppercase();
        }
    }
    if creating || f.present("name") {
        if let Some(v) = f.text("name", 100, true) {
            c.name = v;
        }
    }
    if f.present("description") {
        c.description = f.text("description", 500, false);
    }
    if f.present("credits") {
        if let Some(v) = f.int("credits", 1, 6, true) {
            c.credits = v;
        }
    }
    if creating || f.present("teacherId") {
        if let Some(v) = f.int("teacherId", 1, i64::MAX, true) {
            c.teacher_id = v;
        }
    }
    if f.present("subjectId") {
        c.subject_id = f.int("subjectId", 1, i64::MAX, false);
    }
    if creating || f.present("academicYear") {
        if let Some(v) = f.text("academicYear", 10, true) {
            c.academic_year = v;
        }
    }
    if f.present("term") {
        if let Some(v) = f.choice("term", Term::parse, true) {
            c.term = v;
        }
    }
    if creating || f.present("startDate") {
        if let Some(d) = f.date("startDate", true) {
            c.start_date = format_date(d);
        }
    }
    if f.present("endDate") {
        c.end_date = f.date("endDate", false).map(format_date);
    }
    if f.present("maxEnrollment") {
        if let Some(v) = f.int("maxEnrollment", 1, 200, true) {
            c.max_enrollment = v;
        }
    }
    if f.present("room") {
        c.room = f.text("room", 50, false);
    }
    if f.present("daysOfWeek") {
        c.days_of_week = f.text("daysOfWeek", 50, false);
    }
    if f.present("startTime") {
        c.start_time = f.time("startTime").map(|t| t.format(TIME_FMT).to_string());
    }
    if f.present("endTime") {
        c.end_time = f.time("endTime").map(|t| t.format(TIME_FMT).to_string());
    }
    if let (Some(start), Some(end)) = (c.start_time.as_deref(), c.end_time.as_deref()) {
        // HH:MM sorts as time.
        if !f.has_error("startTime") && !f.has_error("endTime") && end <= start {
            f.error("endTime", "endTime must be after startTime");
        }
    }
    if let Some(end) = c.end_date.as_deref() {
        // Both are canonical YYYY-MM-DD, so string order is date order.
        if !f.has_error("startDate") && !f.has_error("endDate") && end < c.start_date.as_str() {
            f.error("endDate", "endDate cannot be before startDate");
        }
    }
}

fn check_references(conn: &Connection, c: &CourseRecord) -> Result<(), AppError> {
    if !exists(conn, "teachers", c.teacher_id)? {
        return Err(AppError::NotFound("teacher"));
    }
    if let Some(subject_id) = c.subject_id {
        if !exists(conn, "subjects", subject_id)? {
            return Err(AppError::NotFound("subject"));
        }
    }
    Ok(())
}

fn duplicate_code(e: rusqlite::Error, code: &str) -> AppError {
    match AppError::from(e) {
        AppError::Constraint(_) => {
            AppError::constraint(format!("course code {} is already in use", code))
        }
        other => other,
    }
}

fn courses_list(conn: &Connection, params: &Value) -> HandlerResult {
    let teacher_id = optional_id(params, "teacherId")?;
    let academic_year = optional_text(params, "academicYear")?;
    let term = optional_enum(params, "term", Term::parse)?;
    let active_only = optional_bool(params, "activeOnly")?.unwrap_or(false);

    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    if let Some(id) = teacher_id {
        clauses.push("c.teacher_id = ?");
        bind.push(SqlValue::Integer(id));
    }
    if let Some(y) = academic_year {
        clauses.push("c.academic_year = ?");
        bind.push(SqlValue::Text(y));
    }
    if let Some(t) = term {
        clauses.push("c.term = ?");
        bind.push(SqlValue::Text(t.as_str().to_string()));
    }
    let mut sql = COURSE_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY c.code, c.id");

    let mut stmt = conn.prepare(&sql)?;
    let courses: Vec<CourseRecord> = stmt
        .query_map(params_from_iter(bind), course_from_row)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|c| !active_only || c.is_active)
        .collect();
    Ok(json!({ "courses": courses }))
}

fn courses_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let course = load_course(conn, id)?;
    let enrollments = list_enrollments(conn, None, Some(id))?;
    Ok(json!({ "course": course, "enrollments": enrollments }))
}

fn courses_create(conn: &Connection, params: &Value) -> HandlerResult {
    let mut c = CourseRecord {
        id: 0,
        code: String::new(),
        name: String::new(),
        description: None,
        credits: 3,
        teacher_id: 0,
        teacher_name: String::new(),
        subject_id: None,
        academic_year: String::new(),
        term: Term::Term1,
        start_date: format_date(today()),
        end_date: None,
        max_enrollment: 30,
        days_of_week: None,
        start_time: None,
        end_time: None,
        room: None,
        schedule: None,
        enrolled_count: 0,
        is_active: true,
    };
    let mut f = Fields::new(params);
    apply_course_fields(&mut f, &mut c, true);
    f.finish()?;
    check_references(conn, &c)?;

    conn.execute(
        "INSERT INTO courses(code, name, description, credits, teacher_id, subject_id, academic_year,
                             term, start_date, end_date, max_enrollment, room,
                             days_of_week, start_time, end_time)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &c.code,
            &c.name,
            c.description.as_deref(),
            c.credits,
            c.teacher_id,
            c.subject_id,
            &c.academic_year,
            c.term,
            &c.start_date,
            c.end_date.as_deref(),
            c.max_enrollment,
            c.room.as_deref(),
            c.days_of_week.as_deref(),
            c.start_time.as_deref(),
            c.end_time.as_deref(),
        ),
    )
    .map_err(|e| duplicate_code(e, &c.code))?;
    let id = conn.last_insert_rowid();
    Ok(json!({ "course": load_course(conn, id)? }))
}

fn courses_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let mut c = load_course(conn, id)?;
    let mut f = Fields::new(params);
    apply_course_fields(&mut f, &mut c, false);
    f.finish()?;
    check_references(conn, &c)?;

    conn.execute(
        "UPDATE courses
         SET code = ?, name = ?, description = ?, credits = ?, teacher_id = ?, subject_id = ?,
             academic_year = ?, term = ?, start_date = ?, end_date = ?, max_enrollment = ?, room = ?,
             days_of_week = ?, start_time = ?, end_time = ?
         WHERE id = ?",
        (
            &c.code,
            &c.name,
            c.description.as_deref(),
            c.credits,
            c.teacher_id,
            c.subject_id,
            &c.academic_year,
            c.term,
            &c.start_date,
            c.end_date.as_deref(),
            c.max_enrollment,
            c.room.as_deref(),
            c.days_of_week.as_deref(),
            c.start_time.as_deref(),
            c.end_time.as_deref(),
            id,
        ),
    )
    .map_err(|e| duplicate_code(e, &c.code))?;
    Ok(json!({ "course": load_course(conn, id)? }))
}

/// Blocked while any enrollment (in any status) references the course.
fn courses_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    load_course(conn, id)?;
    let enrollments: i64 = conn.query_row(
        "SELECT COUNT(*) FROM course_enrollments WHERE course_id = ?",
        [id],
        |r| r.get(0),
    )?;
    if enrollments > 0 {
        return Err(AppError::constraint(format!(
            "course has {} enrollment(s); remove them first",
            enrollments
        )));
    }
    conn.execute("DELETE FROM courses WHERE id = ?", [id])?;
    Ok(json!({ "deleted": true }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnrollmentRow {
    id: i64,
    student_id: i64,
    student_name: String,
    course_id: i64,
    course_code: String,
    course_name: String,
    enrollment_date: String,
    status: EnrollmentStatus,
}

fn list_enrollments(
    conn: &Connection,
    student_id: Option<i64>,
    course_id: Option<i64>,
) -> Result<Vec<EnrollmentRow>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.student_id, s.first_name, s.last_name, e.course_id, c.code, c.name,
                e.enrollment_date, e.status
         FROM course_enrollments e
         JOIN students s ON s.id = e.student_id
         JOIN courses c ON c.id = e.course_id
         WHERE (?1 IS NULL OR e.student_id = ?1)
           AND (?2 IS NULL OR e.course_id = ?2)
         ORDER BY c.code, s.first_name, s.last_name, e.id",
    )?;
    let rows = stmt
        .query_map((student_id, course_id), |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(EnrollmentRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                student_name: format!("{} {}", first, last),
                course_id: r.get(4)?,
                course_code: r.get(5)?,
                course_name: r.get(6)?,
                enrollment_date: r.get(7)?,
                status: r.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn ensure_capacity(course: &CourseRecord) -> Result<(), AppError> {
    if course.enrolled_count >= course.max_enrollment {
        return Err(AppError::constraint(format!(
            "course {} is full ({} of {})",
            course.code, course.enrolled_count, course.max_enrollment
        )));
    }
    Ok(())
}

fn enrollments_create(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_id(params, "studentId")?;
    let course_id = required_id(params, "courseId")?;
    let mut f = Fields::new(params);
    let date = f.date("enrollmentDate", false).unwrap_or_else(today);
    let status = f
        .choice("status", EnrollmentStatus::parse, false)
        .unwrap_or(EnrollmentStatus::Active);
    f.finish()?;

    if !exists(conn, "students", student_id)? {
        return Err(AppError::NotFound("student"));
    }
    let course = load_course(conn, course_id)?;
    if status == EnrollmentStatus::Active {
        ensure_capacity(&course)?;
    }

    conn.execute(
        "INSERT INTO course_enrollments(student_id, course_id, enrollment_date, status)
         VALUES(?, ?, ?, ?)",
        (student_id, course_id, format_date(date), status),
    )
    .map_err(|e| match AppError::from(e) {
        AppError::Constraint(_) => {
            AppError::constraint("student is already enrolled in this course")
        }
        other => other,
    })?;
    let id = conn.last_insert_rowid();
    tracing::debug!(enrollment_id = id, student_id, course_id, "student enrolled");
    Ok(json!({ "enrollmentId": id }))
}

fn enrollments_list(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = optional_id(params, "studentId")?;
    let course_id = optional_id(params, "courseId")?;
    Ok(json!({ "enrollments": list_enrollments(conn, student_id, course_id)? }))
}

fn enrollments_set_status(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let status = required_enum(params, "status", EnrollmentStatus::parse)?;
    let (course_id, current): (i64, EnrollmentStatus) = conn
        .query_row(
            "SELECT course_id, status FROM course_enrollments WHERE id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?
        .ok_or(AppError::NotFound("enrollment"))?;
    // Reactivating takes a seat like a new enrollment does.
    if status == EnrollmentStatus::Active && current != EnrollmentStatus::Active {
        ensure_capacity(&load_course(conn, course_id)?)?;
    }
    conn.execute(
        "UPDATE course_enrollments SET status = ? WHERE id = ?",
        (status, id),
    )?;
    Ok(json!({ "id": id, "status": status }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "courses.list" => Some(with_db(state, req, courses_list)),
        "courses.get" => Some(with_db(state, req, courses_get)),
        "courses.create" => Some(with_db(state, req, courses_create)),
        "courses.update" => Some(with_db(state, req, courses_update)),
        "courses.delete" => Some(with_db(state, req, courses_delete)),
        "enrollments.create" => Some(with_db(state, req, enrollments_create)),
        "enrollments.list" => Some(with_db(state, req, enrollments_list)),
        "enrollments.setStatus" => Some(with_db(state, req, enrollments_set_status)),
        _ => None,
    }
}

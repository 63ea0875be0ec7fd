use crate::calc::AttendanceCounts;
use crate::error::AppError;
use crate::ipc::helpers::{format_date, optional_date, today, with_db, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::model::{AttendanceStatus, EducationLevel};
use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};

const RECENT_STUDENT_DAYS: i64 = 30;
const LIST_LIMIT: i64 = 5;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecentStudent {
    id: i64,
    student_no: String,
    full_name: String,
    current_level: EducationLevel,
    enrollment_date: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PopularCourse {
    id: i64,
    code: String,
    name: String,
    teacher_name: String,
    enrollment_count: i64,
}

fn count(conn: &Connection, sql: &str) -> Result<i64, AppError> {
    Ok(conn.query_row(sql, [], |r| r.get(0))?)
}

/// Students enrolled in the school within the window ending on `date`.
fn recent_students(conn: &Connection, date: NaiveDate) -> Result<Vec<RecentStudent>, AppError> {
    let since = date - Duration::days(RECENT_STUDENT_DAYS);
    let mut stmt = conn.prepare(
        "SELECT id, student_no, first_name, last_name, current_level, enrollment_date
         FROM students
         WHERE enrollment_date >= ?1 AND enrollment_date <= ?2
         ORDER BY enrollment_date DESC, id DESC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map((format_date(since), format_date(date), LIST_LIMIT), |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(RecentStudent {
                id: r.get(0)?,
                student_no: r.get(1)?,
                full_name: format!("{} {}", first, last),
                current_level: r.get(4)?,
                enrollment_date: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Courses with the most enrollments of any status.
fn popular_courses(conn: &Connection) -> Result<Vec<PopularCourse>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.code, c.name, t.first_name, t.last_name,
                (SELECT COUNT(*) FROM course_enrollments e WHERE e.course_id = c.id) AS n
         FROM courses c
         JOIN teachers t ON t.id = c.teacher_id
         ORDER BY n DESC, c.code
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([LIST_LIMIT], |r| {
            let first: String = r.get(3)?;
            let last: String = r.get(4)?;
            Ok(PopularCourse {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
                teacher_name: format!("{} {}", first, last),
                enrollment_count: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn day_attendance(conn: &Connection, date: NaiveDate) -> Result<AttendanceCounts, AppError> {
    let mut stmt = conn.prepare("SELECT status FROM attendance WHERE attendance_date = ?")?;
    let statuses = stmt
        .query_map([format_date(date)], |r| r.get::<_, AttendanceStatus>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AttendanceCounts::from_statuses(statuses))
}

fn dashboard_summary(conn: &Connection, params: &Value) -> HandlerResult {
    let date = optional_date(params, "date")?.unwrap_or_else(today);
    let students = count(conn, "SELECT COUNT(*) FROM students")?;
    let teachers = count(conn, "SELECT COUNT(*) FROM teachers")?;
    let subjects = count(conn, "SELECT COUNT(*) FROM subjects WHERE active = 1")?;
    let courses = count(conn, "SELECT COUNT(*) FROM courses")?;
    // Canonical YYYY-MM-DD compares as a date.
    let active_courses: i64 = conn.query_row(
        "SELECT COUNT(*) FROM courses WHERE end_date IS NULL OR end_date > ?",
        [format_date(date)],
        |r| r.get(0),
    )?;
    let enrollments = count(conn, "SELECT COUNT(*) FROM course_enrollments")?;
    let pending = count(
        conn,
        "SELECT COUNT(*) FROM student_subject_performances WHERE result_status = 'Pending'",
    )?;

    Ok(json!({
        "counts": {
            "students": students,
            "teachers": teachers,
            "subjects": subjects,
            "courses": courses,
            "activeCourses": active_courses,
            "enrollments": enrollments,
            "pendingResults": pending,
        },
        "recentStudents": recent_students(conn, date)?,
        "popularCourses": popular_courses(conn)?,
        "attendance": {
            "date": format_date(date),
            "summary": day_attendance(conn, date)?.to_json(),
        },
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "dashboard.summary" => Some(with_db(state, req, dashboard_summary)),
        _ => None,
    }
}

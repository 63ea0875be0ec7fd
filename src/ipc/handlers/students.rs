use crate::error::AppError;
use crate::grading;
use crate::ipc::helpers::{
    begin, commit, format_date, optional_bool, optional_enum, optional_text, required_id, today,
    with_db, Fields, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{EducationLevel, Stream};
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StudentRecord {
    id: i64,
    first_name: String,
    last_name: String,
    email: String,
    student_no: String,
    date_of_birth: Option<String>,
    phone: Option<String>,
    address: Option<String>,
    enrollment_date: String,
    current_level: EducationLevel,
    current_class: Option<String>,
    stream: Stream,
    index_number: Option<String>,
    academic_year: Option<String>,
    guardian_name: Option<String>,
    guardian_phone: Option<String>,
    active: bool,
}

const STUDENT_SELECT: &str = "SELECT id, first_name, last_name, email, student_no, date_of_birth, phone,
        address, enrollment_date, current_level, current_class, stream, index_number,
        academic_year, guardian_name, guardian_phone, active
     FROM students";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        id: r.get(0)?,
        first_name: r.get(1)?,
        last_name: r.get(2)?,
        email: r.get(3)?,
        student_no: r.get(4)?,
        date_of_birth: r.get(5)?,
        phone: r.get(6)?,
        address: r.get(7)?,
        enrollment_date: r.get(8)?,
        current_level: r.get(9)?,
        current_class: r.get(10)?,
        stream: r.get(11)?,
        index_number: r.get(12)?,
        academic_year: r.get(13)?,
        guardian_name: r.get(14)?,
        guardian_phone: r.get(15)?,
        active: r.get::<_, i64>(16)? != 0,
    })
}

fn load_student(conn: &Connection, id: i64) -> Result<StudentRecord, AppError> {
    let sql = format!("{} WHERE id = ?", STUDENT_SELECT);
    conn.query_row(&sql, [id], student_from_row)
        .optional()?
        .ok_or(AppError::NotFound("student"))
}

fn student_json(s: &StudentRecord) -> Value {
    let mut v = json!(s);
    v["fullName"] = json!(format!("{} {}", s.first_name, s.last_name));
    v["levelLabel"] = json!(s.current_level.label());
    v
}

fn apply_student_fields(f: &mut Fields<'_>, s: &mut StudentRecord, creating: bool) {
    if creating || f.present("firstName") {
        if let Some(v) = f.text("firstName", 50, true) {
            s.first_name = v;
        }
    }
    if creating || f.present("lastName") {
        if let Some(v) = f.text("lastName", 50, true) {
            s.last_name = v;
        }
    }
    if creating || f.present("email") {
        if let Some(v) = f.email("email", true) {
            s.email = v;
        }
    }
    if creating || f.present("studentNo") {
        if let Some(v) = f.text("studentNo", 20, true) {
            s.student_no = v;
        }
    }
    if f.present("dateOfBirth") {
        s.date_of_birth = f.date("dateOfBirth", false).map(format_date);
    }
    if f.present("phone") {
        s.phone = f.text("phone", 20, false);
    }
    if f.present("address") {
        s.address = f.text("address", 200, false);
    }
    if f.present("enrollmentDate") {
        if let Some(d) = f.date("enrollmentDate", true) {
            s.enrollment_date = format_date(d);
        }
    }
    if f.present("currentLevel") {
        if let Some(v) = f.choice("currentLevel", EducationLevel::parse, true) {
            s.current_level = v;
        }
    }
    if f.present("currentClass") {
        s.current_class = f.text("currentClass", 10, false);
    }
    if f.present("stream") {
        s.stream = f
            .choice("stream", Stream::parse, false)
            .unwrap_or(Stream::NotApplicable);
    }
    if f.present("indexNumber") {
        s.index_number = f.text("indexNumber", 20, false);
    }
    if f.present("academicYear") {
        s.academic_year = f.text("academicYear", 10, false);
    }
    if f.present("guardianName") {
        s.guardian_name = f.text("guardianName", 100, false);
    }
    if f.present("guardianPhone") {
        s.guardian_phone = f.text("guardianPhone", 20, false);
    }
    if f.present("active") {
        if let Some(v) = f.flag("active") {
            s.active = v;
        }
    }
}

fn students_list(conn: &Connection, params: &Value) -> HandlerResult {
    let level = optional_enum(params, "level", EducationLevel::parse)?;
    let stream = optional_enum(params, "stream", Stream::parse)?;
    let active_only = optional_bool(params, "activeOnly")?.unwrap_or(false);
    let search = optional_text(params, "search")?;

    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    if let Some(l) = level {
        clauses.push("current_level = ?");
        bind.push(SqlValue::Text(l.as_str().to_string()));
    }
    if let Some(s) = stream.filter(|s| *s != Stream::NotApplicable) {
        clauses.push("stream = ?");
        bind.push(SqlValue::Text(s.as_str().to_string()));
    }
    if active_only {
        clauses.push("active = 1");
    }
    if let Some(q) = search {
        clauses.push("(first_name LIKE ? OR last_name LIKE ? OR student_no LIKE ? OR email LIKE ?)");
        let pattern = format!("%{}%", q);
        bind.extend(std::iter::repeat(SqlValue::Text(pattern)).take(4));
    }
    let mut sql = STUDENT_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY first_name, last_name, id");

    let mut stmt = conn.prepare(&sql)?;
    let students: Vec<Value> = stmt
        .query_map(params_from_iter(bind), student_from_row)?
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .map(student_json)
        .collect();
    Ok(json!({ "students": students }))
}

fn students_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    Ok(json!({ "student": student_json(&load_student(conn, id)?) }))
}

fn students_create(conn: &Connection, params: &Value) -> HandlerResult {
    let mut s = StudentRecord {
        id: 0,
        first_name: String::new(),
        last_name: String::new(),
        email: String::new(),
        student_no: String::new(),
        date_of_birth: None,
        phone: None,
        address: None,
        enrollment_date: format_date(today()),
        current_level: EducationLevel::OLevel,
        current_class: None,
        stream: Stream::NotApplicable,
        index_number: None,
        academic_year: None,
        guardian_name: None,
        guardian_phone: None,
        active: true,
    };
    let mut f = Fields::new(params);
    apply_student_fields(&mut f, &mut s, true);
    f.finish()?;

    conn.execute(
        "INSERT INTO students(first_name, last_name, email, student_no, date_of_birth, phone, address,
                              enrollment_date, current_level, current_class, stream, index_number,
                              academic_year, guardian_name, guardian_phone, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &s.first_name,
            &s.last_name,
            &s.email,
            &s.student_no,
            s.date_of_birth.as_deref(),
            s.phone.as_deref(),
            s.address.as_deref(),
            &s.enrollment_date,
            s.current_level,
            s.current_class.as_deref(),
            s.stream,
            s.index_number.as_deref(),
            s.academic_year.as_deref(),
            s.guardian_name.as_deref(),
            s.guardian_phone.as_deref(),
            s.active as i64,
        ),
    )?;
    s.id = conn.last_insert_rowid();
    tracing::info!(student_id = s.id, student_no = %s.student_no, "student created");
    Ok(json!({ "student": student_json(&s) }))
}

/// A level change re-resolves the student's stored grades in the same
/// transaction.
fn students_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let tx = begin(conn)?;
    let mut s = load_student(&tx, id)?;
    let previous_level = s.current_level;
    let mut f = Fields::new(params);
    apply_student_fields(&mut f, &mut s, false);
    f.finish()?;

    tx.execute(
        "UPDATE students
         SET first_name = ?, last_name = ?, email = ?, student_no = ?, date_of_birth = ?, phone = ?,
             address = ?, enrollment_date = ?, current_level = ?, current_class = ?, stream = ?,
             index_number = ?, academic_year = ?, guardian_name = ?, guardian_phone = ?, active = ?
         WHERE id = ?",
        rusqlite::params![
            &s.first_name,
            &s.last_name,
            &s.email,
            &s.student_no,
            s.date_of_birth.as_deref(),
            s.phone.as_deref(),
            s.address.as_deref(),
            &s.enrollment_date,
            s.current_level,
            s.current_class.as_deref(),
            s.stream,
            s.index_number.as_deref(),
            s.academic_year.as_deref(),
            s.guardian_name.as_deref(),
            s.guardian_phone.as_deref(),
            s.active as i64,
            id,
        ],
    )?;
    let regraded = if s.current_level != previous_level {
        let summary = grading::recompute(&tx, None, Some(id))?;
        tracing::info!(
            student_id = id,
            from = previous_level.as_str(),
            to = s.current_level.as_str(),
            changed = summary.changed,
            "student level changed; grades re-resolved"
        );
        Some(summary)
    } else {
        None
    };
    commit(tx)?;

    Ok(json!({ "student": student_json(&s), "regraded": regraded }))
}

/// Hard delete; performances, enrollments and attendance go with it.
fn students_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let s = load_student(conn, id)?;
    let tx = begin(conn)?;
    let count = |sql: &str| -> Result<i64, AppError> {
        Ok(tx.query_row(sql, [id], |r| r.get(0))?)
    };
    let performances = count("SELECT COUNT(*) FROM student_subject_performances WHERE student_id = ?")?;
    let enrollments = count("SELECT COUNT(*) FROM course_enrollments WHERE student_id = ?")?;
    let attendance = count("SELECT COUNT(*) FROM attendance WHERE student_id = ?")?;
    tx.execute("DELETE FROM students WHERE id = ?", [id])?;
    commit(tx)?;

    tracing::info!(student_id = id, student_no = %s.student_no, performances, "student deleted");
    Ok(json!({
        "deleted": true,
        "removed": {
            "performances": performances,
            "enrollments": enrollments,
            "attendance": attendance,
        }
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "students.list" => Some(with_db(state, req, students_list)),
        "students.get" => Some(with_db(state, req, students_get)),
        "students.create" => Some(with_db(state, req, students_create)),
        "students.update" => Some(with_db(state, req, students_update)),
        "students.delete" => Some(with_db(state, req, students_delete)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn create(conn: &Connection, first: &str, last: &str, no: &str) -> i64 {
        let out = students_create(
            conn,
            &json!({
                "firstName": first,
                "lastName": last,
                "email": format!("{}@school.ug", no.to_ascii_lowercase()),
                "studentNo": no,
                "currentClass": "S3"
            }),
        )
        .expect("create");
        out["student"]["id"].as_i64().expect("id")
    }

    #[test]
    fn duplicate_student_number_is_a_constraint_violation() {
        let conn = db::open_memory();
        create(&conn, "Brian", "Okello", "S100");
        let e = students_create(
            &conn,
            &json!({ "firstName": "B", "lastName": "O", "email": "other@school.ug", "studentNo": "S100" }),
        )
        .expect_err("duplicate");
        assert_eq!(e.code(), "constraint_violation");
    }

    #[test]
    fn list_orders_by_first_then_last_name() {
        let conn = db::open_memory();
        create(&conn, "Zawadi", "Achieng", "S1");
        create(&conn, "Aisha", "Namuli", "S2");
        create(&conn, "Aisha", "Kato", "S3");
        let out = students_list(&conn, &json!({})).expect("list");
        let names: Vec<&str> = out["students"]
            .as_array()
            .expect("students")
            .iter()
            .map(|s| s["fullName"].as_str().expect("name"))
            .collect();
        assert_eq!(names, vec!["Aisha Kato", "Aisha Namuli", "Zawadi Achieng"]);
    }

    #[test]
    fn invalid_fields_are_reported_together() {
        let conn = db::open_memory();
        let e = students_create(&conn, &json!({ "firstName": "", "email": "nope", "currentLevel": "PLE" }))
            .expect_err("invalid");
        let fields = e.details().expect("details")["fields"].clone();
        for key in ["firstName", "lastName", "email", "studentNo", "currentLevel"] {
            assert!(fields.get(key).is_some(), "missing {} in {}", key, fields);
        }
    }
}

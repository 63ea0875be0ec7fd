use crate::error::AppError;
use crate::ipc::helpers::{format_date, optional_bool, required_id, today, with_db, Fields, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::model::QualificationLevel;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TeacherRecord {
    id: i64,
    first_name: String,
    last_name: String,
    email: String,
    employee_no: String,
    phone: Option<String>,
    department: Option<String>,
    specialization: Option<String>,
    hire_date: String,
    address: Option<String>,
    years_of_experience: Option<i64>,
    highest_qualification: QualificationLevel,
    license_number: Option<String>,
    active: bool,
}

const TEACHER_SELECT: &str = "SELECT id, first_name, last_name, email, employee_no, phone, department,
        specialization, hire_date, address, years_of_experience, highest_qualification,
        license_number, active
     FROM teachers";

fn teacher_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TeacherRecord> {
    Ok(TeacherRecord {
        id: r.get(0)?,
        first_name: r.get(1)?,
        last_name: r.get(2)?,
        email: r.get(3)?,
        employee_no: r.get(4)?,
        phone: r.get(5)?,
        department: r.get(6)?,
        specialization: r.get(7)?,
        hire_date: r.get(8)?,
        address: r.get(9)?,
        years_of_experience: r.get(10)?,
        highest_qualification: r.get(11)?,
        license_number: r.get(12)?,
        active: r.get::<_, i64>(13)? != 0,
    })
}

fn load_teacher(conn: &Connection, id: i64) -> Result<TeacherRecord, AppError> {
    let sql = format!("{} WHERE id = ?", TEACHER_SELECT);
    conn.query_row(&sql, [id], teacher_from_row)
        .optional()?
        .ok_or(AppError::NotFound("teacher"))
}

fn apply_teacher_fields(f: &mut Fields<'_>, t: &mut TeacherRecord, creating: bool) {
    if creating || f.present("firstName") {
        if let Some(v) = f.text("firstName", 50, true) {
            t.first_name = v;
        }
    }
    if creating || f.present("lastName") {
        if let Some(v) = f.text("lastName", 50, true) {
            t.last_name = v;
        }
    }
    if creating || f.present("email") {
        if let Some(v) = f.email("email", true) {
            t.email = v;
        }
    }
    if creating || f.present("employeeNo") {
        if let Some(v) = f.text("employeeNo", 20, true) {
            t.employee_no = v;
        }
    }
    if f.present("phone") {
        t.phone = f.text("phone", 20, false);
    }
    if f.present("department") {
        t.department = f.text("department", 100, false);
    }
    if f.present("specialization") {
        t.specialization = f.text("specialization", 100, false);
    }
    if f.present("hireDate") {
        if let Some(d) = f.date("hireDate", true) {
            t.hire_date = format_date(d);
        }
    }
    if f.present("address") {
        t.address = f.text("address", 200, false);
    }
    if f.present("yearsOfExperience") {
        t.years_of_experience = f.int("yearsOfExperience", 0, 60, false);
    }
    if f.present("highestQualification") {
        if let Some(v) = f.choice("highestQualification", QualificationLevel::parse, true) {
            t.highest_qualification = v;
        }
    }
    if f.present("licenseNumber") {
        t.license_number = f.text("licenseNumber", 50, false);
    }
    if f.present("active") {
        if let Some(v) = f.flag("active") {
            t.active = v;
        }
    }
}

fn teachers_list(conn: &Connection, params: &Value) -> HandlerResult {
    let active_only = optional_bool(params, "activeOnly")?.unwrap_or(false);
    let sql = format!(
        "{} WHERE (?1 = 0 OR active = 1) ORDER BY last_name, first_name, id",
        TEACHER_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let teachers = stmt
        .query_map([active_only as i64], teacher_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "teachers": teachers }))
}

fn teachers_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let teacher = load_teacher(conn, id)?;
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.level, ts.is_primary
         FROM teacher_subjects ts
         JOIN subjects s ON s.id = ts.subject_id
         WHERE ts.teacher_id = ? AND ts.active = 1
         ORDER BY s.level, s.name",
    )?;
    let subjects: Vec<Value> = stmt
        .query_map([id], |r| {
            Ok(json!({
                "subjectId": r.get::<_, i64>(0)?,
                "name": r.get::<_, String>(1)?,
                "level": r.get::<_, String>(2)?,
                "isPrimary": r.get::<_, i64>(3)? != 0,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let course_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM courses WHERE teacher_id = ?",
        [id],
        |r| r.get(0),
    )?;
    Ok(json!({ "teacher": teacher, "subjects": subjects, "courseCount": course_count }))
}

fn teachers_create(conn: &Connection, params: &Value) -> HandlerResult {
    let mut t = TeacherRecord {
        id: 0,
        first_name: String::new(),
        last_name: String::new(),
        email: String::new(),
        employee_no: String::new(),
        phone: None,
        department: None,
        specialization: None,
        hire_date: format_date(today()),
        address: None,
        years_of_experience: None,
        highest_qualification: QualificationLevel::BachelorsDegree,
        license_number: None,
        active: true,
    };
    let mut f = Fields::new(params);
    apply_teacher_fields(&mut f, &mut t, true);
    f.finish()?;

    conn.execute(
        "INSERT INTO teachers(first_name, last_name, email, employee_no, phone, department,
                              specialization, hire_date, address, years_of_experience,
                              highest_qualification, license_number, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &t.first_name,
            &t.last_name,
            &t.email,
            &t.employee_no,
            t.phone.as_deref(),
            t.department.as_deref(),
            t.specialization.as_deref(),
            &t.hire_date,
            t.address.as_deref(),
            t.years_of_experience,
            t.highest_qualification,
            t.license_number.as_deref(),
            t.active as i64,
        ),
    )?;
    t.id = conn.last_insert_rowid();
    Ok(json!({ "teacher": t }))
}

fn teachers_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let mut t = load_teacher(conn, id)?;
    let mut f = Fields::new(params);
    apply_teacher_fields(&mut f, &mut t, false);
    f.finish()?;

    conn.execute(
        "UPDATE teachers
         SET first_name = ?, last_name = ?, email = ?, employee_no = ?, phone = ?, department = ?,
             specialization = ?, hire_date = ?, address = ?, years_of_experience = ?,
             highest_qualification = ?, license_number = ?, active = ?
         WHERE id = ?",
        (
            &t.first_name,
            &t.last_name,
            &t.email,
            &t.employee_no,
            t.phone.as_deref(),
            t.department.as_deref(),
            t.specialization.as_deref(),
            &t.hire_date,
            t.address.as_deref(),
            t.years_of_experience,
            t.highest_qualification,
            t.license_number.as_deref(),
            t.active as i64,
            id,
        ),
    )?;
    Ok(json!({ "teacher": t }))
}

/// Blocked while the teacher still runs courses.
fn teachers_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    load_teacher(conn, id)?;
    let courses: i64 = conn.query_row(
        "SELECT COUNT(*) FROM courses WHERE teacher_id = ?",
        [id],
        |r| r.get(0),
    )?;
    if courses > 0 {
        return Err(AppError::constraint(format!(
            "teacher has {} course(s); reassign or delete them first",
            courses
        )));
    }
    conn.execute("DELETE FROM teachers WHERE id = ?", [id])?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "teachers.list" => Some(with_db(state, req, teachers_list)),
        "teachers.get" => Some(with_db(state, req, teachers_get)),
        "teachers.create" => Some(with_db(state, req, teachers_create)),
        "teachers.update" => Some(with_db(state, req, teachers_update)),
        "teachers.delete" => Some(with_db(state, req, teachers_delete)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn delete_is_blocked_by_courses() {
        let conn = db::open_memory();
        let out = teachers_create(
            &conn,
            &json!({ "firstName": "Grace", "lastName": "Auma", "email": "grace@school.ug", "employeeNo": "T01" }),
        )
        .expect("create");
        let id = out["teacher"]["id"].as_i64().expect("id");
        assert_eq!(out["teacher"]["highestQualification"], "BachelorsDegree");
        conn.execute(
            "INSERT INTO courses(code, name, teacher_id, academic_year, start_date)
             VALUES('MTH-S3', 'S3 Mathematics', ?, '2025', '2025-02-03')",
            [id],
        )
        .expect("course");

        let e = teachers_delete(&conn, &json!({ "id": id })).expect_err("guarded");
        assert_eq!(e.code(), "constraint_violation");

        conn.execute("DELETE FROM courses", []).expect("clear");
        teachers_delete(&conn, &json!({ "id": id })).expect("delete");
        assert_eq!(
            teachers_get(&conn, &json!({ "id": id })).expect_err("gone").code(),
            "not_found"
        );
    }
}

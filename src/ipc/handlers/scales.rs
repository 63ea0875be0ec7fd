use crate::error::AppError;
use crate::grading::{self, GradeBand, PartitionReport};
use crate::ipc::helpers::{begin, commit, optional_bool, optional_enum, required_id, with_db, Fields, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::model::EducationLevel;
use rusqlite::Connection;
use serde_json::{json, Value};

pub fn band_json(b: &GradeBand) -> Value {
    json!({
        "id": b.id,
        "grade": b.grade,
        "minMark": b.min_mark,
        "maxMark": b.max_mark,
        "level": b.level,
        "levelLabel": b.level.label(),
        "description": b.description,
        "gradePoint": b.grade_point,
        "isPassing": b.is_passing,
        "displayOrder": b.display_order,
        "fullDescription": b.full_description(),
    })
}

fn partition_json(r: &PartitionReport) -> Value {
    json!({
        "level": r.level,
        "bandCount": r.band_count,
        "isPartition": r.is_partition(),
        "gaps": r.gaps,
        "overlaps": r.overlaps,
    })
}

fn load_band(conn: &Connection, id: i64) -> Result<GradeBand, AppError> {
    grading::load_scale_table(conn, None)?
        .bands()
        .iter()
        .find(|b| b.id == Some(id))
        .cloned()
        .ok_or(AppError::NotFound("grade scale"))
}

fn scales_list(conn: &Connection, params: &Value) -> HandlerResult {
    let level = optional_enum(params, "level", EducationLevel::parse)?;
    let table = grading::load_scale_table(conn, level)?;
    let bands: Vec<Value> = table.bands().iter().map(band_json).collect();
    Ok(json!({ "bands": bands }))
}

fn scales_validate(conn: &Connection, params: &Value) -> HandlerResult {
    let level = optional_enum(params, "level", EducationLevel::parse)?;
    let table = grading::load_scale_table(conn, None)?;
    let levels: Vec<Value> = EducationLevel::ALL
        .iter()
        .filter(|l| level.is_none() || level == Some(**l))
        .map(|l| partition_json(&table.check_partition(*l)))
        .collect();
    Ok(json!({ "levels": levels }))
}

fn apply_band_fields(f: &mut Fields<'_>, band: &mut GradeBand, creating: bool) {
    if creating || f.present("level") {
        if let Some(v) = f.choice("level", EducationLevel::parse, true) {
            band.level = v;
        }
    }
    if creating || f.present("grade") {
        if let Some(v) = f.text("grade", 5, true) {
            band.grade = v;
        }
    }
    if creating || f.present("minMark") {
        if let Some(v) = f.int("minMark", 0, 100, true) {
            band.min_mark = v;
        }
    }
    if creating || f.present("maxMark") {
        if let Some(v) = f.int("maxMark", 0, 100, true) {
            band.max_mark = v;
        }
    }
    if creating || f.present("gradePoint") {
        if let Some(v) = f.number("gradePoint", 0.0, 9.99, true) {
            band.grade_point = grading::round_2dp(v);
        }
    }
    if f.present("isPassing") {
        if let Some(v) = f.flag("isPassing") {
            band.is_passing = v;
        }
    }
    if f.present("displayOrder") {
        if let Some(v) = f.int("displayOrder", 0, 1000, false) {
            band.display_order = v;
        }
    }
    if f.present("description") {
        band.description = f.text("description", 100, false);
    }
    if !f.has_error("minMark") && !f.has_error("maxMark") && band.min_mark > band.max_mark {
        f.error("minMark", "minMark cannot exceed maxMark");
    }
}

/// Rejects a band sharing any mark with another band of its level.
fn ensure_no_overlap(conn: &Connection, band: &GradeBand) -> Result<(), AppError> {
    let table = grading::load_scale_table(conn, Some(band.level))?;
    if let Some(other) = table.find_overlap(band.level, band.min_mark, band.max_mark, band.id) {
        return Err(AppError::constraint(format!(
            "{} band {}-{} overlaps {}",
            band.level.label(),
            band.min_mark,
            band.max_mark,
            other.full_description()
        )));
    }
    Ok(())
}

/// Deleting leaves cached grades alone unless the caller opts in.
fn maybe_recompute(conn: &Connection, params: &Value) -> Result<Option<grading::RecomputeSummary>, AppError> {
    if optional_bool(params, "recompute")?.unwrap_or(false) {
        Ok(Some(grading::recompute(conn, None, None)?))
    } else {
        Ok(None)
    }
}

/// Records at the band's level are re-resolved in the same transaction.
fn scales_create(conn: &Connection, params: &Value) -> HandlerResult {
    let mut band = GradeBand {
        id: None,
        grade: String::new(),
        min_mark: 0,
        max_mark: 0,
        level: EducationLevel::OLevel,
        description: None,
        grade_point: 0.0,
        is_passing: true,
        display_order: 0,
    };
    let mut f = Fields::new(params);
    apply_band_fields(&mut f, &mut band, true);
    f.finish()?;

    let tx = begin(conn)?;
    ensure_no_overlap(&tx, &band)?;
    tx.execute(
        "INSERT INTO grade_scales(grade, min_mark, max_mark, level, description, grade_point, is_passing, display_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &band.grade,
            band.min_mark,
            band.max_mark,
            band.level,
            band.description.as_deref(),
            band.grade_point,
            band.is_passing as i64,
            band.display_order,
        ),
    )?;
    band.id = Some(tx.last_insert_rowid());
    let recomputed = grading::recompute(&tx, Some(band.level), None)?;
    commit(tx)?;

    tracing::info!(level = band.level.as_str(), grade = %band.grade, "grade band created");
    Ok(json!({ "band": band_json(&band), "recomputed": recomputed }))
}

fn scales_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let mut band = load_band(conn, id)?;
    let previous_level = band.level;
    let mut f = Fields::new(params);
    apply_band_fields(&mut f, &mut band, false);
    f.finish()?;

    let tx = begin(conn)?;
    ensure_no_overlap(&tx, &band)?;
    tx.execute(
        "UPDATE grade_scales
         SET grade = ?, min_mark = ?, max_mark = ?, level = ?, description = ?,
             grade_point = ?, is_passing = ?, display_order = ?
         WHERE id = ?",
        (
            &band.grade,
            band.min_mark,
            band.max_mark,
            band.level,
            band.description.as_deref(),
            band.grade_point,
            band.is_passing as i64,
            band.display_order,
            id,
        ),
    )?;
    let mut recomputed = grading::recompute(&tx, Some(band.level), None)?;
    if previous_level != band.level {
        let moved_from = grading::recompute(&tx, Some(previous_level), None)?;
        recomputed.examined += moved_from.examined;
        recomputed.changed += moved_from.changed;
        recomputed.unresolved += moved_from.unresolved;
    }
    commit(tx)?;

    tracing::info!(
        level = band.level.as_str(),
        grade = %band.grade,
        changed = recomputed.changed,
        "grade band updated"
    );
    Ok(json!({ "band": band_json(&band), "recomputed": recomputed }))
}

/// References are detached (set NULL); the cached letter and point on those
/// records are left as they were unless a recompute is requested.
fn scales_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_id(params, "id")?;
    let band = load_band(conn, id)?;
    let tx = begin(conn)?;
    let detached: i64 = tx.query_row(
        "SELECT COUNT(*) FROM student_subject_performances WHERE grade_scale_id = ?",
        [id],
        |r| r.get(0),
    )?;
    tx.execute("DELETE FROM grade_scales WHERE id = ?", [id])?;
    let recomputed = maybe_recompute(&tx, params)?;
    commit(tx)?;

    tracing::info!(
        level = band.level.as_str(),
        grade = %band.grade,
        detached,
        "grade band deleted"
    );
    Ok(json!({ "deleted": true, "detachedRecords": detached, "recomputed": recomputed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "scales.list" => Some(with_db(state, req, scales_list)),
        "scales.create" => Some(with_db(state, req, scales_create)),
        "scales.update" => Some(with_db(state, req, scales_update)),
        "scales.delete" => Some(with_db(state, req, scales_delete)),
        "scales.validate" => Some(with_db(state, req, scales_validate)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn overlapping_band_is_a_constraint_violation() {
        let conn = db::open_memory();
        let e = scales_create(
            &conn,
            &json!({ "level": "OLevel", "grade": "B+", "minMark": 85, "maxMark": 89, "gradePoint": 4.5 }),
        )
        .expect_err("overlap");
        assert_eq!(e.code(), "constraint_violation");
    }

    #[test]
    fn inverted_marks_are_field_errors() {
        let conn = db::open_memory();
        let e = scales_create(
            &conn,
            &json!({ "level": "ALevel", "grade": "Z", "minMark": 60, "maxMark": 10, "gradePoint": 1 }),
        )
        .expect_err("inverted");
        assert_eq!(e.code(), "bad_params");
        assert!(e.details().expect("details")["fields"]["minMark"].is_string());
    }

    #[test]
    fn seeded_scales_validate_clean() {
        let conn = db::open_memory();
        let out = scales_validate(&conn, &json!({})).expect("validate");
        let levels = out["levels"].as_array().expect("levels");
        assert_eq!(levels.len(), 2);
        assert!(levels.iter().all(|l| l["isPartition"] == true));
    }

    #[test]
    fn narrowing_a_band_opens_a_gap() {
        let conn = db::open_memory();
        let a_id: i64 = conn
            .query_row(
                "SELECT id FROM grade_scales WHERE level = 'OLevel' AND grade = 'A'",
                [],
                |r| r.get(0),
            )
            .expect("A band");
        scales_update(&conn, &json!({ "id": a_id, "minMark": 92 })).expect("update");
        let out = scales_validate(&conn, &json!({ "level": "OLevel" })).expect("validate");
        assert_eq!(out["levels"][0]["gaps"], json!([{ "from": 90, "to": 91 }]));
    }

    fn stored_grade(conn: &Connection, id: i64) -> (Option<String>, Option<f64>) {
        conn.query_row(
            "SELECT letter_grade, grade_point FROM student_subject_performances WHERE id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("performance")
    }

    fn seed_scored_record(conn: &Connection, level: &str, score: f64) -> i64 {
        conn.execute(
            "INSERT INTO students(first_name, last_name, email, student_no, enrollment_date, current_level)
             VALUES('Amina', 'Nakato', 'amina@example.ug', 'S001', '2025-02-03', ?)",
            [level],
        )
        .expect("student");
        let student = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO subjects(name, code, level, subject_type) VALUES('Mathematics', 'MATH', ?, 'Compulsory')",
            [level],
        )
        .expect("subject");
        let subject = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO student_subject_performances(student_id, subject_id, academic_year, term,
                 assessment_type, score, submitted_at, last_modified)
             VALUES(?, ?, '2025', 'Term1', 'FinalExam', ?, '2025-03-01T00:00:00Z', '2025-03-01T00:00:00Z')",
            (student, subject, score),
        )
        .expect("performance");
        let id = conn.last_insert_rowid();
        grading::recompute(conn, None, None).expect("initial resolve");
        id
    }

    fn band_id(conn: &Connection, level: &str, grade: &str) -> i64 {
        conn.query_row(
            "SELECT id FROM grade_scales WHERE level = ? AND grade = ?",
            [level, grade],
            |r| r.get(0),
        )
        .expect("band")
    }

    #[test]
    fn band_edit_refreshes_cached_grades() {
        let conn = db::open_memory();
        let perf = seed_scored_record(&conn, "OLevel", 95.0);
        assert_eq!(stored_grade(&conn, perf), (Some("A".to_string()), Some(5.0)));

        let a_id = band_id(&conn, "OLevel", "A");
        let out = scales_update(&conn, &json!({ "id": a_id, "grade": "A*", "gradePoint": 6.0 })).expect("update");
        assert_eq!(out["recomputed"]["changed"].as_i64(), Some(1));
        assert_eq!(stored_grade(&conn, perf), (Some("A*".to_string()), Some(6.0)));
    }

    #[test]
    fn moving_a_band_to_another_level_regrades_both() {
        let conn = db::open_memory();
        let perf = seed_scored_record(&conn, "OLevel", 95.0);
        let a_id = band_id(&conn, "OLevel", "A");
        // The A-Level top band must make room first.
        let alevel_a = band_id(&conn, "ALevel", "A");
        scales_delete(&conn, &json!({ "id": alevel_a })).expect("delete");

        scales_update(&conn, &json!({ "id": a_id, "level": "ALevel" })).expect("move");
        assert_eq!(stored_grade(&conn, perf), (None, None));
    }

    #[test]
    fn new_band_resolves_previously_unresolved_scores() {
        let conn = db::open_memory();
        let perf = seed_scored_record(&conn, "OLevel", 95.0);
        let a_id = band_id(&conn, "OLevel", "A");
        scales_delete(&conn, &json!({ "id": a_id, "recompute": true })).expect("delete");
        assert_eq!(stored_grade(&conn, perf), (None, None));

        scales_create(
            &conn,
            &json!({ "level": "OLevel", "grade": "A", "minMark": 90, "maxMark": 100, "gradePoint": 5.0 }),
        )
        .expect("create");
        assert_eq!(stored_grade(&conn, perf), (Some("A".to_string()), Some(5.0)));
    }
}

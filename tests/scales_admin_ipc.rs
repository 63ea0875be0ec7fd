mod test_support;

use serde_json::json;
use test_support::{id_at, request_err, request_ok, seed_fixture, spawn_sidecar, temp_dir};

#[test]
fn builtin_scales_partition_both_levels() {
    let workspace = temp_dir("gradebookd-scales-builtin");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "2", "scales.list", json!({ "level": "OLevel" }));
    let grades: Vec<&str> = listed["bands"]
        .as_array()
        .expect("bands")
        .iter()
        .filter_map(|b| b["grade"].as_str())
        .collect();
    assert_eq!(grades, vec!["A", "B", "C", "D", "E"]);
    assert_eq!(listed["bands"][1]["fullDescription"], "B (80-89%) - Outstanding");

    let validated = request_ok(&mut stdin, &mut reader, "3", "scales.validate", json!({}));
    let levels = validated["levels"].as_array().expect("levels");
    assert_eq!(levels.len(), 2);
    for l in levels {
        assert_eq!(l["isPartition"], true, "{}", l);
    }
}

#[test]
fn overlapping_band_is_rejected_and_gaps_are_reported() {
    let workspace = temp_dir("gradebookd-scales-overlap");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "scales.create",
        json!({ "level": "OLevel", "grade": "B+", "minMark": 85, "maxMark": 89, "gradePoint": 4.5 }),
    );
    assert_eq!(code, "constraint_violation");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "scales.create",
        json!({ "level": "OLevel", "grade": "X", "minMark": 60, "maxMark": 50, "gradePoint": 1.0 }),
    );
    assert_eq!(code, "bad_params");

    let bands = request_ok(&mut stdin, &mut reader, "4", "scales.list", json!({ "level": "ALevel" }));
    let o_band = bands["bands"]
        .as_array()
        .expect("bands")
        .iter()
        .find(|b| b["grade"] == "O")
        .cloned()
        .expect("O band");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scales.update",
        json!({ "id": o_band["id"], "minMark": 32 }),
    );

    let validated = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "scales.validate",
        json!({ "level": "ALevel" }),
    );
    let report = &validated["levels"][0];
    assert_eq!(report["isPartition"], false);
    assert_eq!(report["gaps"], json!([{ "from": 30, "to": 31 }]));
    assert_eq!(report["overlaps"], json!([]));
}

#[test]
fn deleting_band_detaches_records_and_recompute_clears_them() {
    let workspace = temp_dir("gradebookd-scales-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed_fixture(&mut stdin, &mut reader);

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grading.submit",
        json!({
            "studentId": fx.student_id,
            "subjectId": fx.olevel_math,
            "assessmentType": "FinalExam",
            "score": 64
        }),
    );
    let perf_id = id_at(&out, "/record/id");
    let band_id = id_at(&out, "/record/gradeScaleId");
    assert_eq!(out["record"]["letterGrade"], "D");

    let deleted = request_ok(&mut stdin, &mut reader, "3", "scales.delete", json!({ "id": band_id }));
    assert_eq!(deleted["detachedRecords"].as_i64(), Some(1));
    assert!(deleted["recomputed"].is_null());

    // The cached letter survives the detach.
    {
        let conn = rusqlite::Connection::open(workspace.join("gradebook.sqlite3")).expect("open db");
        let (scale_id, letter): (Option<i64>, Option<String>) = conn
            .query_row(
                "SELECT grade_scale_id, letter_grade FROM student_subject_performances WHERE id = ?",
                [perf_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("row");
        assert_eq!(scale_id, None);
        assert_eq!(letter.as_deref(), Some("D"));
    }

    let summary = request_ok(&mut stdin, &mut reader, "4", "grading.recompute", json!({ "level": "OLevel" }));
    assert_eq!(summary["examined"].as_i64(), Some(1));
    assert_eq!(summary["changed"].as_i64(), Some(1));
    assert_eq!(summary["unresolved"].as_i64(), Some(1));

    let rec = request_ok(&mut stdin, &mut reader, "5", "grading.get", json!({ "id": perf_id }));
    assert!(rec["record"]["letterGrade"].is_null());
    assert_eq!(rec["record"]["summary"], "Unresolved (64.0%)");

    // Restoring the band re-resolves its level in the same request.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "scales.create",
        json!({
            "level": "OLevel",
            "grade": "D",
            "minMark": 60,
            "maxMark": 69,
            "gradePoint": 2.0,
            "displayOrder": 4
        }),
    );
    assert_eq!(created["recomputed"]["changed"].as_i64(), Some(1));
    let rec = request_ok(&mut stdin, &mut reader, "7", "grading.get", json!({ "id": perf_id }));
    assert_eq!(rec["record"]["letterGrade"], "D");
    let restored_id = id_at(&created, "/band/id");

    // Renaming the band carries through to the stored record.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "scales.update",
        json!({ "id": restored_id, "grade": "D1", "gradePoint": 2.5 }),
    );
    assert_eq!(updated["recomputed"]["changed"].as_i64(), Some(1));
    let conn = rusqlite::Connection::open(workspace.join("gradebook.sqlite3")).expect("open db");
    let (letter, point): (Option<String>, Option<f64>) = conn
        .query_row(
            "SELECT letter_grade, grade_point FROM student_subject_performances WHERE id = ?",
            [perf_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("row");
    assert_eq!(letter.as_deref(), Some("D1"));
    assert_eq!(point, Some(2.5));
}

mod test_support;

use serde_json::json;
use test_support::{id_at, request_err, request_ok, seed_fixture, spawn_sidecar, temp_dir};

#[test]
fn submitted_score_resolves_against_student_level() {
    let workspace = temp_dir("gradebookd-grading-resolve");
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
            "academicYear": "2025",
            "term": "Term1",
            "assessmentType": "FinalExam",
            "score": 85
        }),
    );
    let rec = &out["record"];
    assert_eq!(rec["letterGrade"], "B");
    assert_eq!(rec["gradePoint"].as_f64(), Some(4.0));
    assert_eq!(rec["isPassing"], true);
    assert_eq!(rec["resultStatus"], "Submitted");
    assert_eq!(rec["summary"], "B (85.0%)");
    assert_eq!(rec["rowVersion"].as_i64(), Some(1));
    let id = id_at(&out, "/record/id");

    // A submitted score is not awaiting a result.
    let dash = request_ok(&mut stdin, &mut reader, "2a", "dashboard.summary", json!({}));
    assert_eq!(dash.pointer("/counts/pendingResults").and_then(|v| v.as_i64()), Some(0));

    // Between the integer bands 80-89 and 90-100.
    let edited = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grading.edit",
        json!({ "id": id, "score": 89.5, "expectedVersion": 1 }),
    );
    assert!(edited["record"]["letterGrade"].is_null());
    assert!(edited["record"]["gradeScaleId"].is_null());
    assert_eq!(edited["record"]["isPassing"], false);
    assert_eq!(edited["record"]["summary"], "Unresolved (89.5%)");
    assert_eq!(edited["record"]["rowVersion"].as_i64(), Some(2));

    let edited = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grading.edit",
        json!({ "id": id, "score": 92 }),
    );
    assert_eq!(edited["record"]["letterGrade"], "A");
    assert_eq!(edited["record"]["gradePoint"].as_f64(), Some(5.0));

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grading.edit",
        json!({ "id": id, "score": null }),
    );
    assert!(cleared["record"]["score"].is_null());
    assert!(cleared["record"]["letterGrade"].is_null());
    assert!(cleared["record"]["gradePoint"].is_null());
    assert_eq!(cleared["record"]["summary"], "Not Assessed");

    // Same score on the A-Level scale resolves differently.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "id": fx.student_id, "currentLevel": "ALevel" }),
    );
    let alevel = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grading.submit",
        json!({
            "studentId": fx.student_id,
            "subjectId": fx.alevel_physics,
            "academicYear": "2025",
            "term": "Term1",
            "assessmentType": "MockExam",
            "score": 45
        }),
    );
    assert_eq!(alevel["record"]["letterGrade"], "E");
    assert_eq!(alevel["record"]["gradePoint"].as_f64(), Some(1.0));
    assert_eq!(alevel["record"]["isPassing"], false);
}

#[test]
fn computed_fields_and_stale_versions_are_rejected() {
    let workspace = temp_dir("gradebookd-grading-guards");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed_fixture(&mut stdin, &mut reader);

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "grading.submit",
        json!({
            "studentId": fx.student_id,
            "subjectId": fx.olevel_english,
            "assessmentType": "FinalExam",
            "score": 40,
            "letterGrade": "A"
        }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "grading.submit",
        json!({
            "studentId": fx.student_id,
            "subjectId": fx.olevel_english,
            "assessmentType": "FinalExam",
            "score": 101
        }),
    );
    assert_eq!(code, "bad_params");

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grading.submit",
        json!({
            "studentId": fx.student_id,
            "subjectId": fx.olevel_english,
            "assessmentType": "FinalExam",
            "score": 40
        }),
    );
    let id = id_at(&out, "/record/id");
    assert_eq!(out["record"]["letterGrade"], "E");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grading.setStatus",
        json!({ "id": id, "status": "Approved", "expectedVersion": 1 }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "grading.edit",
        json!({ "id": id, "score": 75, "expectedVersion": 1 }),
    );
    assert_eq!(code, "conflict");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "grading.edit",
        json!({ "id": id, "gradePoint": 5.0 }),
    );
    assert_eq!(code, "bad_params");

    let unchanged = request_ok(&mut stdin, &mut reader, "8", "grading.get", json!({ "id": id }));
    assert_eq!(unchanged["record"]["score"].as_f64(), Some(40.0));
    assert_eq!(unchanged["record"]["resultStatus"], "Approved");

    let _ = request_ok(&mut stdin, &mut reader, "9", "grading.delete", json!({ "id": id }));
    let code = request_err(&mut stdin, &mut reader, "10", "grading.get", json!({ "id": id }));
    assert_eq!(code, "not_found");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "subjects.delete",
        json!({ "id": fx.olevel_math }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "12",
        "grading.submit",
        json!({
            "studentId": fx.student_id,
            "subjectId": fx.olevel_math,
            "assessmentType": "FinalExam",
            "score": 60
        }),
    );
    assert_eq!(code, "bad_params");
}

#[test]
fn student_level_change_regrades_existing_records() {
    let workspace = temp_dir("gradebookd-grading-level-change");
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
            "academicYear": "2025",
            "term": "Term2",
            "assessmentType": "FinalExam",
            "score": 75
        }),
    );
    let id = id_at(&out, "/record/id");
    assert_eq!(out["record"]["letterGrade"], "C");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.update",
        json!({ "id": fx.student_id, "currentLevel": "ALevel" }),
    );
    assert_eq!(updated["regraded"]["changed"].as_i64(), Some(1));

    let rec = request_ok(&mut stdin, &mut reader, "4", "grading.get", json!({ "id": id }));
    assert_eq!(rec["record"]["letterGrade"], "B");
    assert_eq!(rec["record"]["gradePoint"].as_f64(), Some(4.0));

    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grading.studentOverview",
        json!({ "studentId": fx.student_id }),
    );
    assert_eq!(overview["student"]["currentLevel"], "ALevel");
    assert_eq!(overview["periods"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(overview["periods"][0]["term"], "Term2");
    assert_eq!(overview["scale"].as_array().map(|a| a.len()), Some(7));
    let subject_names: Vec<&str> = overview["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .filter_map(|s| s["name"].as_str())
        .collect();
    assert_eq!(subject_names, vec!["Physics"]);
}

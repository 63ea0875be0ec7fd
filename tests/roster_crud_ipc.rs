mod test_support;

use serde_json::json;
use test_support::{create_student, id_at, request, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn student_validation_search_and_cascading_delete() {
    let workspace = temp_dir("gradebookd-roster-students");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let invalid = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "studentNo": "STU001",
            "firstName": "",
            "lastName": "Nakato",
            "email": "not-an-email",
            "currentLevel": "PLevel"
        }),
    );
    assert_eq!(invalid.pointer("/error/code").and_then(|v| v.as_str()), Some("bad_params"));
    let fields = invalid
        .pointer("/error/details/fields")
        .and_then(|v| v.as_object())
        .expect("field errors");
    assert!(fields.contains_key("firstName"));
    assert!(fields.contains_key("email"));
    assert!(fields.contains_key("currentLevel"));
    assert!(!fields.contains_key("lastName"));

    let amina = create_student(&mut stdin, &mut reader, "3", "STU001", "Amina", "Nakato", "OLevel");
    let _ = create_student(&mut stdin, &mut reader, "4", "STU002", "Brian", "Okello", "ALevel");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({ "studentNo": "STU001", "firstName": "Again", "lastName": "Dup", "email": "other@school.ug" }),
    );
    assert_eq!(code, "constraint_violation");

    let found = request_ok(&mut stdin, &mut reader, "6", "students.list", json!({ "search": "okel" }));
    let names: Vec<&str> = found["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["fullName"].as_str())
        .collect();
    assert_eq!(names, vec!["Brian Okello"]);
    let olevel = request_ok(&mut stdin, &mut reader, "7", "students.list", json!({ "level": "OLevel" }));
    assert_eq!(olevel["students"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(olevel["students"][0]["levelLabel"], "O-Level");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.update",
        json!({ "id": amina, "guardianName": "Sarah Nakato", "stream": null }),
    );
    assert_eq!(updated["student"]["guardianName"], "Sarah Nakato");
    assert_eq!(updated["student"]["stream"], "NotApplicable");
    assert!(updated["regraded"].is_null());

    let math = test_support::create_subject(&mut stdin, &mut reader, "9", "Mathematics", "MTH", "OLevel");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grading.submit",
        json!({ "studentId": amina, "subjectId": math, "assessmentType": "Coursework", "score": 66 }),
    );
    let removed = request_ok(&mut stdin, &mut reader, "11", "students.delete", json!({ "id": amina }));
    assert_eq!(removed["removed"]["performances"].as_i64(), Some(1));
    let left = request_ok(&mut stdin, &mut reader, "12", "grading.list", json!({}));
    assert_eq!(left["records"].as_array().map(|a| a.len()), Some(0));
    let code = request_err(&mut stdin, &mut reader, "13", "students.get", json!({ "id": amina }));
    assert_eq!(code, "not_found");
}

#[test]
fn subjects_and_teacher_assignments() {
    let workspace = temp_dir("gradebookd-roster-subjects");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let physics = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Physics", "code": "phy", "level": "ALevel", "stream": "Science", "subjectType": "Elective" }),
    );
    let physics_id = id_at(&physics, "/subject/id");
    assert_eq!(physics["subject"]["code"], "PHY");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "name": "General Paper", "level": "ALevel" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({ "name": "Literature", "level": "ALevel", "stream": "Arts" }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "name": "Physics", "level": "ALevel" }),
    );
    assert_eq!(code, "constraint_violation");
    // Same name at the other level is a different subject.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        json!({ "name": "Physics", "level": "OLevel" }),
    );

    let science = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.list",
        json!({ "level": "ALevel", "stream": "Science" }),
    );
    let mut names: Vec<&str> = science["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .filter_map(|s| s["name"].as_str())
        .collect();
    names.sort();
    assert_eq!(names, vec!["General Paper", "Physics"]);

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "teachers.create",
        json!({
            "firstName": "Peter",
            "lastName": "Ssemanda",
            "email": "peter@school.ug",
            "employeeNo": "T07",
            "highestQualification": "MastersDegree"
        }),
    );
    let teacher_id = id_at(&teacher, "/teacher/id");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "subjects.assignTeacher",
        json!({
            "subjectId": physics_id,
            "teacherId": teacher_id,
            "qualificationLevel": "MastersDegree",
            "yearsOfExperience": 8,
            "isPrimary": true
        }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "subjects.assignTeacher",
        json!({ "subjectId": physics_id, "teacherId": teacher_id, "qualificationLevel": "Diploma" }),
    );
    assert_eq!(code, "constraint_violation");

    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "subjects.teachers",
        json!({ "subjectId": physics_id }),
    );
    assert_eq!(assigned["teachers"][0]["teacherName"], "Peter Ssemanda");
    assert_eq!(assigned["teachers"][0]["isPrimary"], true);

    let t = request_ok(&mut stdin, &mut reader, "12", "teachers.get", json!({ "id": teacher_id }));
    assert_eq!(t["subjects"][0]["name"], "Physics");
    assert_eq!(t["courseCount"].as_i64(), Some(0));

    let _ = request_ok(&mut stdin, &mut reader, "13", "subjects.delete", json!({ "id": physics_id }));
    let active = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "subjects.list",
        json!({ "level": "ALevel", "stream": "Science" }),
    );
    assert_eq!(active["subjects"].as_array().map(|a| a.len()), Some(1));
    let all = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "subjects.list",
        json!({ "level": "ALevel", "activeOnly": false }),
    );
    assert_eq!(all["subjects"].as_array().map(|a| a.len()), Some(3));
}

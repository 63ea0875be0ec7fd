#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn_sidecar_with_env(&[])
}

pub fn spawn_sidecar_with_env(vars: &[(&str, String)]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut cmd = Command::new(exe);
    cmd.env_remove("GRADEBOOKD_WORKSPACE")
        .env_remove("GRADEBOOKD_SCALES");
    for (k, v) in vars {
        cmd.env(k, v);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Returns the error code of a failed request.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

pub fn id_at(v: &Value, pointer: &str) -> i64 {
    v.pointer(pointer)
        .and_then(|x| x.as_i64())
        .unwrap_or_else(|| panic!("missing {} in {}", pointer, v))
}

/// Student plus one O-Level and one A-Level subject; the common starting
/// point for grading scenarios.
pub struct Fixture {
    pub student_id: i64,
    pub olevel_math: i64,
    pub olevel_english: i64,
    pub alevel_physics: i64,
}

pub fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    no: &str,
    first: &str,
    last: &str,
    level: &str,
) -> i64 {
    let out = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "studentNo": no,
            "firstName": first,
            "lastName": last,
            "email": format!("{}@school.ug", no.to_ascii_lowercase()),
            "currentLevel": level,
            "currentClass": "S3",
        }),
    );
    id_at(&out, "/student/id")
}

pub fn create_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    code: &str,
    level: &str,
) -> i64 {
    let out = request_ok(
        stdin,
        reader,
        id,
        "subjects.create",
        json!({ "name": name, "code": code, "level": level }),
    );
    id_at(&out, "/subject/id")
}

pub fn seed_fixture(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Fixture {
    let student_id = create_student(stdin, reader, "fx-1", "STU001", "Amina", "Nakato", "OLevel");
    let olevel_math = create_subject(stdin, reader, "fx-2", "Mathematics", "MTH", "OLevel");
    let olevel_english = create_subject(stdin, reader, "fx-3", "English Language", "ENG", "OLevel");
    let alevel_physics = create_subject(stdin, reader, "fx-4", "Physics", "PHY", "ALevel");
    Fixture {
        student_id,
        olevel_math,
        olevel_english,
        alevel_physics,
    }
}

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_bulletind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bulletind");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value["error"]["code"].as_str().expect("error code")
}

#[test]
fn grade_ingestion_rejects_malformed_records() {
    let workspace = temp_dir("bulletin-grade-validation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "CE1 A" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id, "lastName": "Alpha", "firstName": "Eleve" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({ "name": "Mathématiques", "code": "MATH", "coefficient": 3 }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    // A zero denominator cannot be normalized.
    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "grades.record",
        json!({
            "studentId": student_id, "subjectId": subject_id,
            "value": 5.0, "maxValue": 0.0, "kind": "devoir", "term": "trimestre1"
        }),
    );
    assert_eq!(error_code(&resp), "invalid_max_value");

    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "grades.record",
        json!({
            "studentId": student_id, "subjectId": subject_id,
            "value": 25.0, "maxValue": 20.0, "kind": "devoir", "term": "trimestre1"
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "7",
        "grades.record",
        json!({
            "studentId": student_id, "subjectId": subject_id,
            "value": 10.0, "maxValue": 20.0, "kind": "quiz", "term": "trimestre1"
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "8",
        "grades.record",
        json!({
            "studentId": student_id, "subjectId": subject_id,
            "value": 10.0, "maxValue": 20.0, "kind": "devoir", "term": "semestre1"
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "9",
        "grades.record",
        json!({
            "studentId": "nobody", "subjectId": subject_id,
            "value": 10.0, "maxValue": 20.0, "kind": "devoir", "term": "trimestre1"
        }),
    );
    assert_eq!(error_code(&resp), "not_found");

    let resp = request(
        &mut stdin,
        &mut reader,
        "10",
        "grades.record",
        json!({
            "studentId": student_id, "subjectId": "nothing",
            "value": 10.0, "maxValue": 20.0, "kind": "devoir", "term": "trimestre1"
        }),
    );
    assert_eq!(error_code(&resp), "not_found");

    // A well-formed record still lands.
    let resp = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.record",
        json!({
            "studentId": student_id, "subjectId": subject_id,
            "value": 10.0, "maxValue": 20.0, "kind": "devoir", "term": "trimestre1",
            "date": "2025-01-10"
        }),
    );
    assert!(resp["gradeId"].as_str().is_some());

    let _ = child.kill();
}

#[test]
fn subject_coefficient_must_be_positive() {
    let workspace = temp_dir("bulletin-coefficient");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    for (id, coefficient) in [("2", 0_i64), ("3", -2)] {
        let resp = request(
            &mut stdin,
            &mut reader,
            id,
            "subjects.create",
            json!({ "name": "Histoire", "code": "HIST", "coefficient": coefficient }),
        );
        assert_eq!(error_code(&resp), "bad_params");
    }

    let _ = child.kill();
}

#[test]
fn attendance_rejects_unknown_status_and_bad_dates() {
    let workspace = temp_dir("bulletin-att-validation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "CE2 A" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id, "lastName": "Alpha", "firstName": "Eleve" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.record",
        json!({ "studentId": student_id, "date": "2025-03-14", "status": "vacation" }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.record",
        json!({ "studentId": student_id, "date": "14/03/2025", "status": "present" }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.stats",
        json!({ "studentId": student_id, "window": "year" }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let _ = child.kill();
}

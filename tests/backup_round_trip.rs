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

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn workspace_bundle_round_trips_through_export_and_import() {
    let workspace_a = temp_dir("bulletin-backup-a");
    let workspace_b = temp_dir("bulletin-backup-b");
    let bundle = workspace_a.join("export").join("bundle.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace_a.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "3e B", "academicYear": "2024-2025" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id, "lastName": "Alpha", "firstName": "Eleve" }),
    );

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(export["bundleFormat"].as_str(), Some("bulletin-workspace-v1"));
    assert!(bundle.is_file());

    let import = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "backup.importWorkspaceBundle",
        json!({
            "inPath": bundle.to_string_lossy(),
            "workspacePath": workspace_b.to_string_lossy()
        }),
    );
    assert_eq!(
        import["bundleFormatDetected"].as_str(),
        Some("bulletin-workspace-v1")
    );

    // The import switched the live workspace; the roster must survive.
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.list",
        json!({ "classId": class_id }),
    );
    let rows = students["students"].as_array().expect("students");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["displayName"].as_str(), Some("Alpha, Eleve"));

    let _ = child.kill();
}

#[test]
fn grades_csv_export_writes_one_row_per_grade() {
    let workspace = temp_dir("bulletin-csv");
    let out_csv = workspace.join("export").join("grades.csv");

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
        json!({ "name": "3e A" }),
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
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.record",
        json!({
            "studentId": student_id, "subjectId": subject_id,
            "value": 14.0, "maxValue": 20.0, "kind": "composition",
            "term": "trimestre1", "date": "2025-01-22"
        }),
    );

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "exchange.exportGradesCsv",
        json!({
            "classId": class_id, "term": "trimestre1",
            "outPath": out_csv.to_string_lossy()
        }),
    );
    assert_eq!(export["rowCount"].as_u64(), Some(1));

    let text = std::fs::read_to_string(&out_csv).expect("read csv");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "student,subject,value,maxValue,kind,date");
    assert!(lines[1].contains("\"Alpha, Eleve\""));
    assert!(lines[1].contains("composition"));

    let _ = child.kill();
}

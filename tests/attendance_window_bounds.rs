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

fn db_path(workspace: &PathBuf) -> PathBuf {
    workspace.join("bulletin.sqlite3")
}

fn seed_one_student(workspace: &PathBuf) {
    use rusqlite::Connection;
    let conn = Connection::open(db_path(workspace)).expect("open db");
    conn.execute("INSERT INTO classes(id, name) VALUES('c1','CP A')", [])
        .expect("class");
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, student_no, birth_date, active, sort_order, updated_at)
         VALUES('s1', 'c1', 'Alpha', 'Eleve', NULL, NULL, 1, 0, NULL)",
        [],
    )
    .expect("student");
}

fn record(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    date: &str,
    status: &str,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "attendance.record",
        json!({ "studentId": "s1", "date": date, "status": status }),
    );
}

#[test]
fn week_window_includes_day_seven_and_drops_day_eight() {
    let workspace = temp_dir("bulletin-att-week");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_one_student(&workspace);

    record(&mut stdin, &mut reader, "2", "2025-03-08", "present");
    record(&mut stdin, &mut reader, "3", "2025-03-07", "present");
    record(&mut stdin, &mut reader, "4", "2025-03-14", "absent");
    record(&mut stdin, &mut reader, "5", "2025-03-15", "late");

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.stats",
        json!({ "studentId": "s1", "window": "week", "now": "2025-03-15" }),
    );
    // 2025-03-08 is exactly now - 7 days and stays in; 03-07 falls out.
    assert_eq!(stats["startDate"].as_str(), Some("2025-03-08"));
    assert_eq!(stats["total"].as_u64(), Some(3));
    assert_eq!(stats["present"].as_u64(), Some(1));
    assert_eq!(stats["absent"].as_u64(), Some(1));
    assert_eq!(stats["late"].as_u64(), Some(1));
    assert_eq!(stats["excused"].as_u64(), Some(0));
    assert_eq!(stats["presenceRatePercent"].as_i64(), Some(33));

    let _ = child.kill();
}

#[test]
fn month_window_subtracts_calendar_month_with_clamp() {
    let workspace = temp_dir("bulletin-att-month");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_one_student(&workspace);

    record(&mut stdin, &mut reader, "2", "2025-02-28", "present");
    record(&mut stdin, &mut reader, "3", "2025-02-27", "present");
    record(&mut stdin, &mut reader, "4", "2025-03-10", "present");

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.stats",
        json!({ "studentId": "s1", "window": "month", "now": "2025-03-31" }),
    );
    // Mar 31 minus one calendar month clamps to Feb 28.
    assert_eq!(stats["startDate"].as_str(), Some("2025-02-28"));
    assert_eq!(stats["total"].as_u64(), Some(2));
    assert_eq!(stats["present"].as_u64(), Some(2));
    assert_eq!(stats["presenceRatePercent"].as_i64(), Some(100));

    let _ = child.kill();
}

#[test]
fn rerecording_a_day_replaces_the_status() {
    let workspace = temp_dir("bulletin-att-rerecord");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_one_student(&workspace);

    record(&mut stdin, &mut reader, "2", "2025-03-14", "absent");
    record(&mut stdin, &mut reader, "3", "2025-03-14", "excused");

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.stats",
        json!({ "studentId": "s1", "window": "week", "now": "2025-03-15" }),
    );
    assert_eq!(stats["total"].as_u64(), Some(1));
    assert_eq!(stats["absent"].as_u64(), Some(0));
    assert_eq!(stats["excused"].as_u64(), Some(1));

    let records = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.list",
        json!({ "classId": "c1", "date": "2025-03-14" }),
    );
    assert_eq!(records["records"].as_array().map(|r| r.len()), Some(1));

    let _ = child.kill();
}

use crate::engine::{self, AttendanceSnapshot, AttendanceStatus, AttendanceWindow};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn parse_iso_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "date must be YYYY-MM-DD".to_string(),
        details: Some(json!({ "date": raw })),
    })
}

fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let date = parse_iso_date(&get_required_str(params, "date")?)?
        .format("%Y-%m-%d")
        .to_string();
    let status_raw = get_required_str(params, "status")?;
    let status = AttendanceStatus::parse(&status_raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "status must be one of: present, absent, late, excused".to_string(),
        details: Some(json!({ "status": status_raw })),
    })?;
    let reason = params
        .get("reason")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let recorded_by = params
        .get("recordedBy")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let class_id: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(class_id) = class_id else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };

    // One record per student and day; re-recording replaces the status.
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance WHERE student_id = ? AND date = ?",
            (&student_id, &date),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let attendance_id = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE attendance SET status = ?, reason = ?, recorded_by = ? WHERE id = ?",
                (status.as_str(), &reason, &recorded_by, &id),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "attendance" })),
            })?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO attendance(id, student_id, class_id, date, status, reason, recorded_by)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    &student_id,
                    &class_id,
                    &date,
                    status.as_str(),
                    &reason,
                    &recorded_by,
                ),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "attendance" })),
            })?;
            id
        }
    };

    Ok(json!({ "attendanceId": attendance_id }))
}

fn attendance_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = match params.get("date").and_then(|v| v.as_str()) {
        Some(raw) => Some(parse_iso_date(raw)?.format("%Y-%m-%d").to_string()),
        None => None,
    };

    let mut stmt;
    let rows = if let Some(ref d) = date {
        stmt = conn
            .prepare(
                "SELECT id, student_id, date, status, reason, recorded_by
                 FROM attendance
                 WHERE class_id = ? AND date = ?
                 ORDER BY date, student_id",
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        stmt.query_map((&class_id, d), row_to_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    } else {
        stmt = conn
            .prepare(
                "SELECT id, student_id, date, status, reason, recorded_by
                 FROM attendance
                 WHERE class_id = ?
                 ORDER BY date, student_id",
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        stmt.query_map([&class_id], row_to_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    };

    let records = rows.map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "records": records }))
}

fn row_to_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "date": r.get::<_, String>(2)?,
        "status": r.get::<_, String>(3)?,
        "reason": r.get::<_, Option<String>>(4)?,
        "recordedBy": r.get::<_, Option<String>>(5)?
    }))
}

fn attendance_stats(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let window_raw = get_required_str(params, "window")?;
    let window = AttendanceWindow::parse(&window_raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "window must be one of: week, month".to_string(),
        details: Some(json!({ "window": window_raw })),
    })?;
    let now = match params.get("now").and_then(|v| v.as_str()) {
        Some(raw) => parse_iso_date(raw)?,
        None => chrono::Local::now().date_naive(),
    };

    let exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare("SELECT date, status FROM attendance WHERE student_id = ?")
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let raw_rows = stmt
        .query_map([&student_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    // Rows that fail to parse are outside the closed status/date domain and
    // stay out of the totals.
    let records: Vec<AttendanceSnapshot> = raw_rows
        .iter()
        .filter_map(|(date, status)| {
            let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
            let status = AttendanceStatus::parse(status)?;
            Some(AttendanceSnapshot { date, status })
        })
        .collect();

    let stats = engine::attendance_stats(&records, window, now);

    Ok(json!({
        "window": window.as_str(),
        "startDate": window.start_date(now).format("%Y-%m-%d").to_string(),
        "endDate": now.format("%Y-%m-%d").to_string(),
        "total": stats.total,
        "present": stats.present,
        "absent": stats.absent,
        "late": stats.late,
        "excused": stats.excused,
        "presenceRatePercent": stats.presence_rate_percent()
    }))
}

fn with_conn(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(with_conn(state, req, attendance_record)),
        "attendance.list" => Some(with_conn(state, req, attendance_list)),
        "attendance.stats" => Some(with_conn(state, req, attendance_stats)),
        _ => None,
    }
}

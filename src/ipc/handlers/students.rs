use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
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

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, student_no, birth_date, active, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let students = stmt
        .query_map([&class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": format!("{}, {}", last, first),
                "lastName": last,
                "firstName": first,
                "studentNo": r.get::<_, Option<String>>(3)?,
                "birthDate": r.get::<_, Option<String>>(4)?,
                "active": r.get::<_, i64>(5)? != 0,
                "sortOrder": r.get::<_, i64>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "students": students }))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    if last_name.trim().is_empty() || first_name.trim().is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "lastName and firstName must not be empty".to_string(),
            details: None,
        });
    }
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }
    let student_no = params
        .get("studentNo")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let birth_date = params
        .get("birthDate")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    // Append to the class roster.
    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, student_no, birth_date, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, NULL)",
        (
            &student_id,
            &class_id,
            last_name.trim(),
            first_name.trim(),
            &student_no,
            &birth_date,
            next_sort,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({ "studentId": student_id }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
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

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    for (table, sql) in [
        ("grades", "DELETE FROM grades WHERE student_id = ?"),
        ("attendance", "DELETE FROM attendance WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ] {
        tx.execute(sql, [&student_id]).map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        })?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "deleted": true }))
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
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        _ => None,
    }
}

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

// The coefficient weights a subject's average in the general average, so a
// zero or negative value is a setup mistake, not data to store.
fn get_coefficient(params: &serde_json::Value) -> Result<i64, HandlerErr> {
    let coefficient = params
        .get("coefficient")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "coefficient must be an integer".to_string(),
            details: None,
        })?;
    if coefficient <= 0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "coefficient must be a positive integer".to_string(),
            details: Some(json!({ "coefficient": coefficient })),
        });
    }
    Ok(coefficient)
}

fn subjects_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, code, coefficient, description
             FROM subjects
             ORDER BY name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "coefficient": r.get::<_, i64>(3)?,
                "description": r.get::<_, Option<String>>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let code = get_required_str(params, "code")?;
    if name.trim().is_empty() || code.trim().is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name and code must not be empty".to_string(),
            details: None,
        });
    }
    let coefficient = get_coefficient(params)?;
    let description = params
        .get("description")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code, coefficient, description)
         VALUES(?, ?, ?, ?, ?)",
        (
            &subject_id,
            name.trim(),
            code.trim(),
            coefficient,
            &description,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "subjects" })),
    })?;

    Ok(json!({ "subjectId": subject_id }))
}

fn subjects_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let exists = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
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
            message: "subject not found".to_string(),
            details: None,
        });
    }

    if let Some(name) = params.get("name").and_then(|v| v.as_str()) {
        if name.trim().is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "name must not be empty".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE subjects SET name = ? WHERE id = ?",
            (name.trim(), &subject_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "subjects" })),
        })?;
    }
    if params.get("coefficient").is_some() {
        let coefficient = get_coefficient(params)?;
        conn.execute(
            "UPDATE subjects SET coefficient = ? WHERE id = ?",
            (coefficient, &subject_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "subjects" })),
        })?;
    }

    Ok(json!({ "updated": true }))
}

fn subjects_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let grade_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM grades WHERE subject_id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if grade_count > 0 {
        // Deleting a graded subject would orphan its grades and shift every
        // general average; require the grades to go first.
        return Err(HandlerErr {
            code: "subject_in_use",
            message: "subject has recorded grades".to_string(),
            details: Some(json!({ "gradeCount": grade_count })),
        });
    }
    let deleted = conn
        .execute("DELETE FROM subjects WHERE id = ?", [&subject_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "subjects" })),
        })?;
    if deleted == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }

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
        "subjects.list" => Some(with_conn(state, req, subjects_list)),
        "subjects.create" => Some(with_conn(state, req, subjects_create)),
        "subjects.update" => Some(with_conn(state, req, subjects_update)),
        "subjects.delete" => Some(with_conn(state, req, subjects_delete)),
        _ => None,
    }
}

use crate::engine::{GradeKind, Term};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
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

fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("{} must be a number", key),
            details: None,
        })
}

fn parse_term(params: &serde_json::Value) -> Result<Term, HandlerErr> {
    let raw = get_required_str(params, "term")?;
    Term::parse(&raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "term must be one of: trimestre1, trimestre2, trimestre3".to_string(),
        details: Some(json!({ "term": raw })),
    })
}

fn parse_kind(params: &serde_json::Value) -> Result<GradeKind, HandlerErr> {
    let raw = get_required_str(params, "kind")?;
    GradeKind::parse(&raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "kind must be one of: devoir, composition, examen".to_string(),
        details: Some(json!({ "kind": raw })),
    })
}

fn grades_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(student_id) = params.get("studentId").and_then(|v| v.as_str()) {
        clauses.push("student_id = ?");
        binds.push(student_id.to_string());
    }
    if let Some(class_id) = params.get("classId").and_then(|v| v.as_str()) {
        clauses.push("class_id = ?");
        binds.push(class_id.to_string());
    }
    if let Some(raw) = params.get("term").and_then(|v| v.as_str()) {
        let term = Term::parse(raw).ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "term must be one of: trimestre1, trimestre2, trimestre3".to_string(),
            details: Some(json!({ "term": raw })),
        })?;
        clauses.push("term = ?");
        binds.push(term.as_str().to_string());
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT id, student_id, subject_id, class_id, value, max_value, kind, date, term, teacher_id, comment
         FROM grades{}
         ORDER BY date, id",
        where_sql
    );

    let bind_values: Vec<Value> = binds.into_iter().map(Value::Text).collect();
    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let grades = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "classId": r.get::<_, String>(3)?,
                "value": r.get::<_, f64>(4)?,
                "maxValue": r.get::<_, f64>(5)?,
                "kind": r.get::<_, String>(6)?,
                "date": r.get::<_, Option<String>>(7)?,
                "term": r.get::<_, String>(8)?,
                "teacherId": r.get::<_, Option<String>>(9)?,
                "comment": r.get::<_, Option<String>>(10)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "grades": grades }))
}

fn grades_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let value = get_required_f64(params, "value")?;
    let max_value = get_required_f64(params, "maxValue")?;
    let kind = parse_kind(params)?;
    let term = parse_term(params)?;

    // The engine normalizes with value / maxValue * 20; reject anything the
    // division cannot honor instead of storing it.
    if max_value <= 0.0 {
        return Err(HandlerErr {
            code: "invalid_max_value",
            message: "maxValue must be positive".to_string(),
            details: Some(json!({ "maxValue": max_value })),
        });
    }
    if value < 0.0 || value > max_value {
        return Err(HandlerErr {
            code: "bad_params",
            message: "value must be between 0 and maxValue".to_string(),
            details: Some(json!({ "value": value, "maxValue": max_value })),
        });
    }

    let date = match params.get("date").and_then(|v| v.as_str()) {
        Some(raw) => {
            let trimmed = raw.trim();
            if NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_err() {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "date must be YYYY-MM-DD".to_string(),
                    details: Some(json!({ "date": trimmed })),
                });
            }
            Some(trimmed.to_string())
        }
        None => None,
    };
    let teacher_id = params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let comment = params
        .get("comment")
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
    let subject_exists = conn
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
    if !subject_exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }

    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, student_id, subject_id, class_id, value, max_value, kind, date, term, teacher_id, comment)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &student_id,
            &subject_id,
            &class_id,
            value,
            max_value,
            kind.as_str(),
            &date,
            term.as_str(),
            &teacher_id,
            &comment,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;

    Ok(json!({ "gradeId": grade_id }))
}

fn grades_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let deleted = conn
        .execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grades" })),
        })?;
    if deleted == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "grade not found".to_string(),
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
        "grades.list" => Some(with_conn(state, req, grades_list)),
        "grades.record" => Some(with_conn(state, req, grades_record)),
        "grades.delete" => Some(with_conn(state, req, grades_delete)),
        _ => None,
    }
}

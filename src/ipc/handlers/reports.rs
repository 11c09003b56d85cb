use crate::engine::{
    self, Appreciation, ClassmateAverage, EngineError, GradeKind, GradeSnapshot, SubjectSnapshot,
    Term, WeightedAverage,
};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn parse_term(req: &Request) -> Result<Term, serde_json::Value> {
    let raw = required_str(req, "term")?;
    Term::parse(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "term must be one of: trimestre1, trimestre2, trimestre3",
            Some(json!({ "term": raw })),
        )
    })
}

fn engine_err(req: &Request, e: EngineError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

#[derive(Debug, Clone)]
struct StudentRow {
    id: String,
    class_id: String,
    display_name: String,
}

fn load_student(conn: &Connection, student_id: &str) -> Result<Option<StudentRow>, EngineError> {
    conn.query_row(
        "SELECT id, class_id, last_name, first_name FROM students WHERE id = ?",
        [student_id],
        |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(StudentRow {
                id: r.get(0)?,
                class_id: r.get(1)?,
                display_name: format!("{}, {}", last, first),
            })
        },
    )
    .optional()
    .map_err(|e| EngineError::new("db_query_failed", e.to_string()))
}

fn load_roster(conn: &Connection, class_id: &str) -> Result<Vec<StudentRow>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, class_id, last_name, first_name
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| EngineError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([class_id], |r| {
        let last: String = r.get(2)?;
        let first: String = r.get(3)?;
        Ok(StudentRow {
            id: r.get(0)?,
            class_id: r.get(1)?,
            display_name: format!("{}, {}", last, first),
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| EngineError::new("db_query_failed", e.to_string()))
}

fn load_subjects(conn: &Connection) -> Result<Vec<SubjectSnapshot>, EngineError> {
    let mut stmt = conn
        .prepare("SELECT id, name, code, coefficient FROM subjects ORDER BY name")
        .map_err(|e| EngineError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([], |r| {
        Ok(SubjectSnapshot {
            id: r.get(0)?,
            name: r.get(1)?,
            code: r.get(2)?,
            coefficient: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| EngineError::new("db_query_failed", e.to_string()))
}

fn load_class_grades(
    conn: &Connection,
    class_id: &str,
    term: Term,
) -> Result<Vec<GradeSnapshot>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, subject_id, value, max_value, kind, date
             FROM grades
             WHERE class_id = ? AND term = ?
             ORDER BY date, id",
        )
        .map_err(|e| EngineError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map((class_id, term.as_str()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| EngineError::new("db_query_failed", e.to_string()))?;

    let mut out = Vec::with_capacity(rows.len());
    for (student_id, subject_id, value, max_value, kind_raw, date) in rows {
        let Some(kind) = GradeKind::parse(&kind_raw) else {
            return Err(EngineError::new(
                "bad_record",
                format!("grade has unknown kind {}", kind_raw),
            ));
        };
        out.push(GradeSnapshot {
            student_id,
            subject_id,
            value,
            max_value,
            kind,
            date,
            term,
        });
    }
    Ok(out)
}

/// One general average per roster member, each derived with the same
/// normalize -> subject average -> weighted mean pipeline as the target
/// student's report.
fn class_general_averages(
    roster: &[StudentRow],
    subjects: &[SubjectSnapshot],
    grades: &[GradeSnapshot],
) -> Result<Vec<ClassmateAverage>, EngineError> {
    let mut out = Vec::with_capacity(roster.len());
    for member in roster {
        let mut parts = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let subject_grades: Vec<GradeSnapshot> = grades
                .iter()
                .filter(|g| g.student_id == member.id && g.subject_id == subject.id)
                .cloned()
                .collect();
            parts.push(WeightedAverage {
                average: engine::subject_average(&subject_grades)?,
                coefficient: subject.coefficient,
            });
        }
        out.push(ClassmateAverage {
            student_id: member.id.clone(),
            general_average: engine::general_average(&parts)?,
        });
    }
    Ok(out)
}

fn handle_student_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student = match load_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return engine_err(req, e),
    };
    let subjects = match load_subjects(conn) {
        Ok(v) => v,
        Err(e) => return engine_err(req, e),
    };
    let roster = match load_roster(conn, &student.class_id) {
        Ok(v) => v,
        Err(e) => return engine_err(req, e),
    };
    let class_grades = match load_class_grades(conn, &student.class_id, term) {
        Ok(v) => v,
        Err(e) => return engine_err(req, e),
    };

    let classmates = match class_general_averages(&roster, &subjects, &class_grades) {
        Ok(v) => v,
        Err(e) => return engine_err(req, e),
    };
    let student_grades: Vec<GradeSnapshot> = class_grades
        .iter()
        .filter(|g| g.student_id == student.id)
        .cloned()
        .collect();

    let report = match engine::build_student_report(
        &student.id,
        &subjects,
        &student_grades,
        &classmates,
        term,
    ) {
        Ok(r) => r,
        Err(e) => return engine_err(req, e),
    };

    let subjects_json: Vec<serde_json::Value> = report
        .subject_averages
        .iter()
        .map(|sa| {
            let grades_json: Vec<serde_json::Value> = sa
                .source_grades
                .iter()
                .map(|g| {
                    json!({
                        "value": g.value,
                        "maxValue": g.max_value,
                        "kind": g.kind.as_str(),
                        "date": g.date
                    })
                })
                .collect();
            json!({
                "subjectId": sa.subject.id,
                "name": sa.subject.name,
                "code": sa.subject.code,
                "coefficient": sa.coefficient,
                "average": engine::round_display_2(sa.average),
                "appreciation": sa.appreciation.label(),
                "gradeCount": sa.source_grades.len(),
                "grades": grades_json
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "student": {
                "id": student.id,
                "displayName": student.display_name,
                "classId": student.class_id
            },
            "term": term.as_str(),
            "subjects": subjects_json,
            "generalAverage": engine::round_display_2(report.general_average),
            "rank": report.rank,
            "totalStudents": report.total_students,
            "appreciation": report.appreciation.label(),
            "warnings": report.warnings
        }),
    )
}

fn handle_class_ranking(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let subjects = match load_subjects(conn) {
        Ok(v) => v,
        Err(e) => return engine_err(req, e),
    };
    let roster = match load_roster(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return engine_err(req, e),
    };
    let class_grades = match load_class_grades(conn, &class_id, term) {
        Ok(v) => v,
        Err(e) => return engine_err(req, e),
    };
    let classmates = match class_general_averages(&roster, &subjects, &class_grades) {
        Ok(v) => v,
        Err(e) => return engine_err(req, e),
    };

    let averages: Vec<f64> = classmates.iter().map(|c| c.general_average).collect();
    let mut ranking: Vec<serde_json::Value> = Vec::with_capacity(roster.len());
    for (member, classmate) in roster.iter().zip(classmates.iter()) {
        let ranked = engine::rank_among(classmate.general_average, &averages);
        ranking.push(json!({
            "studentId": member.id,
            "displayName": member.display_name,
            "generalAverage": engine::round_display_2(classmate.general_average),
            "rank": ranked.rank,
            "appreciation": Appreciation::from_average(classmate.general_average).label()
        }));
    }
    ranking.sort_by(|a, b| {
        let ra = a["rank"].as_u64().unwrap_or(u64::MAX);
        let rb = b["rank"].as_u64().unwrap_or(u64::MAX);
        ra.cmp(&rb).then_with(|| {
            a["displayName"]
                .as_str()
                .unwrap_or("")
                .cmp(b["displayName"].as_str().unwrap_or(""))
        })
    });

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "term": term.as_str(),
            "totalStudents": roster.len(),
            "ranking": ranking
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentReport" => Some(handle_student_report(state, req)),
        "reports.classRanking" => Some(handle_class_ranking(state, req)),
        _ => None,
    }
}

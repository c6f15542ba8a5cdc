use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const MARKS_BULK_ENTER_MAX_EDITS: usize = 5000;

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

struct EntryTarget {
    student_id: String,
    subject_id: String,
    /// `''` for unparted subjects; matches the storage convention.
    part_key: String,
    obtained: f64,
    converted: f64,
}

/// Validates one mark entry against the exam snapshot: the student must be
/// enrolled in the exam's class, the (subject, part) pair must name a real
/// scoring unit, `obtained` must be non-negative and — when the unit has a
/// configured scale — within its full mark. Returns the storage row with the
/// advisory converted value computed from the current scale.
fn resolve_entry(
    snapshot: &calc::ExamSnapshot,
    unit_index: &HashMap<(String, String), calc::ScoringUnit>,
    params: &serde_json::Value,
) -> Result<EntryTarget, HandlerErr> {
    let student_id = params
        .get("studentId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing studentId".to_string(),
            details: None,
        })?
        .to_string();
    let subject_id = params
        .get("subjectId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing subjectId".to_string(),
            details: None,
        })?
        .to_string();
    let part_key = params
        .get("subjectPartId")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let obtained = params
        .get("obtained")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing/invalid obtained".to_string(),
            details: None,
        })?;

    if obtained < 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "negative marks are not allowed".to_string(),
            details: Some(json!({ "obtained": obtained })),
        });
    }

    if !snapshot.students.iter().any(|s| s.id == student_id) {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not enrolled in exam's class".to_string(),
            details: Some(json!({ "studentId": student_id })),
        });
    }

    let unit = unit_index
        .get(&(subject_id.clone(), part_key.clone()))
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "no such scoring unit for this exam".to_string(),
            details: Some(json!({ "subjectId": subject_id, "subjectPartId": part_key })),
        })?;

    if unit.scale.full_mark > 0.0 && obtained > unit.scale.full_mark {
        return Err(HandlerErr {
            code: "bad_params",
            message: "obtained exceeds the unit's full mark".to_string(),
            details: Some(json!({
                "obtained": obtained,
                "fullMark": unit.scale.full_mark
            })),
        });
    }

    Ok(EntryTarget {
        student_id,
        subject_id,
        part_key,
        obtained,
        converted: calc::convert_mark(obtained, &unit.scale),
    })
}

fn upsert_mark(conn: &Connection, exam_id: &str, entry: &EntryTarget) -> Result<(), HandlerErr> {
    let mark_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO marks(id, exam_id, student_id, subject_id, subject_part_id, obtained, converted, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(exam_id, student_id, subject_id, subject_part_id) DO UPDATE SET
           obtained = excluded.obtained,
           converted = excluded.converted,
           updated_at = excluded.updated_at",
        (
            &mark_id,
            exam_id,
            &entry.student_id,
            &entry.subject_id,
            &entry.part_key,
            entry.obtained,
            entry.converted,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "marks" })),
    })?;
    Ok(())
}

fn unit_index(snapshot: &calc::ExamSnapshot) -> HashMap<(String, String), calc::ScoringUnit> {
    calc::scoring_units(snapshot)
        .into_iter()
        .map(|u| {
            (
                (
                    u.subject_id.clone(),
                    u.part_id.clone().unwrap_or_default(),
                ),
                u,
            )
        })
        .collect()
}

fn handle_marks_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };

    let snapshot = match calc::load_exam_snapshot(&calc::CalcContext {
        conn,
        exam_id: &exam_id,
    }) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let units = unit_index(&snapshot);

    let entry = match resolve_entry(&snapshot, &units, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = upsert_mark(conn, &exam_id, &entry) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "ok": true, "converted": entry.converted }))
}

fn handle_marks_bulk_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let Some(entries_arr) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries[]", None);
    };

    if entries_arr.len() > MARKS_BULK_ENTER_MAX_EDITS {
        let rejected = entries_arr.len();
        return ok(
            &req.id,
            json!({
                "ok": true,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_entries",
                    "message": format!(
                        "bulk payload exceeds max entries: {} > {}",
                        rejected, MARKS_BULK_ENTER_MAX_EDITS
                    )
                }]
            }),
        );
    }

    let snapshot = match calc::load_exam_snapshot(&calc::CalcContext {
        conn,
        exam_id: &exam_id,
    }) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let units = unit_index(&snapshot);

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, raw) in entries_arr.iter().enumerate() {
        if !raw.is_object() {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("entry at index {} must be an object", i),
            }));
            continue;
        }
        let entry = match resolve_entry(&snapshot, &units, raw) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };
        match upsert_mark(conn, &exam_id, &entry) {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let rejected = errors.len();
    let result = if rejected > 0 {
        json!({ "ok": true, "updated": updated, "rejected": rejected, "errors": errors })
    } else {
        json!({ "ok": true, "updated": updated })
    };

    ok(&req.id, result)
}

fn handle_marks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let student_id = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let exam_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM exams WHERE id = ?", [&exam_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exam_exists.is_none() {
        return err(&req.id, "not_found", "exam not found", None);
    }

    let sql = match student_id {
        Some(_) => {
            "SELECT id, student_id, subject_id, subject_part_id, obtained, converted, updated_at
             FROM marks WHERE exam_id = ? AND student_id = ?
             ORDER BY student_id, subject_id, subject_part_id"
        }
        None => {
            "SELECT id, student_id, subject_id, subject_part_id, obtained, converted, updated_at
             FROM marks WHERE exam_id = ?
             ORDER BY student_id, subject_id, subject_part_id"
        }
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        let part_key: String = row.get(3)?;
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "studentId": row.get::<_, String>(1)?,
            "subjectId": row.get::<_, String>(2)?,
            "subjectPartId": if part_key.is_empty() { serde_json::Value::Null } else { json!(part_key) },
            "obtained": row.get::<_, f64>(4)?,
            "converted": row.get::<_, Option<f64>>(5)?,
            "updatedAt": row.get::<_, Option<String>>(6)?
        }))
    };

    let rows = match &student_id {
        Some(sid) => stmt
            .query_map((&exam_id, sid), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([&exam_id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };

    match rows {
        Ok(marks) => ok(&req.id, json!({ "marks": marks })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.enter" => Some(handle_marks_enter(state, req)),
        "marks.bulkEnter" => Some(handle_marks_bulk_enter(state, req)),
        "marks.list" => Some(handle_marks_list(state, req)),
        _ => None,
    }
}

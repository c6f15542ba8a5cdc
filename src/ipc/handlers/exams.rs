use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

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

/// Existence then ownership, in that order, so a missing exam reads as
/// `not_found` rather than leaking through the ownership check.
fn check_exam_owner(
    conn: &Connection,
    req: &Request,
    exam_id: &str,
    teacher_id: &str,
) -> Result<(), serde_json::Value> {
    let owner: Option<String> = conn
        .query_row("SELECT teacher_id FROM exams WHERE id = ?", [exam_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some(owner) = owner else {
        return Err(err(&req.id, "not_found", "exam not found", None));
    };
    if owner != teacher_id {
        return Err(err(
            &req.id,
            "forbidden",
            "exam belongs to another teacher",
            None,
        ));
    }
    Ok(())
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let term = req
        .params
        .get("term")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let exam_date = match req.params.get("examDate").and_then(|v| v.as_str()) {
        Some(raw) if !raw.trim().is_empty() => {
            let t = raw.trim();
            if NaiveDate::parse_from_str(t, "%Y-%m-%d").is_err() {
                return err(
                    &req.id,
                    "bad_params",
                    "examDate must be an ISO date (YYYY-MM-DD)",
                    Some(json!({ "examDate": t })),
                );
            }
            Some(t.to_string())
        }
        _ => None,
    };

    let class_row: Option<(String, String)> = match conn
        .query_row(
            "SELECT teacher_id, fiscal_year FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((class_owner, fiscal_year)) = class_row else {
        return err(&req.id, "not_found", "class not found", None);
    };
    if class_owner != teacher_id {
        return err(&req.id, "forbidden", "class belongs to another teacher", None);
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM exams WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // fiscal_year is copied from the class so the exam's session scope
    // survives later class edits.
    let exam_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO exams(id, class_id, teacher_id, name, term, fiscal_year, exam_date, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &exam_id,
            &class_id,
            &teacher_id,
            &name,
            term.as_deref(),
            &fiscal_year,
            exam_date.as_deref(),
            sort_order,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }

    ok(
        &req.id,
        json!({ "examId": exam_id, "fiscalYear": fiscal_year }),
    )
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, term, fiscal_year, exam_date, sort_order,
           (SELECT COUNT(*) FROM results r WHERE r.exam_id = exams.id) AS result_count,
           (SELECT COUNT(*) FROM results r WHERE r.exam_id = exams.id AND r.is_published = 1) AS published_count
         FROM exams
         WHERE class_id = ?
         ORDER BY sort_order, name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&class_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "term": row.get::<_, Option<String>>(2)?,
                "fiscalYear": row.get::<_, String>(3)?,
                "examDate": row.get::<_, Option<String>>(4)?,
                "sortOrder": row.get::<_, i64>(5)?,
                "resultCount": row.get::<_, i64>(6)?,
                "publishedCount": row.get::<_, i64>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(exams) => ok(&req.id, json!({ "exams": exams })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exams_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = check_exam_owner(conn, req, &exam_id, &teacher_id) {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    for (table, sql) in [
        ("marks", "DELETE FROM marks WHERE exam_id = ?"),
        ("results", "DELETE FROM results WHERE exam_id = ?"),
        (
            "exam_scale_overrides",
            "DELETE FROM exam_scale_overrides WHERE exam_id = ?",
        ),
        ("exams", "DELETE FROM exams WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&exam_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_exam_scales_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = check_exam_owner(conn, req, &exam_id, &teacher_id) {
        return e;
    }

    let subject_id = req
        .params
        .get("subjectId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let subject_part_id = req
        .params
        .get("subjectPartId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if subject_id.is_some() == subject_part_id.is_some() {
        return err(
            &req.id,
            "bad_params",
            "set exactly one of subjectId or subjectPartId",
            None,
        );
    }

    let full_mark = match req.params.get("fullMark").and_then(|v| v.as_f64()) {
        Some(v) if v >= 0.0 => v,
        _ => return err(&req.id, "bad_params", "missing/invalid fullMark", None),
    };
    let pass_mark = req
        .params
        .get("passMark")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    if pass_mark < 0.0 {
        return err(&req.id, "bad_params", "passMark must be >= 0", None);
    }
    let has_conversion = req
        .params
        .get("hasConversion")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let convert_to_mark = req.params.get("convertToMark").and_then(|v| v.as_f64());
    if has_conversion && !matches!(convert_to_mark, Some(t) if t > 0.0) {
        return err(
            &req.id,
            "bad_params",
            "hasConversion requires convertToMark > 0",
            None,
        );
    }

    // The override target must actually belong to the exam's class.
    let class_id: String = match conn.query_row(
        "SELECT class_id FROM exams WHERE id = ?",
        [&exam_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(ref sid) = subject_id {
        let in_class: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM subjects WHERE id = ? AND class_id = ?",
                (sid, &class_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if in_class.is_none() {
            return err(&req.id, "not_found", "subject not found in exam's class", None);
        }
    }
    if let Some(ref pid) = subject_part_id {
        let in_class: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM subject_parts p JOIN subjects s ON s.id = p.subject_id
                 WHERE p.id = ? AND s.class_id = ?",
                (pid, &class_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if in_class.is_none() {
            return err(&req.id, "not_found", "subject part not found in exam's class", None);
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Replace rather than upsert: at most one override per target.
    let delete_result = if let Some(ref sid) = subject_id {
        tx.execute(
            "DELETE FROM exam_scale_overrides WHERE exam_id = ? AND subject_id = ?",
            (&exam_id, sid),
        )
    } else {
        tx.execute(
            "DELETE FROM exam_scale_overrides WHERE exam_id = ? AND subject_part_id = ?",
            (&exam_id, subject_part_id.as_deref().unwrap_or("")),
        )
    };
    if let Err(e) = delete_result {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "exam_scale_overrides" })),
        );
    }

    let override_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO exam_scale_overrides(
           id, exam_id, subject_id, subject_part_id, full_mark, pass_mark, has_conversion, convert_to_mark
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &override_id,
            &exam_id,
            subject_id.as_deref(),
            subject_part_id.as_deref(),
            full_mark,
            pass_mark,
            if has_conversion { 1 } else { 0 },
            convert_to_mark,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exam_scale_overrides" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "overrideId": override_id }))
}

fn handle_exam_scales_clear(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = check_exam_owner(conn, req, &exam_id, &teacher_id) {
        return e;
    }

    let subject_id = req.params.get("subjectId").and_then(|v| v.as_str());
    let subject_part_id = req.params.get("subjectPartId").and_then(|v| v.as_str());

    let cleared = match (subject_id, subject_part_id) {
        (Some(sid), None) => conn.execute(
            "DELETE FROM exam_scale_overrides WHERE exam_id = ? AND subject_id = ?",
            (&exam_id, sid),
        ),
        (None, Some(pid)) => conn.execute(
            "DELETE FROM exam_scale_overrides WHERE exam_id = ? AND subject_part_id = ?",
            (&exam_id, pid),
        ),
        // No target clears every override of the exam.
        (None, None) => conn.execute(
            "DELETE FROM exam_scale_overrides WHERE exam_id = ?",
            [&exam_id],
        ),
        (Some(_), Some(_)) => {
            return err(
                &req.id,
                "bad_params",
                "set at most one of subjectId or subjectPartId",
                None,
            )
        }
    };

    match cleared {
        Ok(n) => ok(&req.id, json!({ "cleared": n })),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "exam_scale_overrides" })),
        ),
    }
}

/// Lists the effective scale for every scoring unit of the exam, with the
/// resolution source tagged so UIs can show where a scale came from.
fn handle_exam_scales_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let snapshot = match calc::load_exam_snapshot(&calc::CalcContext {
        conn,
        exam_id: &exam_id,
    }) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let units: Vec<serde_json::Value> = calc::scoring_units(&snapshot)
        .into_iter()
        .map(|u| {
            json!({
                "subjectId": u.subject_id,
                "subjectName": u.subject_name,
                "partId": u.part_id,
                "partName": u.part_name,
                "partType": u.part_type,
                "scale": u.scale,
                "targetMark": u.scale.target_mark()
            })
        })
        .collect();

    ok(&req.id, json!({ "units": units }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.list" => Some(handle_exams_list(state, req)),
        "exams.delete" => Some(handle_exams_delete(state, req)),
        "examScales.set" => Some(handle_exam_scales_set(state, req)),
        "examScales.clear" => Some(handle_exam_scales_clear(state, req)),
        "examScales.list" => Some(handle_exam_scales_list(state, req)),
        _ => None,
    }
}

use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
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

fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

/// Materialized-view refresh for one exam: load a snapshot, run the engine,
/// and rewrite the whole result set in one transaction. Publish metadata
/// (`is_published`, `share_token`) is never touched here, and rows of
/// students no longer enrolled are dropped.
fn handle_results_recompute(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let snapshot = match calc::load_exam_snapshot(&calc::CalcContext {
        conn,
        exam_id: &exam_id,
    }) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    if snapshot.exam.teacher_id != teacher_id {
        return err(&req.id, "forbidden", "exam belongs to another teacher", None);
    }

    let rows = calc::compute_exam_results(&snapshot);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    for row in &rows {
        let result_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO results(
               id, exam_id, student_id, class_id, section, fiscal_year, term,
               total, max_total, percentage, grade, division, rank,
               is_published, share_token, computed_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL,
                      strftime('%Y-%m-%dT%H:%M:%SZ','now'))
             ON CONFLICT(exam_id, student_id) DO UPDATE SET
               class_id = excluded.class_id,
               section = excluded.section,
               fiscal_year = excluded.fiscal_year,
               term = excluded.term,
               total = excluded.total,
               max_total = excluded.max_total,
               percentage = excluded.percentage,
               grade = excluded.grade,
               division = excluded.division,
               rank = excluded.rank,
               computed_at = excluded.computed_at",
            (
                &result_id,
                &exam_id,
                &row.student_id,
                &snapshot.exam.class_id,
                snapshot.exam.section.as_deref(),
                &snapshot.exam.fiscal_year,
                snapshot.exam.term.as_deref(),
                row.total,
                row.max_total,
                row.percentage,
                row.grade,
                row.division,
                row.rank,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "results" })),
            );
        }
    }

    // The result set mirrors current enrollment.
    if let Err(e) = tx.execute(
        "DELETE FROM results
         WHERE exam_id = ?
           AND student_id NOT IN (
             SELECT id FROM students WHERE class_id = ? AND active = 1
           )",
        (&exam_id, &snapshot.exam.class_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "results" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "computed": rows.len() }))
}

fn handle_results_set_published(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(publish) = req.params.get("publish").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing/invalid publish", None);
    };

    let owner: Option<String> = match conn
        .query_row("SELECT teacher_id FROM exams WHERE id = ?", [&exam_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(owner) = owner else {
        return err(&req.id, "not_found", "exam not found", None);
    };
    if owner != teacher_id {
        return err(&req.id, "forbidden", "exam belongs to another teacher", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let updated = if publish {
        // Fresh tokens only for rows that never had one; existing tokens
        // survive publish/unpublish cycles so distributed links keep working.
        let missing: Result<Vec<String>, _> = tx
            .prepare("SELECT id FROM results WHERE exam_id = ? AND share_token IS NULL")
            .and_then(|mut stmt| {
                stmt.query_map([&exam_id], |r| r.get::<_, String>(0))
                    .and_then(|it| it.collect())
            });
        let missing = match missing {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        for result_id in &missing {
            let token = Uuid::new_v4().to_string();
            if let Err(e) = tx.execute(
                "UPDATE results SET share_token = ? WHERE id = ?",
                (&token, result_id),
            ) {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_update_failed",
                    e.to_string(),
                    Some(json!({ "table": "results" })),
                );
            }
        }
        tx.execute(
            "UPDATE results SET is_published = 1 WHERE exam_id = ?",
            [&exam_id],
        )
    } else {
        tx.execute(
            "UPDATE results SET is_published = 0 WHERE exam_id = ?",
            [&exam_id],
        )
    };

    let updated = match updated {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "results" })),
            );
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "published": publish, "rows": updated }))
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };

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

    let mut stmt = match conn.prepare(
        "SELECT r.student_id, s.roll_no, s.last_name, s.first_name,
                r.total, r.max_total, r.percentage, r.grade, r.division, r.rank,
                r.is_published, r.share_token, r.computed_at
         FROM results r
         JOIN students s ON s.id = r.student_id
         WHERE r.exam_id = ?
         ORDER BY r.rank, s.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&exam_id], |row| {
            let last_name: String = row.get(2)?;
            let first_name: String = row.get(3)?;
            Ok(json!({
                "studentId": row.get::<_, String>(0)?,
                "rollNo": row.get::<_, Option<i64>>(1)?,
                "studentName": format!("{}, {}", last_name, first_name),
                "total": row.get::<_, f64>(4)?,
                "maxTotal": row.get::<_, f64>(5)?,
                "percentage": row.get::<_, f64>(6)?,
                "grade": row.get::<_, String>(7)?,
                "division": row.get::<_, String>(8)?,
                "rank": row.get::<_, i64>(9)?,
                "isPublished": row.get::<_, i64>(10)? != 0,
                "shareToken": row.get::<_, Option<String>>(11)?,
                "computedAt": row.get::<_, Option<String>>(12)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_results_student_session(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let fiscal_year = match required_str(req, "fiscalYear") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_exists.is_none() {
        return err(&req.id, "not_found", "student not found in class", None);
    }

    match calc::compute_session_summary(conn, &student_id, &class_id, &fiscal_year) {
        Ok(summary) => match serde_json::to_value(&summary) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "calc_failed", e.to_string(), None),
        },
        Err(e) => calc_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.recompute" => Some(handle_results_recompute(state, req)),
        "results.setPublished" => Some(handle_results_set_published(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        "results.studentSession" => Some(handle_results_student_session(state, req)),
        _ => None,
    }
}

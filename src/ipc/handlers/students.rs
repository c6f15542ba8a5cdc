use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// Dates arrive as ISO `YYYY-MM-DD`; anything else is rejected at entry so
/// the public verification gate never has to guess at stored formats.
fn validate_dob(raw: &str) -> Result<String, serde_json::Value> {
    let t = raw.trim();
    match NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        Ok(_) => Ok(t.to_string()),
        Err(_) => Err(json!({ "dob": t })),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, roll_no, last_name, first_name, dob, active, sort_order
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order, roll_no",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&class_id], |row| {
            let id: String = row.get(0)?;
            let roll_no: Option<i64> = row.get(1)?;
            let last_name: String = row.get(2)?;
            let first_name: String = row.get(3)?;
            let dob: Option<String> = row.get(4)?;
            let active: i64 = row.get(5)?;
            let sort_order: i64 = row.get(6)?;

            let display_name = format!("{}, {}", last_name, first_name);
            Ok(json!({
                "id": id,
                "rollNo": roll_no,
                "lastName": last_name,
                "firstName": first_name,
                "displayName": display_name,
                "dob": dob,
                "active": active != 0,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing lastName", None),
    };
    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing firstName", None),
    };
    if last_name.is_empty() || first_name.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "firstName/lastName must not be empty",
            None,
        );
    }

    let roll_no = req.params.get("rollNo").and_then(|v| v.as_i64());
    let dob = match req.params.get("dob").and_then(|v| v.as_str()) {
        Some(raw) if !raw.trim().is_empty() => match validate_dob(raw) {
            Ok(d) => Some(d),
            Err(details) => {
                return err(
                    &req.id,
                    "bad_params",
                    "dob must be an ISO date (YYYY-MM-DD)",
                    Some(details),
                )
            }
        },
        _ => None,
    };
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

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

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(
           id, class_id, roll_no, last_name, first_name, dob, active, sort_order, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &student_id,
            &class_id,
            roll_no,
            &last_name,
            &first_name,
            dob.as_deref(),
            if active { 1 } else { 0 },
            sort_order,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("lastName") {
        let Some(s) = v.as_str().map(|s| s.trim()).filter(|s| !s.is_empty()) else {
            return err(
                &req.id,
                "bad_params",
                "patch.lastName must be a non-empty string",
                None,
            );
        };
        set_parts.push("last_name = ?".into());
        bind_values.push(Value::Text(s.to_string()));
    }
    if let Some(v) = patch.get("firstName") {
        let Some(s) = v.as_str().map(|s| s.trim()).filter(|s| !s.is_empty()) else {
            return err(
                &req.id,
                "bad_params",
                "patch.firstName must be a non-empty string",
                None,
            );
        };
        set_parts.push("first_name = ?".into());
        bind_values.push(Value::Text(s.to_string()));
    }
    if let Some(v) = patch.get("rollNo") {
        if v.is_null() {
            set_parts.push("roll_no = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(n) = v.as_i64() {
            set_parts.push("roll_no = ?".into());
            bind_values.push(Value::Integer(n));
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.rollNo must be an integer or null",
                None,
            );
        }
    }
    if let Some(v) = patch.get("dob") {
        if v.is_null() {
            set_parts.push("dob = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(raw) = v.as_str() {
            match validate_dob(raw) {
                Ok(d) => {
                    set_parts.push("dob = ?".into());
                    bind_values.push(Value::Text(d));
                }
                Err(details) => {
                    return err(
                        &req.id,
                        "bad_params",
                        "patch.dob must be an ISO date (YYYY-MM-DD)",
                        Some(details),
                    )
                }
            }
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.dob must be a string or null",
                None,
            );
        }
    }
    if let Some(v) = patch.get("active") {
        let Some(b) = v.as_bool() else {
            return err(&req.id, "bad_params", "patch.active must be a boolean", None);
        };
        set_parts.push("active = ?".into());
        bind_values.push(Value::Integer(if b { 1 } else { 0 }));
    }

    if set_parts.is_empty() {
        return err(&req.id, "bad_params", "patch has no recognized fields", None);
    }

    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());
    bind_values.push(Value::Text(student_id.clone()));
    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));

    match conn.execute(&sql, rusqlite::params_from_iter(bind_values)) {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        ),
    }
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute("DELETE FROM marks WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "marks" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM results WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "results" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}

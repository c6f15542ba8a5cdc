use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

struct ScaleParams {
    full_mark: f64,
    pass_mark: f64,
    has_conversion: bool,
    convert_to_mark: Option<f64>,
}

/// Shared parsing for the default scale carried by a subject or part.
/// A zero full mark is allowed here (it reads as "not configured"), but
/// negative values and a non-positive conversion target are not.
fn parse_scale(obj: &serde_json::Value, defaults: ScaleParams) -> Result<ScaleParams, String> {
    let full_mark = obj
        .get("fullMark")
        .and_then(|v| v.as_f64())
        .unwrap_or(defaults.full_mark);
    let pass_mark = obj
        .get("passMark")
        .and_then(|v| v.as_f64())
        .unwrap_or(defaults.pass_mark);
    let has_conversion = obj
        .get("hasConversion")
        .and_then(|v| v.as_bool())
        .unwrap_or(defaults.has_conversion);
    let convert_to_mark = obj.get("convertToMark").and_then(|v| v.as_f64());

    if full_mark < 0.0 || pass_mark < 0.0 {
        return Err("fullMark/passMark must be >= 0".to_string());
    }
    if has_conversion {
        match convert_to_mark {
            Some(t) if t > 0.0 => {}
            _ => return Err("hasConversion requires convertToMark > 0".to_string()),
        }
    }
    Ok(ScaleParams {
        full_mark,
        pass_mark,
        has_conversion,
        convert_to_mark,
    })
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let code = req
        .params
        .get("code")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let scale = match parse_scale(
        &req.params,
        ScaleParams {
            full_mark: 100.0,
            pass_mark: 40.0,
            has_conversion: false,
            convert_to_mark: None,
        },
    ) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    // Parts are optional; each carries its own default scale. Part defaults
    // start from zero so an unconfigured part never inflates max totals.
    let mut parts: Vec<(String, Option<String>, ScaleParams)> = Vec::new();
    if let Some(parts_arr) = req.params.get("parts").and_then(|v| v.as_array()) {
        for (i, part) in parts_arr.iter().enumerate() {
            let Some(part_name) = part
                .get("name")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
            else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("parts[{}] missing name", i),
                    None,
                );
            };
            let part_type = part
                .get("partType")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let part_scale = match parse_scale(
                part,
                ScaleParams {
                    full_mark: 0.0,
                    pass_mark: 0.0,
                    has_conversion: false,
                    convert_to_mark: None,
                },
            ) {
                Ok(v) => v,
                Err(msg) => {
                    return err(&req.id, "bad_params", format!("parts[{}]: {}", i, msg), None)
                }
            };
            parts.push((part_name, part_type, part_scale));
        }
    }

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
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subjects WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO subjects(
           id, class_id, name, code, full_mark, pass_mark, has_conversion, convert_to_mark, sort_order
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            &class_id,
            &name,
            code.as_deref(),
            scale.full_mark,
            scale.pass_mark,
            if scale.has_conversion { 1 } else { 0 },
            scale.convert_to_mark,
            sort_order,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    let mut part_ids: Vec<serde_json::Value> = Vec::with_capacity(parts.len());
    for (i, (part_name, part_type, part_scale)) in parts.into_iter().enumerate() {
        let part_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO subject_parts(
               id, subject_id, name, part_type, full_mark, pass_mark, has_conversion, convert_to_mark, sort_order
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &part_id,
                &subject_id,
                &part_name,
                part_type.as_deref(),
                part_scale.full_mark,
                part_scale.pass_mark,
                if part_scale.has_conversion { 1 } else { 0 },
                part_scale.convert_to_mark,
                i as i64,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "subject_parts" })),
            );
        }
        part_ids.push(json!({ "partId": part_id, "name": part_name }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "subjectId": subject_id, "parts": part_ids }),
    )
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, code, full_mark, pass_mark, has_conversion, convert_to_mark, sort_order
         FROM subjects
         WHERE class_id = ?
         ORDER BY sort_order, name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let subjects = match stmt
        .query_map([&class_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<f64>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut parts_stmt = match conn.prepare(
        "SELECT p.id, p.subject_id, p.name, p.part_type, p.full_mark, p.pass_mark,
                p.has_conversion, p.convert_to_mark, p.sort_order
         FROM subject_parts p
         JOIN subjects s ON s.id = p.subject_id
         WHERE s.class_id = ?
         ORDER BY p.sort_order, p.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let parts = match parts_stmt
        .query_map([&class_id], |row| {
            Ok((
                row.get::<_, String>(1)?,
                json!({
                    "id": row.get::<_, String>(0)?,
                    "name": row.get::<_, String>(2)?,
                    "partType": row.get::<_, Option<String>>(3)?,
                    "fullMark": row.get::<_, f64>(4)?,
                    "passMark": row.get::<_, f64>(5)?,
                    "hasConversion": row.get::<_, i64>(6)? != 0,
                    "convertToMark": row.get::<_, Option<f64>>(7)?,
                    "sortOrder": row.get::<_, i64>(8)?
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let listed: Vec<serde_json::Value> = subjects
        .into_iter()
        .map(
            |(id, name, code, full_mark, pass_mark, has_conversion, convert_to_mark, sort_order)| {
                let subject_parts: Vec<&serde_json::Value> = parts
                    .iter()
                    .filter(|(subject_id, _)| subject_id == &id)
                    .map(|(_, part)| part)
                    .collect();
                json!({
                    "id": id,
                    "name": name,
                    "code": code,
                    "fullMark": full_mark,
                    "passMark": pass_mark,
                    "hasConversion": has_conversion != 0,
                    "convertToMark": convert_to_mark,
                    "sortOrder": sort_order,
                    "parts": subject_parts
                })
            },
        )
        .collect();

    ok(&req.id, json!({ "subjects": listed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        _ => None,
    }
}

use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;

/// Calendar date only: `2010-05-12`, `2010-05-12T00:00:00Z`, and
/// `2010-05-12 08:30` all read as the same day.
fn parse_calendar_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    let date_part = t
        .split(['T', ' '])
        .next()
        .unwrap_or(t);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Every failure case (unknown token, unpublished result, missing stored
/// dob, dob mismatch) produces this exact payload so the response never
/// reveals whether a token exists.
fn not_verified(id: &str) -> serde_json::Value {
    ok(id, json!({ "verified": false }))
}

fn handle_public_verify_result(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let share_token = match req.params.get("shareToken").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing shareToken", None),
    };
    let dob_input = match req.params.get("dateOfBirth").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing dateOfBirth", None),
    };

    let row: Option<(String, String, String, String, Option<String>)> = match conn
        .query_row(
            "SELECT r.exam_id, r.student_id, r.class_id, r.fiscal_year, s.dob
             FROM results r
             JOIN students s ON s.id = r.student_id
             WHERE r.share_token = ? AND r.is_published = 1",
            [&share_token],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((exam_id, student_id, class_id, fiscal_year, stored_dob)) = row else {
        return not_verified(&req.id);
    };

    let Some(stored) = stored_dob.as_deref().and_then(parse_calendar_date) else {
        return not_verified(&req.id);
    };
    let Some(given) = parse_calendar_date(&dob_input) else {
        return not_verified(&req.id);
    };
    if stored != given {
        return not_verified(&req.id);
    }

    let summary = match calc::compute_session_summary(conn, &student_id, &class_id, &fiscal_year) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let student: Option<(Option<i64>, String, String)> = match conn
        .query_row(
            "SELECT roll_no, last_name, first_name FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((roll_no, last_name, first_name)) = student else {
        return not_verified(&req.id);
    };

    let class_row: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT name, section FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (class_name, section) = class_row.unwrap_or((String::new(), None));

    let exam: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT name, term FROM exams WHERE id = ?",
            [&exam_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (exam_name, term) = exam.unwrap_or((String::new(), None));

    let school = match db::settings_get_json(conn, "school.profile") {
        Ok(v) => v.unwrap_or_else(|| json!({})),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "verified": true,
            "student": {
                "name": format!("{} {}", first_name, last_name),
                "rollNo": roll_no,
                "className": class_name,
                "section": section,
                "fiscalYear": fiscal_year
            },
            "school": school,
            "exam": {
                "name": exam_name,
                "term": term,
                "fiscalYear": fiscal_year
            },
            "items": summary.items,
            "grandTotal": summary.grand_total,
            "avgPercent": summary.avg_percent,
            "subjects": summary.subjects,
            "subjectTotals": summary.subject_totals
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "public.verifyResult" => Some(handle_public_verify_result(state, req)),
        _ => None,
    }
}

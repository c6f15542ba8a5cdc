use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

const SCHOOL_PROFILE_KEY: &str = "school.profile";

fn handle_school_get_profile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    match db::settings_get_json(conn, SCHOOL_PROFILE_KEY) {
        Ok(profile) => ok(
            &req.id,
            json!({ "profile": profile.unwrap_or_else(|| json!({})) }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_school_set_profile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(profile) = req.params.get("profile").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "missing/invalid profile", None);
    };

    match db::settings_set_json(conn, SCHOOL_PROFILE_KEY, profile) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "school.getProfile" => Some(handle_school_get_profile(state, req)),
        "school.setProfile" => Some(handle_school_set_profile(state, req)),
        _ => None,
    }
}

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            tracing::info!(workspace = %path.display(), "workspace opened");
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

const SETTING_KEYS: &[(&str, &str)] = &[
    ("defaultAbsentPolicy", "default_absent_policy"),
    ("defaultRoundingPolicy", "default_rounding_policy"),
    ("passingThreshold", "passing_threshold"),
];

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match crate::ipc::helpers::db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut out = serde_json::Map::new();
    for (wire, key) in SETTING_KEYS {
        let value = match db::settings_get(conn, key) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        out.insert((*wire).to_string(), json!(value));
    }
    ok(&req.id, serde_json::Value::Object(out))
}

/// Workspace defaults used when an evaluation or a results request does
/// not carry its own policy/threshold.
fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match crate::ipc::helpers::db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    for (field, value) in patch {
        let Some((_, key)) = SETTING_KEYS.iter().find(|(wire, _)| *wire == field.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                format!("unknown setting: {field}"),
                None,
            );
        };
        let Some(raw) = value.as_str() else {
            return err(
                &req.id,
                "bad_params",
                format!("{field} must be a string"),
                None,
            );
        };
        let valid = match *key {
            "default_absent_policy" => crate::engine::AbsentPolicy::parse(raw).is_some(),
            "default_rounding_policy" => crate::engine::RoundingPolicy::parse(raw).is_some(),
            "passing_threshold" => raw.parse::<crate::decimal::Decimal>().is_ok(),
            _ => false,
        };
        if !valid {
            return err(
                &req.id,
                "bad_params",
                format!("invalid value for {field}: {raw}"),
                None,
            );
        }
        if let Err(e) = db::settings_set(conn, key, raw) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }
    ok(&req.id, json!({ "updated": patch.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}

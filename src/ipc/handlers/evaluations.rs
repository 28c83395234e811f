use crate::db;
use crate::decimal::Decimal;
use crate::engine::{AbsentPolicy, RoundingPolicy};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_decimal, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

fn validated_date(req: &Request, raw: Option<String>) -> Result<Option<String>, serde_json::Value> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        Ok(_) => Ok(Some(raw)),
        Err(_) => Err(err(
            &req.id,
            "bad_params",
            "date must be YYYY-MM-DD",
            Some(json!({ "date": raw })),
        )),
    }
}

fn parse_absent_policy(req: &Request, raw: &str) -> Result<AbsentPolicy, serde_json::Value> {
    AbsentPolicy::parse(raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("unknown absent policy: {raw}"),
            None,
        )
    })
}

fn parse_rounding_policy(req: &Request, raw: &str) -> Result<RoundingPolicy, serde_json::Value> {
    RoundingPolicy::parse(raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("unknown rounding policy: {raw}"),
            None,
        )
    })
}

fn handle_evaluations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date = match validated_date(req, optional_str(req, "date")) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let coefficient = match optional_decimal(req, "coefficient") {
        Ok(v) => v.unwrap_or(Decimal::ONE),
        Err(e) => return e,
    };
    let max_score = match optional_decimal(req, "maxScore") {
        Ok(Some(v)) => v,
        Ok(None) => Decimal::from_int(20),
        Err(e) => return e,
    };
    if max_score <= Decimal::ZERO {
        return err(&req.id, "bad_params", "maxScore must be positive", None);
    }

    // Per-evaluation policies fall back to the workspace defaults.
    let absent_policy = match optional_str(req, "absentPolicy") {
        Some(raw) => match parse_absent_policy(req, &raw) {
            Ok(v) => v,
            Err(e) => return e,
        },
        None => db::settings_get(conn, "default_absent_policy")
            .ok()
            .flatten()
            .and_then(|raw| AbsentPolicy::parse(&raw))
            .unwrap_or_default(),
    };
    let rounding_policy = match optional_str(req, "roundingPolicy") {
        Some(raw) => match parse_rounding_policy(req, &raw) {
            Ok(v) => v,
            Err(e) => return e,
        },
        None => db::settings_get(conn, "default_rounding_policy")
            .ok()
            .flatten()
            .and_then(|raw| RoundingPolicy::parse(&raw))
            .unwrap_or_default(),
    };

    let evaluation_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO evaluations(id, class_id, name, date, coefficient, max_score,
                                 absent_policy, rounding_policy, dirty)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &evaluation_id,
            &class_id,
            &name,
            &date,
            coefficient.to_string(),
            max_score.to_string(),
            absent_policy.as_str(),
            rounding_policy.as_str(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "evaluationId": evaluation_id }))
}

fn handle_evaluations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, date, coefficient, max_score, absent_policy, rounding_policy, dirty
         FROM evaluations
         WHERE class_id = ?
         ORDER BY date, name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt.query_map([&class_id], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "date": r.get::<_, Option<String>>(2)?,
            "coefficient": r.get::<_, String>(3)?,
            "maxScore": r.get::<_, String>(4)?,
            "absentPolicy": r.get::<_, String>(5)?,
            "roundingPolicy": r.get::<_, String>(6)?,
            "dirty": r.get::<_, i64>(7)? != 0,
        }))
    });
    let evaluations: Vec<serde_json::Value> = match rows.and_then(|it| it.collect()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "evaluations": evaluations }))
}

/// Patches evaluation fields. Any change invalidates the cached averages
/// in the same transaction scope as the write.
fn handle_evaluations_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let exists: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM evaluations WHERE id = ?",
        [&evaluation_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists == 0 {
        return err(&req.id, "not_found", "evaluation not found", None);
    }

    for (key, value) in patch {
        let result = match key.as_str() {
            "name" => match value.as_str() {
                Some(v) => conn.execute(
                    "UPDATE evaluations SET name = ? WHERE id = ?",
                    (v, &evaluation_id),
                ),
                None => return err(&req.id, "bad_params", "name must be a string", None),
            },
            "date" => {
                let date = match validated_date(req, value.as_str().map(|s| s.to_string())) {
                    Ok(v) => v,
                    Err(e) => return e,
                };
                conn.execute(
                    "UPDATE evaluations SET date = ? WHERE id = ?",
                    (date, &evaluation_id),
                )
            }
            "coefficient" | "maxScore" => {
                let parsed = match crate::ipc::helpers::parse_decimal_value(value) {
                    Ok(v) => v,
                    Err(()) => {
                        return err(
                            &req.id,
                            "bad_params",
                            format!("{key} must be a decimal number"),
                            None,
                        )
                    }
                };
                if key == "maxScore" && parsed <= Decimal::ZERO {
                    return err(&req.id, "bad_params", "maxScore must be positive", None);
                }
                let column = if key == "maxScore" {
                    "max_score"
                } else {
                    "coefficient"
                };
                conn.execute(
                    &format!("UPDATE evaluations SET {column} = ? WHERE id = ?"),
                    (parsed.to_string(), &evaluation_id),
                )
            }
            "absentPolicy" => {
                let Some(raw) = value.as_str() else {
                    return err(&req.id, "bad_params", "absentPolicy must be a string", None);
                };
                let policy = match parse_absent_policy(req, raw) {
                    Ok(v) => v,
                    Err(e) => return e,
                };
                conn.execute(
                    "UPDATE evaluations SET absent_policy = ? WHERE id = ?",
                    (policy.as_str(), &evaluation_id),
                )
            }
            "roundingPolicy" => {
                let Some(raw) = value.as_str() else {
                    return err(
                        &req.id,
                        "bad_params",
                        "roundingPolicy must be a string",
                        None,
                    );
                };
                let policy = match parse_rounding_policy(req, raw) {
                    Ok(v) => v,
                    Err(e) => return e,
                };
                conn.execute(
                    "UPDATE evaluations SET rounding_policy = ? WHERE id = ?",
                    (policy.as_str(), &evaluation_id),
                )
            }
            other => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown patch field: {other}"),
                    None,
                )
            }
        };
        if let Err(e) = result {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }

    if let Err(e) = crate::store::mark_evaluation_dirty(conn, &evaluation_id) {
        return err(&req.id, &e.code, e.message, e.details);
    }
    ok(&req.id, json!({ "evaluationId": evaluation_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evaluations.create" => Some(handle_evaluations_create(state, req)),
        "evaluations.list" => Some(handle_evaluations_list(state, req)),
        "evaluations.update" => Some(handle_evaluations_update(state, req)),
        _ => None,
    }
}

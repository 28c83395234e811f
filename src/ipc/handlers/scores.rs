use crate::decimal::Decimal;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{parse_decimal_value, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

const BULK_SET_MAX_ENTRIES: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

/// Resolved write for one score cell: either a value or an absence mark.
/// A null value with `absent = false` is stored as-is; the validity
/// filter reports it instead of the write path coercing it.
struct ScoreWrite {
    student_id: String,
    subject_id: String,
    value: Option<Decimal>,
    is_absent: bool,
}

fn resolve_score_write(entry: &serde_json::Value) -> Result<ScoreWrite, HandlerErr> {
    let Some(obj) = entry.as_object() else {
        return Err(HandlerErr::new("bad_params", "entry must be an object"));
    };
    let student_id = obj
        .get("studentId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing studentId"))?
        .to_string();
    let subject_id = obj
        .get("subjectId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing subjectId"))?
        .to_string();
    let is_absent = obj.get("absent").and_then(|v| v.as_bool()).unwrap_or(false);

    let value = match obj.get("value") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let parsed = parse_decimal_value(v).map_err(|()| HandlerErr {
                code: "bad_params",
                message: "value must be a decimal number".to_string(),
                details: Some(json!({ "value": v.clone() })),
            })?;
            if parsed < Decimal::ZERO {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "negative scores are not allowed".to_string(),
                    details: Some(json!({ "value": parsed.to_string() })),
                });
            }
            Some(parsed)
        }
    };

    Ok(ScoreWrite {
        student_id,
        subject_id,
        value,
        is_absent,
    })
}

fn upsert_score(
    conn: &Connection,
    evaluation_id: &str,
    write: &ScoreWrite,
) -> Result<(), HandlerErr> {
    let score_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO score_entries(id, evaluation_id, student_id, subject_id,
                                   value, is_absent, is_active, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(evaluation_id, student_id, subject_id) DO UPDATE SET
           value = excluded.value,
           is_absent = excluded.is_absent,
           is_active = 1,
           updated_at = excluded.updated_at",
        (
            &score_id,
            evaluation_id,
            &write.student_id,
            &write.subject_id,
            write.value.map(|v| v.to_string()),
            write.is_absent as i64,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "score_entries" })),
    })?;
    Ok(())
}

fn evaluation_exists(conn: &Connection, evaluation_id: &str) -> Result<bool, HandlerErr> {
    let n: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM evaluations WHERE id = ?",
            [evaluation_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(n > 0)
}

fn handle_scores_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match evaluation_exists(conn, &evaluation_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "evaluation not found", None),
        Err(e) => return e.response(&req.id),
    }

    let write = match resolve_score_write(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let tx = match conn.transaction() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = upsert_score(&tx, &evaluation_id, &write) {
        return e.response(&req.id);
    }
    if let Err(e) = crate::store::mark_evaluation_dirty(&tx, &evaluation_id) {
        return err(&req.id, &e.code, e.message, e.details);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "evaluationId": evaluation_id }))
}

/// Bulk upsert. Per-entry failures are collected as diagnostics and the
/// rest of the batch still lands.
fn handle_scores_bulk_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries array", None);
    };
    if entries.len() > BULK_SET_MAX_ENTRIES {
        return err(
            &req.id,
            "bad_params",
            format!("too many entries (max {BULK_SET_MAX_ENTRIES})"),
            Some(json!({ "count": entries.len() })),
        );
    }

    match evaluation_exists(conn, &evaluation_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "evaluation not found", None),
        Err(e) => return e.response(&req.id),
    }

    let tx = match conn.transaction() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut updated = 0_usize;
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        let write = match resolve_score_write(entry) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": idx,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };
        match upsert_score(&tx, &evaluation_id, &write) {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "index": idx,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    if let Err(e) = crate::store::mark_evaluation_dirty(&tx, &evaluation_id) {
        return err(&req.id, &e.code, e.message, e.details);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    let rejected = errors.len();
    let mut result = json!({ "updated": updated });
    if rejected > 0 {
        let obj = result.as_object_mut().expect("result should be object");
        obj.insert("rejected".into(), json!(rejected));
        obj.insert("errors".into(), json!(errors));
    }
    ok(&req.id, result)
}

/// Soft delete: the entry stays on disk but stops contributing.
fn handle_scores_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.transaction() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let changed = match tx.execute(
        "UPDATE score_entries SET is_active = 0, updated_at = ?
         WHERE evaluation_id = ? AND student_id = ? AND subject_id = ?",
        (
            Utc::now().to_rfc3339(),
            &evaluation_id,
            &student_id,
            &subject_id,
        ),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "score entry not found", None);
    }
    if let Err(e) = crate::store::mark_evaluation_dirty(&tx, &evaluation_id) {
        return err(&req.id, &e.code, e.message, e.details);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.set" => Some(handle_scores_set(state, req)),
        "scores.bulkSet" => Some(handle_scores_bulk_set(state, req)),
        "scores.delete" => Some(handle_scores_delete(state, req)),
        _ => None,
    }
}

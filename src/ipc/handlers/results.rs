use crate::db;
use crate::decimal::Decimal;
use crate::engine::{self, AbsentPolicy, EvaluationResult, RoundingPolicy};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, optional_decimal, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, EvaluationMeta, StudentLite};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

fn parse_manual_overrides(req: &Request) -> Result<BTreeMap<String, Decimal>, serde_json::Value> {
    let Some(raw) = req.params.get("manualOverrides") else {
        return Ok(BTreeMap::new());
    };
    if raw.is_null() {
        return Ok(BTreeMap::new());
    }
    let Some(obj) = raw.as_object() else {
        return Err(err(
            &req.id,
            "bad_params",
            "manualOverrides must be an object of studentId -> value",
            None,
        ));
    };
    let mut out = BTreeMap::new();
    for (student_id, value) in obj {
        let parsed = crate::ipc::helpers::parse_decimal_value(value).map_err(|()| {
            err(
                &req.id,
                "bad_params",
                format!("manual override for {student_id} must be a decimal number"),
                None,
            )
        })?;
        out.insert(student_id.clone(), parsed);
    }
    Ok(out)
}

fn passing_threshold(
    req: &Request,
    conn: &Connection,
) -> Result<Option<Decimal>, serde_json::Value> {
    if let Some(v) = optional_decimal(req, "passingThreshold")? {
        return Ok(Some(v));
    }
    Ok(db::settings_get(conn, "passing_threshold")
        .ok()
        .flatten()
        .and_then(|raw| raw.parse().ok()))
}

fn student_json(
    s: &engine::StudentResult,
    names: &HashMap<String, String>,
    rounding: RoundingPolicy,
) -> serde_json::Value {
    json!({
        "studentId": s.student_id,
        "displayName": names.get(&s.student_id),
        "average": s.average.map(|a| a.to_string()),
        "display": s.average.map(|a| rounding.render(a)),
        "computedFrom": s.computed_from,
        "pending": s.pending,
        "warnings": s.warnings,
        "rank": s.rank,
        "percentile": s.percentile.map(|p| p.to_string()),
    })
}

fn results_json(
    meta: &EvaluationMeta,
    result: &EvaluationResult,
    students: &[StudentLite],
    rounding: RoundingPolicy,
    pass_threshold: Option<Decimal>,
) -> serde_json::Value {
    let names: HashMap<String, String> = students
        .iter()
        .map(|s| (s.id.clone(), s.display_name.clone()))
        .collect();

    let mut rows: Vec<serde_json::Value> = result
        .students
        .iter()
        .map(|s| student_json(s, &names, rounding))
        .collect();

    // Active students with no recorded entries still show up in reports,
    // outside the computation set.
    let computed: std::collections::HashSet<&str> =
        result.students.iter().map(|s| s.student_id.as_str()).collect();
    for s in students {
        if s.active && !computed.contains(s.id.as_str()) {
            rows.push(json!({
                "studentId": s.id,
                "displayName": s.display_name,
                "average": null,
                "display": null,
                "computedFrom": 0,
                "pending": false,
                "warnings": [],
                "rank": null,
                "percentile": null,
            }));
        }
    }

    json!({
        "evaluation": {
            "id": meta.id,
            "classId": meta.class_id,
            "name": meta.name,
            "date": meta.date,
            "coefficient": meta.coefficient.to_string(),
            "maxScore": meta.max_score.to_string(),
            "absentPolicy": meta.absent_policy.as_str(),
            "roundingPolicy": rounding.as_str(),
        },
        "passingThreshold": pass_threshold.map(|t| t.to_string()),
        "students": rows,
        "stats": result.stats,
        "invalid": result.invalid,
    })
}

/// Full engine run for one evaluation.
///
/// Without per-request overrides the computed averages are persisted into
/// the cache (clearing the dirty bit). With `policy`, `rounding` or
/// `manualOverrides` supplied the run is a what-if: computed fresh,
/// returned, and the cache left untouched.
fn handle_results_evaluation(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut meta = match store::load_evaluation(conn, &evaluation_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "evaluation not found", None),
        Err(e) => return calc_err(req, e),
    };

    let mut what_if = false;
    if let Some(raw) = optional_str(req, "policy") {
        let Some(policy) = AbsentPolicy::parse(&raw) else {
            return err(
                &req.id,
                "bad_params",
                format!("unknown absent policy: {raw}"),
                None,
            );
        };
        if policy != meta.absent_policy {
            what_if = true;
        }
        meta.absent_policy = policy;
    }
    if let Some(raw) = optional_str(req, "rounding") {
        let Some(rounding) = RoundingPolicy::parse(&raw) else {
            return err(
                &req.id,
                "bad_params",
                format!("unknown rounding policy: {raw}"),
                None,
            );
        };
        if rounding != meta.rounding_policy {
            what_if = true;
        }
        meta.rounding_policy = rounding;
    }
    let manual_overrides = match parse_manual_overrides(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !manual_overrides.is_empty() {
        what_if = true;
    }

    let pass_threshold = match passing_threshold(req, conn) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let rows = match store::load_score_rows(conn, &meta) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let result = match engine::compute_evaluation(
        &rows,
        &meta.context(),
        &manual_overrides,
        pass_threshold,
    ) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    if !what_if {
        if let Err(e) = store::save_results(conn, &evaluation_id, &result) {
            return calc_err(req, e);
        }
        tracing::debug!(
            evaluation = %evaluation_id,
            students = result.students.len(),
            "averages recomputed"
        );
    }

    let students = match store::load_students(conn, &meta.class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    ok(
        &req.id,
        results_json(&meta, &result, &students, meta.rounding_policy, pass_threshold),
    )
}

/// Cached read for one student, recomputing first if the evaluation is
/// dirty so reads always observe the latest writes.
fn handle_results_student(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let meta = match store::load_evaluation(conn, &evaluation_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "evaluation not found", None),
        Err(e) => return calc_err(req, e),
    };

    if meta.dirty {
        let rows = match store::load_score_rows(conn, &meta) {
            Ok(v) => v,
            Err(e) => return calc_err(req, e),
        };
        let result =
            match engine::compute_evaluation(&rows, &meta.context(), &BTreeMap::new(), None) {
                Ok(v) => v,
                Err(e) => return calc_err(req, e),
            };
        if let Err(e) = store::save_results(conn, &evaluation_id, &result) {
            return calc_err(req, e);
        }
    }

    let row: Option<(Option<String>, i64, Option<i64>, Option<String>, i64)> = match conn
        .query_row(
            "SELECT average, computed_from, rank, percentile, pending
             FROM student_averages
             WHERE evaluation_id = ? AND student_id = ?",
            (&evaluation_id, &student_id),
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

    let ranked_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM student_averages
         WHERE evaluation_id = ? AND rank IS NOT NULL",
        [&evaluation_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let Some((average, computed_from, rank, percentile, pending)) = row else {
        return err(
            &req.id,
            "not_found",
            "student has no computed average for this evaluation",
            None,
        );
    };

    let display = average
        .as_deref()
        .and_then(|a| a.parse::<Decimal>().ok())
        .map(|a| meta.rounding_policy.render(a));

    ok(
        &req.id,
        json!({
            "evaluationId": evaluation_id,
            "studentId": student_id,
            "average": average,
            "display": display,
            "computedFrom": computed_from,
            "rank": rank,
            "percentile": percentile,
            "pending": pending != 0,
            "rankedCount": ranked_count,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.evaluation" => Some(handle_results_evaluation(state, req)),
        "results.student" => Some(handle_results_student(state, req)),
        _ => None,
    }
}

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let students = match crate::store::load_students(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let rows: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "displayName": s.display_name,
                "sortOrder": s.sort_order,
                "active": s.active,
            })
        })
        .collect();
    ok(&req.id, json!({ "students": rows }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let next_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, 1, ?, ?)",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            next_order,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": student_id, "sortOrder": next_order }))
}

/// Patches last/first name and the active flag. Deactivating a student
/// invalidates every evaluation of the class, since their entries stop
/// contributing to averages.
fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let class_id: Option<String> = match conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .map(Some)
    {
        Ok(v) => v,
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_id) = class_id else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let mut touched_active = false;
    for (key, value) in patch {
        let result = match key.as_str() {
            "lastName" => match value.as_str() {
                Some(v) => conn.execute(
                    "UPDATE students SET last_name = ?, updated_at = ? WHERE id = ?",
                    (v, Utc::now().to_rfc3339(), &student_id),
                ),
                None => return err(&req.id, "bad_params", "lastName must be a string", None),
            },
            "firstName" => match value.as_str() {
                Some(v) => conn.execute(
                    "UPDATE students SET first_name = ?, updated_at = ? WHERE id = ?",
                    (v, Utc::now().to_rfc3339(), &student_id),
                ),
                None => return err(&req.id, "bad_params", "firstName must be a string", None),
            },
            "active" => match value.as_bool() {
                Some(v) => {
                    touched_active = true;
                    conn.execute(
                        "UPDATE students SET active = ?, updated_at = ? WHERE id = ?",
                        (v as i64, Utc::now().to_rfc3339(), &student_id),
                    )
                }
                None => return err(&req.id, "bad_params", "active must be a boolean", None),
            },
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

    if touched_active {
        if let Err(e) = conn.execute(
            "UPDATE evaluations SET dirty = 1 WHERE class_id = ?",
            [&class_id],
        ) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        _ => None,
    }
}

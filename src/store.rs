use crate::decimal::Decimal;
use crate::engine::{
    AbsentPolicy, CalcError, EvaluationContext, EvaluationResult, RoundingPolicy, ScoreRow,
};
use rusqlite::{Connection, OptionalExtension};

/// Evaluation header row, policies already parsed.
#[derive(Debug, Clone)]
pub struct EvaluationMeta {
    pub id: String,
    pub class_id: String,
    pub name: String,
    pub date: Option<String>,
    pub coefficient: Decimal,
    pub max_score: Decimal,
    pub absent_policy: AbsentPolicy,
    pub rounding_policy: RoundingPolicy,
    pub dirty: bool,
}

impl EvaluationMeta {
    pub fn context(&self) -> EvaluationContext {
        EvaluationContext {
            evaluation_id: self.id.clone(),
            max_score: self.max_score,
            policy: self.absent_policy,
            rounding: self.rounding_policy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudentLite {
    pub id: String,
    pub display_name: String,
    pub sort_order: i64,
    pub active: bool,
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

fn parse_decimal_column(raw: &str, column: &str) -> Result<Decimal, CalcError> {
    raw.parse().map_err(|_| {
        CalcError::new(
            "bad_data",
            format!("column {column} holds a malformed decimal: {raw}"),
        )
    })
}

pub fn load_evaluation(
    conn: &Connection,
    evaluation_id: &str,
) -> Result<Option<EvaluationMeta>, CalcError> {
    let row: Option<(String, String, Option<String>, String, String, String, String, i64)> = conn
        .query_row(
            "SELECT class_id, name, date, coefficient, max_score,
                    absent_policy, rounding_policy, dirty
             FROM evaluations
             WHERE id = ?",
            [evaluation_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;

    let Some((class_id, name, date, coefficient, max_score, absent, rounding, dirty)) = row else {
        return Ok(None);
    };

    let absent_policy = AbsentPolicy::parse(&absent).ok_or_else(|| {
        CalcError::new("bad_data", format!("unknown absent policy: {absent}"))
    })?;
    let rounding_policy = RoundingPolicy::parse(&rounding).ok_or_else(|| {
        CalcError::new("bad_data", format!("unknown rounding policy: {rounding}"))
    })?;

    Ok(Some(EvaluationMeta {
        id: evaluation_id.to_string(),
        class_id,
        name,
        date,
        coefficient: parse_decimal_column(&coefficient, "coefficient")?,
        max_score: parse_decimal_column(&max_score, "max_score")?,
        absent_policy,
        rounding_policy,
        dirty: dirty != 0,
    }))
}

/// Loads one evaluation's entries with subject coefficients resolved.
/// Entries of deactivated students are not loaded at all.
pub fn load_score_rows(
    conn: &Connection,
    evaluation: &EvaluationMeta,
) -> Result<Vec<ScoreRow>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT e.student_id, e.subject_id, e.value, e.is_absent, e.is_active,
                    COALESCE(sub.coefficient, '1')
             FROM score_entries e
             JOIN students s ON s.id = e.student_id
             LEFT JOIN subjects sub ON sub.id = e.subject_id
             WHERE e.evaluation_id = ? AND s.active = 1
             ORDER BY e.student_id, e.subject_id",
        )
        .map_err(db_err)?;

    let rows = stmt
        .query_map([&evaluation.id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, String>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut out = Vec::with_capacity(rows.len());
    for (student_id, subject_id, value, is_absent, is_active, coefficient) in rows {
        let value = match value {
            Some(raw) => Some(parse_decimal_column(&raw, "value")?),
            None => None,
        };
        out.push(ScoreRow {
            student_id,
            subject_id,
            value,
            is_absent: is_absent != 0,
            is_active: is_active != 0,
            weight: parse_decimal_column(&coefficient, "coefficient")?,
        });
    }
    Ok(out)
}

pub fn load_students(conn: &Connection, class_id: &str) -> Result<Vec<StudentLite>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, sort_order, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    stmt.query_map([class_id], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok(StudentLite {
            id: r.get(0)?,
            display_name: format!("{}, {}", last, first),
            sort_order: r.get(3)?,
            active: r.get::<_, i64>(4)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

/// Synchronous cache invalidation: every score or evaluation mutation
/// flips the dirty bit in the same transaction as the write.
pub fn mark_evaluation_dirty(conn: &Connection, evaluation_id: &str) -> Result<(), CalcError> {
    conn.execute(
        "UPDATE evaluations SET dirty = 1 WHERE id = ?",
        [evaluation_id],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Persists a computed result into the `student_averages` cache and clears
/// the dirty bit, atomically.
pub fn save_results(
    conn: &mut Connection,
    evaluation_id: &str,
    result: &EvaluationResult,
) -> Result<(), CalcError> {
    let tx = conn.transaction().map_err(db_err)?;
    tx.execute(
        "DELETE FROM student_averages WHERE evaluation_id = ?",
        [evaluation_id],
    )
    .map_err(db_err)?;
    for s in &result.students {
        let warnings = if s.warnings.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&s.warnings).map_err(|e| {
                CalcError::new("bad_data", format!("warnings not serializable: {e}"))
            })?)
        };
        tx.execute(
            "INSERT INTO student_averages(
                evaluation_id, student_id, average, computed_from,
                rank, percentile, pending, warnings)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                evaluation_id,
                &s.student_id,
                s.average.map(|a| a.to_string()),
                s.computed_from as i64,
                s.rank,
                s.percentile.map(|p| p.to_string()),
                s.pending as i64,
                warnings,
            ),
        )
        .map_err(db_err)?;
    }
    tx.execute(
        "UPDATE evaluations SET dirty = 0 WHERE id = ?",
        [evaluation_id],
    )
    .map_err(db_err)?;
    tx.commit().map_err(db_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::collections::BTreeMap;

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn seed(conn: &Connection) {
        conn.execute("INSERT INTO classes(id, name) VALUES('c1', '5e B')", [])
            .expect("class");
        for (id, last, first, order, active) in [
            ("st1", "Durand", "Alice", 0, 1),
            ("st2", "Martin", "Benoit", 1, 1),
            ("st3", "Petit", "Chloe", 2, 0),
        ] {
            conn.execute(
                "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
                 VALUES(?, 'c1', ?, ?, ?, ?)",
                (id, last, first, active, order),
            )
            .expect("student");
        }
        conn.execute(
            "INSERT INTO subjects(id, class_id, name, coefficient, sort_order)
             VALUES('sub1', 'c1', 'Maths', '2', 0)",
            [],
        )
        .expect("subject");
        conn.execute(
            "INSERT INTO evaluations(id, class_id, name, coefficient, max_score,
                                     absent_policy, rounding_policy, dirty)
             VALUES('ev1', 'c1', 'Controle 1', '1', '20',
                    'exclude_from_ranking', 'two_decimals', 1)",
            [],
        )
        .expect("evaluation");
        for (id, student, value, absent) in [
            ("sc1", "st1", Some("14"), 0),
            ("sc2", "st2", None, 1),
            ("sc3", "st3", Some("8"), 0),
        ] {
            conn.execute(
                "INSERT INTO score_entries(id, evaluation_id, student_id, subject_id,
                                           value, is_absent, is_active)
                 VALUES(?, 'ev1', ?, 'sub1', ?, ?, 1)",
                (id, student, value, absent),
            )
            .expect("score");
        }
    }

    #[test]
    fn loads_evaluation_with_parsed_policies() {
        let ws = temp_workspace("carnet-store-load");
        let conn = db::open_db(&ws).expect("open");
        seed(&conn);
        let meta = load_evaluation(&conn, "ev1")
            .expect("load")
            .expect("present");
        assert_eq!(meta.class_id, "c1");
        assert_eq!(meta.absent_policy, AbsentPolicy::ExcludeFromRanking);
        assert_eq!(meta.rounding_policy, RoundingPolicy::TwoDecimals);
        assert!(meta.dirty);
        assert_eq!(meta.max_score, Decimal::from_int(20));
        assert!(load_evaluation(&conn, "missing").expect("load").is_none());
    }

    #[test]
    fn score_rows_resolve_weights_and_skip_inactive_students() {
        let ws = temp_workspace("carnet-store-rows");
        let conn = db::open_db(&ws).expect("open");
        seed(&conn);
        let meta = load_evaluation(&conn, "ev1")
            .expect("load")
            .expect("present");
        let rows = load_score_rows(&conn, &meta).expect("rows");
        // st3 is deactivated; only st1 and st2 load.
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].student_id, "st1");
        assert_eq!(rows[0].weight, Decimal::from_int(2));
        assert!(rows[1].is_absent);
    }

    #[test]
    fn save_results_clears_dirty_and_rewrites_cache() {
        let ws = temp_workspace("carnet-store-save");
        let mut conn = db::open_db(&ws).expect("open");
        seed(&conn);
        let meta = load_evaluation(&conn, "ev1")
            .expect("load")
            .expect("present");
        let rows = load_score_rows(&conn, &meta).expect("rows");
        let result = crate::engine::compute_evaluation(
            &rows,
            &meta.context(),
            &BTreeMap::new(),
            Some(Decimal::from_int(10)),
        )
        .expect("compute");
        save_results(&mut conn, "ev1", &result).expect("save");

        let meta = load_evaluation(&conn, "ev1")
            .expect("load")
            .expect("present");
        assert!(!meta.dirty);
        let cached: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM student_averages WHERE evaluation_id = 'ev1'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(cached, 2);
        let avg: Option<String> = conn
            .query_row(
                "SELECT average FROM student_averages
                 WHERE evaluation_id = 'ev1' AND student_id = 'st1'",
                [],
                |r| r.get(0),
            )
            .expect("avg");
        assert_eq!(avg.as_deref(), Some("14"));
    }
}

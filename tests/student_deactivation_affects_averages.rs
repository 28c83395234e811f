use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_carnetd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn carnetd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn deactivated_student_leaves_ranking_and_statistics() {
    let workspace = temp_dir("carnet-deactivate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "cls",
        "classes.create",
        json!({ "name": "5e A" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();

    let mut student_ids = Vec::new();
    for (i, name) in ["Durand", "Martin", "Petit"].iter().enumerate() {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            &format!("st-{i}"),
            "students.create",
            json!({ "classId": class_id, "lastName": name, "firstName": "Test" }),
        );
        student_ids.push(res["studentId"].as_str().expect("studentId").to_string());
    }
    let subject_id = request_ok(
        &mut stdin,
        &mut reader,
        "subj",
        "subjects.create",
        json!({ "classId": class_id, "name": "Maths" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();
    let evaluation_id = request_ok(
        &mut stdin,
        &mut reader,
        "eval",
        "evaluations.create",
        json!({
            "classId": class_id,
            "name": "Controle",
            "maxScore": 20,
            "absentPolicy": "exclude_from_ranking",
            "roundingPolicy": "none"
        }),
    )["evaluationId"]
        .as_str()
        .expect("evaluationId")
        .to_string();

    let entries: Vec<serde_json::Value> = [18.0, 12.0, 6.0]
        .iter()
        .zip(&student_ids)
        .map(|(score, student)| {
            json!({ "studentId": student, "subjectId": subject_id, "value": score })
        })
        .collect();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "bulk",
        "scores.bulkSet",
        json!({ "evaluationId": evaluation_id, "entries": entries }),
    );

    let before = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "results.evaluation",
        json!({ "evaluationId": evaluation_id }),
    );
    assert_eq!(before["stats"]["count"].as_u64(), Some(3));
    assert_eq!(before["stats"]["mean"].as_str(), Some("12"));

    // Best student leaves the class mid-term.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "deact",
        "students.update",
        json!({ "studentId": student_ids[0], "patch": { "active": false } }),
    );

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "results.evaluation",
        json!({ "evaluationId": evaluation_id }),
    );
    assert_eq!(after["stats"]["count"].as_u64(), Some(2));
    assert_eq!(after["stats"]["mean"].as_str(), Some("9"));

    let rows = after["students"].as_array().expect("students");
    assert!(rows
        .iter()
        .all(|r| r["studentId"].as_str() != Some(student_ids[0].as_str())));
    let second = rows
        .iter()
        .find(|r| r["studentId"].as_str() == Some(student_ids[1].as_str()))
        .expect("remaining student");
    assert_eq!(second["rank"].as_i64(), Some(1));

    let _ = child.kill();
}

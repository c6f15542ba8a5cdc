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
    let exe = env!("CARGO_BIN_EXE_marksheetd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn marksheetd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
}

struct ExamFixture {
    class_id: String,
    exam_id: String,
    student_ids: Vec<String>,
}

/// One class, one unparted subject out of 100, four students with totals
/// 90 / 90 / 80 / 70.
fn seed_tied_exam(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> ExamFixture {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        stdin,
        reader,
        "c1",
        "classes.create",
        json!({ "teacherId": "t-1", "name": "Class 8", "fiscalYear": "2081" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();

    let mut student_ids = Vec::new();
    for (i, name) in ["Anil", "Binita", "Chitra", "Dipesh"].iter().enumerate() {
        let created = request_ok(
            stdin,
            reader,
            &format!("s{}", i),
            "students.create",
            json!({
                "classId": class_id,
                "lastName": "Shrestha",
                "firstName": name,
                "rollNo": i + 1
            }),
        );
        student_ids.push(created["studentId"].as_str().expect("studentId").to_string());
    }

    let subject = request_ok(
        stdin,
        reader,
        "sub",
        "subjects.create",
        json!({
            "classId": class_id,
            "name": "Mathematics",
            "fullMark": 100.0,
            "passMark": 40.0
        }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    let exam = request_ok(
        stdin,
        reader,
        "ex",
        "exams.create",
        json!({
            "classId": class_id,
            "teacherId": "t-1",
            "name": "First Terminal",
            "term": "First"
        }),
    );
    let exam_id = exam["examId"].as_str().expect("examId").to_string();

    for (i, (student_id, obtained)) in student_ids
        .iter()
        .zip([90.0, 90.0, 80.0, 70.0])
        .enumerate()
    {
        request_ok(
            stdin,
            reader,
            &format!("m{}", i),
            "marks.enter",
            json!({
                "examId": exam_id,
                "studentId": student_id,
                "subjectId": subject_id,
                "obtained": obtained
            }),
        );
    }

    ExamFixture {
        class_id,
        exam_id,
        student_ids,
    }
}

fn list_results(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    exam_id: &str,
) -> Vec<serde_json::Value> {
    let listed = request_ok(
        stdin,
        reader,
        id,
        "results.list",
        json!({ "examId": exam_id }),
    );
    listed["results"].as_array().expect("results array").clone()
}

#[test]
fn recompute_assigns_competition_ranks_and_is_idempotent() {
    let workspace = temp_dir("marksheet-recompute");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_tied_exam(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "results.recompute",
        json!({ "examId": fx.exam_id, "teacherId": "t-1" }),
    );

    let first = list_results(&mut stdin, &mut reader, "l1", &fx.exam_id);
    assert_eq!(first.len(), 4);
    let ranks: Vec<i64> = first.iter().map(|r| r["rank"].as_i64().unwrap()).collect();
    let totals: Vec<f64> = first.iter().map(|r| r["total"].as_f64().unwrap()).collect();
    assert_eq!(ranks, vec![1, 1, 3, 4]);
    assert_eq!(totals, vec![90.0, 90.0, 80.0, 70.0]);
    assert_eq!(first[0]["percentage"].as_f64().unwrap(), 90.0);
    assert_eq!(first[0]["grade"].as_str().unwrap(), "A+");
    assert_eq!(first[0]["division"].as_str().unwrap(), "Distinction");
    assert_eq!(first[3]["percentage"].as_f64().unwrap(), 70.0);
    assert_eq!(first[3]["grade"].as_str().unwrap(), "A");

    // Rank never decreases as total decreases.
    for pair in first.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(a["total"].as_f64().unwrap() >= b["total"].as_f64().unwrap());
        assert!(a["rank"].as_i64().unwrap() <= b["rank"].as_i64().unwrap());
    }

    // Second recompute with unchanged inputs: identical numeric rows.
    request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "results.recompute",
        json!({ "examId": fx.exam_id, "teacherId": "t-1" }),
    );
    let second = list_results(&mut stdin, &mut reader, "l2", &fx.exam_id);
    let strip_computed_at = |rows: &[serde_json::Value]| -> Vec<serde_json::Value> {
        rows.iter()
            .map(|r| {
                let mut r = r.clone();
                r.as_object_mut().unwrap().remove("computedAt");
                r
            })
            .collect()
    };
    assert_eq!(strip_computed_at(&first), strip_computed_at(&second));
}

#[test]
fn recompute_requires_ownership_and_existing_exam() {
    let workspace = temp_dir("marksheet-recompute-auth");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_tied_exam(&mut stdin, &mut reader, &workspace);

    let forbidden = request(
        &mut stdin,
        &mut reader,
        "f1",
        "results.recompute",
        json!({ "examId": fx.exam_id, "teacherId": "someone-else" }),
    );
    assert_eq!(forbidden["ok"].as_bool(), Some(false));
    assert_eq!(error_code(&forbidden), "forbidden");

    let missing = request(
        &mut stdin,
        &mut reader,
        "f2",
        "results.recompute",
        json!({ "examId": "no-such-exam", "teacherId": "t-1" }),
    );
    assert_eq!(missing["ok"].as_bool(), Some(false));
    assert_eq!(error_code(&missing), "not_found");
}

#[test]
fn publish_assigns_tokens_once_and_unpublish_retains_them() {
    let workspace = temp_dir("marksheet-publish");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_tied_exam(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "results.recompute",
        json!({ "examId": fx.exam_id, "teacherId": "t-1" }),
    );

    let before = list_results(&mut stdin, &mut reader, "l0", &fx.exam_id);
    assert!(before.iter().all(|r| r["shareToken"].is_null()));
    assert!(before.iter().all(|r| r["isPublished"] == json!(false)));

    request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "results.setPublished",
        json!({ "examId": fx.exam_id, "teacherId": "t-1", "publish": true }),
    );
    let published = list_results(&mut stdin, &mut reader, "l1", &fx.exam_id);
    let tokens: Vec<String> = published
        .iter()
        .map(|r| r["shareToken"].as_str().expect("token assigned").to_string())
        .collect();
    assert!(published.iter().all(|r| r["isPublished"] == json!(true)));
    assert_eq!(tokens.len(), 4);

    // Publishing again must not rotate tokens.
    request_ok(
        &mut stdin,
        &mut reader,
        "p2",
        "results.setPublished",
        json!({ "examId": fx.exam_id, "teacherId": "t-1", "publish": true }),
    );
    let republished = list_results(&mut stdin, &mut reader, "l2", &fx.exam_id);
    let tokens_after: Vec<String> = republished
        .iter()
        .map(|r| r["shareToken"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(tokens, tokens_after);

    // Unpublish clears the flag but keeps tokens; republish restores them.
    request_ok(
        &mut stdin,
        &mut reader,
        "p3",
        "results.setPublished",
        json!({ "examId": fx.exam_id, "teacherId": "t-1", "publish": false }),
    );
    let unpublished = list_results(&mut stdin, &mut reader, "l3", &fx.exam_id);
    assert!(unpublished.iter().all(|r| r["isPublished"] == json!(false)));
    let tokens_retained: Vec<String> = unpublished
        .iter()
        .map(|r| r["shareToken"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(tokens, tokens_retained);

    // Recompute must not touch publish metadata either.
    request_ok(
        &mut stdin,
        &mut reader,
        "p4",
        "results.setPublished",
        json!({ "examId": fx.exam_id, "teacherId": "t-1", "publish": true }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "results.recompute",
        json!({ "examId": fx.exam_id, "teacherId": "t-1" }),
    );
    let after_recompute = list_results(&mut stdin, &mut reader, "l4", &fx.exam_id);
    assert!(after_recompute.iter().all(|r| r["isPublished"] == json!(true)));
    let tokens_final: Vec<String> = after_recompute
        .iter()
        .map(|r| r["shareToken"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(tokens, tokens_final);
}

#[test]
fn recompute_drops_rows_of_unenrolled_students() {
    let workspace = temp_dir("marksheet-unenroll");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_tied_exam(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "results.recompute",
        json!({ "examId": fx.exam_id, "teacherId": "t-1" }),
    );
    assert_eq!(list_results(&mut stdin, &mut reader, "l1", &fx.exam_id).len(), 4);

    request_ok(
        &mut stdin,
        &mut reader,
        "u1",
        "students.update",
        json!({
            "studentId": fx.student_ids[3],
            "patch": { "active": false }
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "results.recompute",
        json!({ "examId": fx.exam_id, "teacherId": "t-1" }),
    );
    let rows = list_results(&mut stdin, &mut reader, "l2", &fx.exam_id);
    assert_eq!(rows.len(), 3);
    assert!(rows
        .iter()
        .all(|r| r["studentId"].as_str().unwrap() != fx.student_ids[3]));

    let _ = fx.class_id;
}

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

/// Two exams in one session; Science is parted TH (of 50) / PR (of 50),
/// Nepali is unparted (of 100). No conversions, so the arithmetic is
/// directly checkable.
#[test]
fn session_summary_sums_exams_and_buckets_theory_practical() {
    let workspace = temp_dir("marksheet-session");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "teacherId": "t-1", "name": "Class 10", "fiscalYear": "2081" }),
    );
    let class_id = class["classId"].as_str().unwrap().to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({ "classId": class_id, "lastName": "Thapa", "firstName": "Sita", "rollNo": 1 }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    let science = request_ok(
        &mut stdin,
        &mut reader,
        "sub1",
        "subjects.create",
        json!({
            "classId": class_id,
            "name": "Science",
            "parts": [
                { "name": "Theory", "partType": "TH", "fullMark": 50.0, "passMark": 20.0 },
                { "name": "Practical", "partType": "PR", "fullMark": 50.0, "passMark": 20.0 }
            ]
        }),
    );
    let science_id = science["subjectId"].as_str().unwrap().to_string();
    let th_id = science["parts"][0]["partId"].as_str().unwrap().to_string();
    let pr_id = science["parts"][1]["partId"].as_str().unwrap().to_string();
    let nepali = request_ok(
        &mut stdin,
        &mut reader,
        "sub2",
        "subjects.create",
        json!({ "classId": class_id, "name": "Nepali", "fullMark": 100.0 }),
    );
    let nepali_id = nepali["subjectId"].as_str().unwrap().to_string();

    // (exam name, TH, PR, Nepali)
    let exams = [("First Terminal", 40.0, 20.0, 60.0), ("Second Terminal", 45.0, 25.0, 80.0)];
    for (i, (name, th, pr, nep)) in exams.iter().enumerate() {
        let exam = request_ok(
            &mut stdin,
            &mut reader,
            &format!("ex{}", i),
            "exams.create",
            json!({ "classId": class_id, "teacherId": "t-1", "name": name }),
        );
        let exam_id = exam["examId"].as_str().unwrap().to_string();
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("mb{}", i),
            "marks.bulkEnter",
            json!({
                "examId": exam_id,
                "entries": [
                    { "studentId": student_id, "subjectId": science_id, "subjectPartId": th_id, "obtained": th },
                    { "studentId": student_id, "subjectId": science_id, "subjectPartId": pr_id, "obtained": pr },
                    { "studentId": student_id, "subjectId": nepali_id, "obtained": nep }
                ]
            }),
        );
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("r{}", i),
            "results.recompute",
            json!({ "examId": exam_id, "teacherId": "t-1" }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "sess",
        "results.studentSession",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "fiscalYear": "2081"
        }),
    );

    let items = summary["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["examName"].as_str(), Some("First Terminal"));
    assert_eq!(items[0]["total"].as_f64(), Some(120.0));
    assert_eq!(items[0]["maxTotal"].as_f64(), Some(200.0));
    assert_eq!(items[0]["percentage"].as_f64(), Some(60.0));
    assert_eq!(items[1]["total"].as_f64(), Some(150.0));
    assert_eq!(items[1]["percentage"].as_f64(), Some(75.0));

    assert_eq!(summary["grandTotal"].as_f64(), Some(270.0));
    assert_eq!(summary["avgPercent"].as_f64(), Some(67.5));

    let subjects = summary["subjects"].as_array().unwrap();
    assert_eq!(subjects.len(), 2);
    let sci = subjects
        .iter()
        .find(|s| s["subjectName"].as_str() == Some("Science"))
        .unwrap();
    assert_eq!(sci["thTotal"].as_f64(), Some(85.0));
    assert_eq!(sci["prTotal"].as_f64(), Some(45.0));
    assert_eq!(sci["total"].as_f64(), Some(130.0));
    let nep = subjects
        .iter()
        .find(|s| s["subjectName"].as_str() == Some("Nepali"))
        .unwrap();
    // Unparted subjects count entirely as Theory.
    assert_eq!(nep["thTotal"].as_f64(), Some(140.0));
    assert_eq!(nep["prTotal"].as_f64(), Some(0.0));

    assert_eq!(summary["subjectTotals"]["thTotal"].as_f64(), Some(225.0));
    assert_eq!(summary["subjectTotals"]["prTotal"].as_f64(), Some(45.0));
    assert_eq!(summary["subjectTotals"]["total"].as_f64(), Some(270.0));
}

/// A session with no computed results yields zeroed aggregates rather than
/// an error.
#[test]
fn empty_session_yields_zero_aggregates() {
    let workspace = temp_dir("marksheet-session-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "teacherId": "t-1", "name": "Class 7", "fiscalYear": "2081" }),
    );
    let class_id = class["classId"].as_str().unwrap().to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({ "classId": class_id, "lastName": "Karki", "firstName": "Hari" }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "sess",
        "results.studentSession",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "fiscalYear": "2081"
        }),
    );
    assert_eq!(summary["items"].as_array().unwrap().len(), 0);
    assert_eq!(summary["grandTotal"].as_f64(), Some(0.0));
    assert_eq!(summary["avgPercent"].as_f64(), Some(0.0));
    assert_eq!(summary["subjects"].as_array().unwrap().len(), 0);
}

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

struct Fixture {
    exam_id: String,
    student_id: String,
    science_id: String,
    theory_part_id: String,
    practical_part_id: String,
}

/// One student, one parted subject: Theory out of 75 (converts to 50) and
/// Practical out of 25.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &std::path::Path) -> Fixture {
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
        json!({ "teacherId": "t-1", "name": "Class 9", "fiscalYear": "2081" }),
    );
    let class_id = class["classId"].as_str().unwrap().to_string();

    let student = request_ok(
        stdin,
        reader,
        "s1",
        "students.create",
        json!({ "classId": class_id, "lastName": "Rai", "firstName": "Kiran", "rollNo": 1 }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    let science = request_ok(
        stdin,
        reader,
        "sub1",
        "subjects.create",
        json!({
            "classId": class_id,
            "name": "Science",
            "parts": [
                {
                    "name": "Theory",
                    "partType": "TH",
                    "fullMark": 75.0,
                    "passMark": 30.0,
                    "hasConversion": true,
                    "convertToMark": 50.0
                },
                { "name": "Practical", "partType": "PR", "fullMark": 25.0, "passMark": 10.0 }
            ]
        }),
    );
    let science_id = science["subjectId"].as_str().unwrap().to_string();
    let parts = science["parts"].as_array().unwrap();
    let theory_part_id = parts[0]["partId"].as_str().unwrap().to_string();
    let practical_part_id = parts[1]["partId"].as_str().unwrap().to_string();

    let exam = request_ok(
        stdin,
        reader,
        "ex1",
        "exams.create",
        json!({ "classId": class_id, "teacherId": "t-1", "name": "Mid Term" }),
    );
    let exam_id = exam["examId"].as_str().unwrap().to_string();

    Fixture {
        exam_id,
        student_id,
        science_id,
        theory_part_id,
        practical_part_id,
    }
}

fn find_unit<'a>(
    units: &'a [serde_json::Value],
    part_id: Option<&str>,
) -> &'a serde_json::Value {
    units
        .iter()
        .find(|u| u["partId"].as_str() == part_id)
        .expect("unit present")
}

#[test]
fn effective_scales_tag_their_source_and_overrides_win() {
    let workspace = temp_dir("marksheet-scales");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "es1",
        "examScales.list",
        json!({ "examId": fx.exam_id }),
    );
    let units = listed["units"].as_array().unwrap().clone();
    assert_eq!(units.len(), 2);
    let theory = find_unit(&units, Some(&fx.theory_part_id));
    assert_eq!(theory["scale"]["source"].as_str(), Some("default"));
    assert_eq!(theory["scale"]["fullMark"].as_f64(), Some(75.0));
    assert_eq!(theory["targetMark"].as_f64(), Some(50.0));

    // A subject-level override re-scales both parts...
    request_ok(
        &mut stdin,
        &mut reader,
        "es2",
        "examScales.set",
        json!({
            "examId": fx.exam_id,
            "teacherId": "t-1",
            "subjectId": fx.science_id,
            "fullMark": 60.0,
            "passMark": 24.0
        }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "es3",
        "examScales.list",
        json!({ "examId": fx.exam_id }),
    );
    let units = listed["units"].as_array().unwrap().clone();
    for unit in &units {
        assert_eq!(unit["scale"]["source"].as_str(), Some("subjectOverride"));
        assert_eq!(unit["scale"]["fullMark"].as_f64(), Some(60.0));
    }

    // ...until a part-level override pins one of them.
    request_ok(
        &mut stdin,
        &mut reader,
        "es4",
        "examScales.set",
        json!({
            "examId": fx.exam_id,
            "teacherId": "t-1",
            "subjectPartId": fx.practical_part_id,
            "fullMark": 40.0,
            "passMark": 16.0
        }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "es5",
        "examScales.list",
        json!({ "examId": fx.exam_id }),
    );
    let units = listed["units"].as_array().unwrap().clone();
    let theory = find_unit(&units, Some(&fx.theory_part_id));
    let practical = find_unit(&units, Some(&fx.practical_part_id));
    assert_eq!(theory["scale"]["source"].as_str(), Some("subjectOverride"));
    assert_eq!(practical["scale"]["source"].as_str(), Some("partOverride"));
    assert_eq!(practical["scale"]["fullMark"].as_f64(), Some(40.0));

    // Clearing restores the defaults.
    request_ok(
        &mut stdin,
        &mut reader,
        "es6",
        "examScales.clear",
        json!({ "examId": fx.exam_id, "teacherId": "t-1" }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "es7",
        "examScales.list",
        json!({ "examId": fx.exam_id }),
    );
    for unit in listed["units"].as_array().unwrap() {
        assert_eq!(unit["scale"]["source"].as_str(), Some("default"));
    }
}

#[test]
fn conversion_applies_at_entry_and_recompute_follows_current_scale() {
    let workspace = temp_dir("marksheet-conversion");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    // 60 of 75 converted onto 50 is 40.00.
    let entered = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.enter",
        json!({
            "examId": fx.exam_id,
            "studentId": fx.student_id,
            "subjectId": fx.science_id,
            "subjectPartId": fx.theory_part_id,
            "obtained": 60.0
        }),
    );
    assert_eq!(entered["converted"].as_f64(), Some(40.0));

    request_ok(
        &mut stdin,
        &mut reader,
        "m2",
        "marks.enter",
        json!({
            "examId": fx.exam_id,
            "studentId": fx.student_id,
            "subjectId": fx.science_id,
            "subjectPartId": fx.practical_part_id,
            "obtained": 20.0
        }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "results.recompute",
        json!({ "examId": fx.exam_id, "teacherId": "t-1" }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "results.list",
        json!({ "examId": fx.exam_id }),
    );
    let row = &listed["results"].as_array().unwrap()[0];
    // Theory 40 (converted) + Practical 20, out of 50 + 25.
    assert_eq!(row["total"].as_f64(), Some(60.0));
    assert_eq!(row["maxTotal"].as_f64(), Some(75.0));
    assert_eq!(row["percentage"].as_f64(), Some(80.0));
    assert_eq!(row["grade"].as_str(), Some("A+"));

    // Dropping the conversion via a part override and recomputing must
    // rescore from `obtained`, not from the previously stored conversion.
    request_ok(
        &mut stdin,
        &mut reader,
        "es1",
        "examScales.set",
        json!({
            "examId": fx.exam_id,
            "teacherId": "t-1",
            "subjectPartId": fx.theory_part_id,
            "fullMark": 75.0,
            "passMark": 30.0
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "results.recompute",
        json!({ "examId": fx.exam_id, "teacherId": "t-1" }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l2",
        "results.list",
        json!({ "examId": fx.exam_id }),
    );
    let row = &listed["results"].as_array().unwrap()[0];
    assert_eq!(row["total"].as_f64(), Some(80.0));
    assert_eq!(row["maxTotal"].as_f64(), Some(100.0));
    assert_eq!(row["percentage"].as_f64(), Some(80.0));
}

#[test]
fn marks_entry_validates_range_and_unit() {
    let workspace = temp_dir("marksheet-marks-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    let negative = request(
        &mut stdin,
        &mut reader,
        "v1",
        "marks.enter",
        json!({
            "examId": fx.exam_id,
            "studentId": fx.student_id,
            "subjectId": fx.science_id,
            "subjectPartId": fx.theory_part_id,
            "obtained": -5.0
        }),
    );
    assert_eq!(negative["ok"].as_bool(), Some(false));
    assert_eq!(
        negative["error"]["code"].as_str(),
        Some("bad_params"),
        "negative marks rejected"
    );

    let above_full = request(
        &mut stdin,
        &mut reader,
        "v2",
        "marks.enter",
        json!({
            "examId": fx.exam_id,
            "studentId": fx.student_id,
            "subjectId": fx.science_id,
            "subjectPartId": fx.theory_part_id,
            "obtained": 80.0
        }),
    );
    assert_eq!(above_full["ok"].as_bool(), Some(false));
    assert_eq!(above_full["error"]["code"].as_str(), Some("bad_params"));

    // A parted subject cannot take a whole-subject mark.
    let missing_part = request(
        &mut stdin,
        &mut reader,
        "v3",
        "marks.enter",
        json!({
            "examId": fx.exam_id,
            "studentId": fx.student_id,
            "subjectId": fx.science_id,
            "obtained": 50.0
        }),
    );
    assert_eq!(missing_part["ok"].as_bool(), Some(false));
    assert_eq!(missing_part["error"]["code"].as_str(), Some("not_found"));

    // Bulk entry reports per-entry failures without aborting the batch.
    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "v4",
        "marks.bulkEnter",
        json!({
            "examId": fx.exam_id,
            "entries": [
                {
                    "studentId": fx.student_id,
                    "subjectId": fx.science_id,
                    "subjectPartId": fx.theory_part_id,
                    "obtained": 70.0
                },
                {
                    "studentId": "ghost",
                    "subjectId": fx.science_id,
                    "subjectPartId": fx.theory_part_id,
                    "obtained": 10.0
                }
            ]
        }),
    );
    assert_eq!(bulk["updated"].as_i64(), Some(1));
    assert_eq!(bulk["rejected"].as_i64(), Some(1));
    assert_eq!(bulk["errors"][0]["code"].as_str(), Some("not_found"));
}

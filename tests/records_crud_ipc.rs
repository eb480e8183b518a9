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
    let exe = env!("CARGO_BIN_EXE_recordsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn recordsd");
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

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value.pointer("/error/code").and_then(|v| v.as_str())
}

#[test]
fn hand_entered_records_obey_import_rules() {
    let workspace = temp_dir("recordsd-records-crud");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let no_subjects = request(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "name": "Computer Science", "shortCode": "CS", "durationMonths": 12 }),
    );
    assert_eq!(error_code(&no_subjects), Some("validation_failed"));
    assert_eq!(
        no_subjects
            .pointer("/error/details/errors/0/message")
            .and_then(|v| v.as_str()),
        Some("At least one subject is required")
    );

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({
            "name": "Computer Science",
            "shortCode": "CS",
            "durationMonths": 12,
            "subjects": [
                { "name": "Programming", "type": "theory", "teMax": 80, "ceMax": 20 },
                { "name": "Lab", "type": "practical", "peMax": 60, "pwMax": 40 }
            ]
        }),
    );
    let course_id = course.get("id").and_then(|v| v.as_i64()).expect("course id");

    let same_code = request(
        &mut stdin,
        &mut reader,
        "4",
        "courses.create",
        json!({
            "name": "Computing",
            "shortCode": "cs",
            "durationMonths": 12,
            "subjects": [{ "name": "Maths", "type": "theory", "teMax": 100 }]
        }),
    );
    assert_eq!(error_code(&same_code), Some("validation_failed"));
    assert_eq!(
        same_code
            .pointer("/error/details/errors/0/kind")
            .and_then(|v| v.as_str()),
        Some("conflict")
    );

    let unknown_course = request(
        &mut stdin,
        &mut reader,
        "5",
        "batches.create",
        json!({ "name": "X-1", "startDate": "2024-01-01", "durationMonths": 6, "course": "XYZ" }),
    );
    assert_eq!(error_code(&unknown_course), Some("validation_failed"));
    assert_eq!(
        unknown_course.pointer("/error/message").and_then(|v| v.as_str()),
        Some("Course \"XYZ\" not found")
    );

    let batch = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "batches.create",
        json!({ "name": "CS-2024", "startDate": "2024-01-15", "durationMonths": 12, "course": "cs" }),
    );
    let batch_id = batch.get("id").and_then(|v| v.as_i64()).expect("batch id");

    let bad_student = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({
            "name": "Asha Rao",
            "email": "asha-at-example",
            "phone": "12",
            "birthDate": "1850-01-01",
            "course": "CS",
            "batch": "CS-2024"
        }),
    );
    assert_eq!(error_code(&bad_student), Some("validation_failed"));
    let count = bad_student
        .pointer("/error/details/errors")
        .and_then(|v| v.as_array())
        .map(|e| e.len());
    assert_eq!(count, Some(3));

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({
            "name": "Asha Rao",
            "email": "asha@example.com",
            "phone": "+91 98450 12345",
            "birthDate": "2001-07-04",
            "course": "CS",
            "batch": "CS-2024"
        }),
    );
    let student_id = student.get("id").and_then(|v| v.as_i64()).expect("student id");

    let listed = request_ok(&mut stdin, &mut reader, "9", "students.list", json!({}));
    assert_eq!(
        listed.pointer("/students/0/batchName").and_then(|v| v.as_str()),
        Some("CS-2024")
    );
    let courses = request_ok(&mut stdin, &mut reader, "10", "courses.list", json!({}));
    assert_eq!(
        courses
            .pointer("/courses/0/subjects")
            .and_then(|v| v.as_array())
            .map(|s| s.len()),
        Some(2)
    );

    // Referenced records cannot be deleted until their dependents are gone.
    let blocked = request(
        &mut stdin,
        &mut reader,
        "11",
        "courses.delete",
        json!({ "id": course_id }),
    );
    assert_eq!(error_code(&blocked), Some("conflict"));
    let _ = request_ok(&mut stdin, &mut reader, "12", "students.delete", json!({ "id": student_id }));
    let _ = request_ok(&mut stdin, &mut reader, "13", "batches.delete", json!({ "id": batch_id }));
    let _ = request_ok(&mut stdin, &mut reader, "14", "courses.delete", json!({ "id": course_id }));

    let gone = request(&mut stdin, &mut reader, "15", "courses.delete", json!({ "id": course_id }));
    assert_eq!(error_code(&gone), Some("not_found"));
    let missing_id = request(&mut stdin, &mut reader, "16", "batches.delete", json!({}));
    assert_eq!(error_code(&missing_id), Some("bad_params"));

    let _ = std::fs::remove_dir_all(workspace);
}

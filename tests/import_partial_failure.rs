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

fn seed_course(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let _ = request_ok(
        stdin,
        reader,
        "seed-course",
        "courses.create",
        json!({
            "name": "Computer Science",
            "shortCode": "CS",
            "durationMonths": 12,
            "subjects": [{ "name": "Programming", "type": "theory", "teMax": 80, "ceMax": 20 }]
        }),
    );
}

fn progress(events: &serde_json::Value) -> Vec<f64> {
    events
        .as_array()
        .expect("events")
        .iter()
        .filter(|e| e.get("event").and_then(|v| v.as_str()) == Some("executionProgress"))
        .filter_map(|e| e.get("percent").and_then(|v| v.as_f64()))
        .collect()
}

#[test]
fn a_rejected_row_does_not_roll_back_the_others() {
    let workspace = temp_dir("recordsd-import-partial");
    let csv = workspace.join("batches.csv");
    std::fs::write(
        &csv,
        "Batch Name,Start Date,Duration (Months),Course\n\
         B1,2024-01-15,12,CS\n\
         B2,2024-02-15,12,CS\n\
         B3,2024-03-15,12,CS\n",
    )
    .expect("write csv");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_course(&mut stdin, &mut reader);

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.open",
        json!({ "kind": "batch", "mode": "create" }),
    );
    let session = opened
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let loaded = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "import.load",
        json!({ "sessionId": session, "inPath": csv.to_string_lossy() }),
    );
    assert_eq!(loaded.pointer("/summary/valid").and_then(|v| v.as_u64()), Some(3));

    // The reference snapshot predates this, so only the backend notices.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "batches.create",
        json!({ "name": "B2", "startDate": "2024-02-01", "durationMonths": 6, "course": "CS" }),
    );

    let executed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "import.execute",
        json!({ "sessionId": session }),
    );
    let outcome = executed.get("outcome").expect("outcome");
    assert_eq!(outcome.get("success").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(outcome.get("failed").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(outcome.pointer("/errors/0/row").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(outcome.pointer("/errors/0/label").and_then(|v| v.as_str()), Some("B2"));
    assert_eq!(
        outcome.pointer("/errors/0/message").and_then(|v| v.as_str()),
        Some("Batch \"B2\" already exists")
    );
    assert_eq!(outcome.get("interrupted").and_then(|v| v.as_bool()), Some(false));

    let events = executed.get("events").expect("events");
    let percents = progress(events);
    assert_eq!(percents.len(), 3);
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last().copied(), Some(100.0));
    let last = events.as_array().and_then(|a| a.last()).expect("last event");
    assert_eq!(last.get("event").and_then(|v| v.as_str()), Some("executionComplete"));
    assert_eq!(last.pointer("/outcome/failed").and_then(|v| v.as_u64()), Some(1));

    let listed = request_ok(&mut stdin, &mut reader, "6", "batches.list", json!({}));
    let batches = listed.get("batches").and_then(|v| v.as_array()).expect("batches");
    let names: Vec<&str> = batches
        .iter()
        .filter_map(|b| b.get("name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(names, vec!["B1", "B2", "B3"]);
    let b2 = batches
        .iter()
        .find(|b| b.get("name").and_then(|v| v.as_str()) == Some("B2"))
        .expect("B2");
    // B2 is the hand-entered batch, not the imported row.
    assert_eq!(b2.get("startDate").and_then(|v| v.as_str()), Some("2024-02-01"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn raised_in_flight_limit_keeps_outcomes_in_row_order() {
    let workspace = temp_dir("recordsd-import-in-flight");
    let csv = workspace.join("batches.csv");
    let mut body = String::from("Batch Name,Start Date,Duration (Months),Course\n");
    for n in 1..=7 {
        body.push_str(&format!("Batch {},2024-01-{:02},12,CS\n", n, n));
    }
    std::fs::write(&csv, body).expect("write csv");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_course(&mut stdin, &mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "section": "import", "patch": { "maxInFlight": 3 } }),
    );

    let opened = request_ok(&mut stdin, &mut reader, "3", "import.open", json!({ "kind": "batch" }));
    let session = opened
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "import.load",
        json!({ "sessionId": session, "inPath": csv.to_string_lossy() }),
    );
    let executed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "import.execute",
        json!({ "sessionId": session }),
    );
    assert_eq!(executed.pointer("/outcome/success").and_then(|v| v.as_u64()), Some(7));
    let saved_rows: Vec<u64> = executed
        .pointer("/outcome/saved")
        .and_then(|v| v.as_array())
        .expect("saved")
        .iter()
        .filter_map(|s| s.get("row").and_then(|v| v.as_u64()))
        .collect();
    assert_eq!(saved_rows, vec![2, 3, 4, 5, 6, 7, 8]);
    let percents = progress(executed.get("events").expect("events"));
    assert_eq!(percents.len(), 7);
    assert!(percents.windows(2).all(|w| w[0] < w[1]));

    let _ = std::fs::remove_dir_all(workspace);
}

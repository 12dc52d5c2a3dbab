use chrono::{Duration, Utc};
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
    let exe = env!("CARGO_BIN_EXE_rollbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rollbookd");
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
    actor: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
        "actor": actor,
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
    actor: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params, actor);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn admin() -> serde_json::Value {
    json!({ "id": 990, "role": "ADMIN" })
}

fn days_ago(n: i64) -> String {
    (Utc::now().date_naive() - Duration::days(n))
        .format("%Y-%m-%d")
        .to_string()
}

fn setup_enrollment(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> i64 {
    request_ok(
        stdin,
        reader,
        "setup-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        json!(null),
    );
    let course = request_ok(
        stdin,
        reader,
        "setup-course",
        "catalog.createCourse",
        json!({ "title": "Python", "code": "CS101" }),
        admin(),
    );
    let course_id = course["id"].as_i64().expect("course id");
    let section = request_ok(
        stdin,
        reader,
        "setup-section",
        "catalog.createSection",
        json!({ "courseId": course_id, "sectionName": "A" }),
        admin(),
    );
    let section_id = section["id"].as_i64().expect("section id");
    request_ok(
        stdin,
        reader,
        "setup-student",
        "users.create",
        json!({
            "name": "meera iyer",
            "email": "m.iyer@college.edu",
            "collegeId": "BT2023010",
            "role": "STUDENT"
        }),
        admin(),
    );
    request_ok(
        stdin,
        reader,
        "setup-enroll",
        "import.enrollments",
        json!({ "csv": "student_college_id,course_code,section_name\nBT2023010,CS101,A" }),
        admin(),
    );
    let grid = request_ok(
        stdin,
        reader,
        "setup-grid",
        "attendance.sectionStudents",
        json!({ "sectionId": section_id, "date": days_ago(0), "periodIndex": 1 }),
        admin(),
    );
    grid["students"][0]["enrollmentId"].as_i64().expect("enrollment id")
}

#[test]
fn window_blocks_stale_edits_for_non_admins() {
    let workspace = temp_dir("rollbook-window");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let enrollment_id = setup_enrollment(&mut stdin, &mut reader, &workspace);
    let lecturer = json!({ "id": 7, "role": "LECTURER" });

    // Default window is 2 days.
    let settings = request_ok(
        &mut stdin,
        &mut reader,
        "settings-read",
        "settings.editWindow",
        json!({}),
        lecturer.clone(),
    );
    assert_eq!(settings["editWindowDays"].as_i64(), Some(2));

    let expired = request(
        &mut stdin,
        &mut reader,
        "mark-expired",
        "attendance.bulkMark",
        json!({
            "date": days_ago(3),
            "periodIndex": 1,
            "items": [{ "enrollmentId": enrollment_id, "status": "PRESENT" }]
        }),
        lecturer.clone(),
    );
    assert_eq!(expired["ok"].as_bool(), Some(false));
    assert_eq!(
        expired["error"]["code"].as_str(),
        Some("edit_window_expired")
    );
    let message = expired["error"]["message"].as_str().unwrap_or("");
    assert!(
        message.contains("past 2 days"),
        "message must state the window: {}",
        message
    );

    // Exactly at the window boundary is still editable.
    let boundary = request_ok(
        &mut stdin,
        &mut reader,
        "mark-boundary",
        "attendance.bulkMark",
        json!({
            "date": days_ago(2),
            "periodIndex": 1,
            "items": [{ "enrollmentId": enrollment_id, "status": "PRESENT" }]
        }),
        lecturer,
    );
    assert_eq!(boundary["results"][0]["status"].as_str(), Some("APPLIED"));
}

#[test]
fn admins_bypass_the_window() {
    let workspace = temp_dir("rollbook-window-admin");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let enrollment_id = setup_enrollment(&mut stdin, &mut reader, &workspace);

    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "mark-old",
        "attendance.bulkMark",
        json!({
            "date": days_ago(30),
            "periodIndex": 1,
            "items": [{ "enrollmentId": enrollment_id, "status": "PRESENT" }]
        }),
        admin(),
    );
    assert_eq!(applied["results"][0]["status"].as_str(), Some("APPLIED"));
}

#[test]
fn window_size_is_admin_configurable() {
    let workspace = temp_dir("rollbook-window-config");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let enrollment_id = setup_enrollment(&mut stdin, &mut reader, &workspace);
    let lecturer = json!({ "id": 7, "role": "LECTURER" });

    let denied = request(
        &mut stdin,
        &mut reader,
        "settings-denied",
        "settings.update",
        json!({ "editWindowDays": 5 }),
        lecturer.clone(),
    );
    assert_eq!(denied["ok"].as_bool(), Some(false));
    assert_eq!(denied["error"]["code"].as_str(), Some("unauthorized"));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "settings-update",
        "settings.update",
        json!({ "editWindowDays": 5 }),
        admin(),
    );
    assert_eq!(updated["editWindowDays"].as_i64(), Some(5));

    // 4 days back is inside the widened window now.
    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "mark-widened",
        "attendance.bulkMark",
        json!({
            "date": days_ago(4),
            "periodIndex": 1,
            "items": [{ "enrollmentId": enrollment_id, "status": "LATE" }]
        }),
        lecturer,
    );
    assert_eq!(applied["results"][0]["status"].as_str(), Some("APPLIED"));
}

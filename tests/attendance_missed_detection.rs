use chrono::{Datelike, Duration, Utc};
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

/// Weekday dates (Mon..Fri) among the last `window` days, oldest first.
fn expected_weekday_dates(window: i64) -> Vec<String> {
    let today = Utc::now().date_naive();
    let mut dates: Vec<String> = (1..=window)
        .map(|n| today - Duration::days(n))
        .filter(|d| (1..=5).contains(&d.weekday().num_days_from_sunday()))
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect();
    dates.sort();
    dates
}

#[test]
fn fully_unmarked_periods_are_flagged_until_one_record_exists() {
    let workspace = temp_dir("rollbook-missed");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        json!(null),
    );

    let lecturer = request_ok(
        &mut stdin,
        &mut reader,
        "lect",
        "users.create",
        json!({
            "name": "daniel okoye",
            "email": "d.okoye@college.edu",
            "collegeId": "L010",
            "role": "LECTURER"
        }),
        admin(),
    );
    let lecturer_id = lecturer["id"].as_i64().expect("lecturer id");
    let lecturer_actor = json!({ "id": lecturer_id, "role": "LECTURER" });

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "course",
        "catalog.createCourse",
        json!({ "title": "Artificial Intelligence", "code": "AI701" }),
        admin(),
    );
    let course_id = course["id"].as_i64().expect("course id");
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "section",
        "catalog.createSection",
        json!({ "courseId": course_id, "sectionName": "B" }),
        admin(),
    );
    let section_id = section["id"].as_i64().expect("section id");

    // Period 1 every weekday.
    for dow in 1..=5 {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("tt-{}", dow),
            "timetable.createEntry",
            json!({
                "sectionId": section_id,
                "lecturerId": lecturer_id,
                "dayOfWeek": dow,
                "periodIndex": 1,
                "startTime": "09:00",
                "endTime": "10:00"
            }),
            admin(),
        );
    }

    // A second taught section with no students must never be flagged.
    let empty_section = request_ok(
        &mut stdin,
        &mut reader,
        "section-empty",
        "catalog.createSection",
        json!({ "courseId": course_id, "sectionName": "Z" }),
        admin(),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "tt-empty",
        "timetable.createEntry",
        json!({
            "sectionId": empty_section["id"].as_i64().expect("section id"),
            "lecturerId": lecturer_id,
            "dayOfWeek": 1,
            "periodIndex": 2,
            "startTime": "10:00",
            "endTime": "11:00"
        }),
        admin(),
    );

    let mut enroll_csv = String::from("student_college_id,course_code,section_name");
    for i in 1..=5 {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("student-{}", i),
            "users.create",
            json!({
                "name": format!("student {}", i),
                "email": format!("s{}@college.edu", i),
                "collegeId": format!("BT20230{:02}", i),
                "role": "STUDENT"
            }),
            admin(),
        );
        enroll_csv.push_str(&format!("\nBT20230{:02},AI701,B", i));
    }
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "enroll",
        "import.enrollments",
        json!({ "csv": enroll_csv }),
        admin(),
    );
    assert_eq!(imported["success"].as_i64(), Some(5));

    // Widen the scan so at least a full school week is always covered.
    request_ok(
        &mut stdin,
        &mut reader,
        "settings",
        "settings.update",
        json!({ "editWindowDays": 7 }),
        admin(),
    );

    let expected_dates = expected_weekday_dates(7);
    assert_eq!(expected_dates.len(), 5);

    let missed = request_ok(
        &mut stdin,
        &mut reader,
        "missed-1",
        "attendance.missed",
        json!({ "lecturerId": lecturer_id }),
        lecturer_actor.clone(),
    );
    let entries = missed["missed"].as_array().expect("missed");
    let flagged_dates: Vec<String> = entries
        .iter()
        .map(|e| e["date"].as_str().expect("date").to_string())
        .collect();
    assert_eq!(flagged_dates, expected_dates, "ascending date order expected");
    for entry in entries {
        assert_eq!(entry["period"]["periodIndex"].as_i64(), Some(1));
        assert_eq!(entry["period"]["sectionId"].as_i64(), Some(section_id));
    }

    // One record for one student is enough to clear the flag for that date.
    let newest = expected_dates.last().expect("a scheduled date").clone();
    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "grid",
        "attendance.sectionStudents",
        json!({ "sectionId": section_id, "date": newest, "periodIndex": 1 }),
        lecturer_actor.clone(),
    );
    let enrollment_id = grid["students"][0]["enrollmentId"].as_i64().expect("enrollment");
    request_ok(
        &mut stdin,
        &mut reader,
        "mark-one",
        "attendance.bulkMark",
        json!({
            "date": newest,
            "periodIndex": 1,
            "items": [{ "enrollmentId": enrollment_id, "status": "PRESENT" }]
        }),
        lecturer_actor.clone(),
    );

    let missed = request_ok(
        &mut stdin,
        &mut reader,
        "missed-2",
        "attendance.missed",
        json!({ "lecturerId": lecturer_id }),
        lecturer_actor.clone(),
    );
    let flagged_dates: Vec<String> = missed["missed"]
        .as_array()
        .expect("missed")
        .iter()
        .map(|e| e["date"].as_str().expect("date").to_string())
        .collect();
    assert_eq!(flagged_dates.len(), 4);
    assert!(!flagged_dates.contains(&newest), "partially marked is not missed");

    // Holidays suppress the scan for that date.
    let oldest = expected_dates.first().expect("a scheduled date").clone();
    request_ok(
        &mut stdin,
        &mut reader,
        "holiday",
        "holidays.add",
        json!({ "date": oldest, "reason": "department seminar" }),
        lecturer_actor.clone(),
    );
    let missed = request_ok(
        &mut stdin,
        &mut reader,
        "missed-3",
        "attendance.missed",
        json!({ "lecturerId": lecturer_id }),
        lecturer_actor,
    );
    let flagged_dates: Vec<String> = missed["missed"]
        .as_array()
        .expect("missed")
        .iter()
        .map(|e| e["date"].as_str().expect("date").to_string())
        .collect();
    assert_eq!(flagged_dates.len(), 3);
    assert!(!flagged_dates.contains(&oldest));
}

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

// 2024-03-04 is a Monday; the school week runs through Friday 2024-03-08.
const WEEK_START: &str = "2024-03-04";
const WEEK_END: &str = "2024-03-08";

#[test]
fn report_percentages_over_an_explicit_range() {
    let workspace = temp_dir("rollbook-reports");
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
            "name": "farah hassan",
            "email": "f.hassan@college.edu",
            "collegeId": "L020",
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
        json!({ "title": "Cloud Computing", "code": "CC501" }),
        admin(),
    );
    let course_id = course["id"].as_i64().expect("course id");
    let section_a = request_ok(
        &mut stdin,
        &mut reader,
        "section-a",
        "catalog.createSection",
        json!({ "courseId": course_id, "sectionName": "A" }),
        admin(),
    )["id"]
        .as_i64()
        .expect("section id");
    let section_empty = request_ok(
        &mut stdin,
        &mut reader,
        "section-e",
        "catalog.createSection",
        json!({ "courseId": course_id, "sectionName": "E" }),
        admin(),
    )["id"]
        .as_i64()
        .expect("section id");

    for (i, section_id) in [section_a, section_empty].iter().enumerate() {
        for dow in 1..=5 {
            request_ok(
                &mut stdin,
                &mut reader,
                &format!("tt-{}-{}", i, dow),
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
    }

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "student",
        "users.create",
        json!({
            "name": "li wei",
            "email": "l.wei@college.edu",
            "collegeId": "BT2023050",
            "role": "STUDENT"
        }),
        admin(),
    );
    let student_id = student["id"].as_i64().expect("student id");
    let student_actor = json!({ "id": student_id, "role": "STUDENT" });
    request_ok(
        &mut stdin,
        &mut reader,
        "enroll",
        "import.enrollments",
        json!({ "csv": "student_college_id,course_code,section_name\nBT2023050,CC501,A" }),
        admin(),
    );
    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "grid",
        "attendance.sectionStudents",
        json!({ "sectionId": section_a, "date": WEEK_START, "periodIndex": 1 }),
        lecturer_actor.clone(),
    );
    let enrollment_id = grid["students"][0]["enrollmentId"].as_i64().expect("enrollment");

    // Past-dated marks need the admin bypass.
    for (date, status) in [
        (WEEK_START, "PRESENT"),
        ("2024-03-05", "LATE"),
        ("2024-03-06", "ABSENT"),
    ] {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark-{}", date),
            "attendance.bulkMark",
            json!({
                "date": date,
                "periodIndex": 1,
                "items": [{ "enrollmentId": enrollment_id, "status": status }]
            }),
            admin(),
        );
    }

    let reports = request_ok(
        &mut stdin,
        &mut reader,
        "reports-1",
        "reports.lecturer",
        json!({ "startDate": WEEK_START, "endDate": WEEK_END }),
        lecturer_actor.clone(),
    );
    let reports = reports["reports"].as_array().expect("reports");
    assert_eq!(reports.len(), 2);

    let for_section = |reports: &[serde_json::Value], id: i64| -> serde_json::Value {
        reports
            .iter()
            .find(|r| r["section"]["id"].as_i64() == Some(id))
            .cloned()
            .expect("section report")
    };

    // An empty section reports 100 by convention, never 0/0.
    let empty = for_section(reports, section_empty);
    assert_eq!(empty["attendancePercentage"].as_i64(), Some(100));
    assert_eq!(empty["totalPossible"].as_i64(), Some(0));

    // 5 sessions x 1 student; PRESENT + LATE count, ABSENT does not.
    let full = for_section(reports, section_a);
    assert_eq!(full["totalMarked"].as_i64(), Some(2));
    assert_eq!(full["totalPossible"].as_i64(), Some(5));
    assert_eq!(full["attendancePercentage"].as_i64(), Some(40));

    // A lecturer holiday removes that session day from the denominator.
    request_ok(
        &mut stdin,
        &mut reader,
        "holiday",
        "holidays.add",
        json!({ "date": WEEK_END, "reason": "conference" }),
        lecturer_actor.clone(),
    );
    let reports = request_ok(
        &mut stdin,
        &mut reader,
        "reports-2",
        "reports.lecturer",
        json!({ "startDate": WEEK_START, "endDate": WEEK_END }),
        lecturer_actor.clone(),
    );
    let full = for_section(reports["reports"].as_array().expect("reports"), section_a);
    assert_eq!(full["totalPossible"].as_i64(), Some(4));
    assert_eq!(full["attendancePercentage"].as_i64(), Some(50));

    // Bring the student to exactly 75%: on the warn side, not the critical one.
    request_ok(
        &mut stdin,
        &mut reader,
        "mark-thu",
        "attendance.bulkMark",
        json!({
            "date": "2024-03-07",
            "periodIndex": 1,
            "items": [{ "enrollmentId": enrollment_id, "status": "PRESENT" }]
        }),
        admin(),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "summary",
        "reports.studentSummary",
        json!({ "startDate": WEEK_START, "endDate": WEEK_END }),
        student_actor,
    );
    let summary = summary["summary"].as_array().expect("summary");
    assert_eq!(summary.len(), 1);
    let course_summary = &summary[0];
    assert_eq!(course_summary["attended"].as_i64(), Some(3));
    assert_eq!(course_summary["total"].as_i64(), Some(4));
    assert_eq!(course_summary["percentage"].as_i64(), Some(75));
    assert_eq!(course_summary["lowAttendance"].as_bool(), Some(true));
    assert_eq!(course_summary["critical"].as_bool(), Some(false));
}

#[test]
fn inverted_range_reports_no_sessions() {
    let workspace = temp_dir("rollbook-reports-inverted");
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
            "name": "noor rahman",
            "email": "n.rahman@college.edu",
            "collegeId": "L021",
            "role": "LECTURER"
        }),
        admin(),
    );
    let lecturer_id = lecturer["id"].as_i64().expect("lecturer id");
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "course",
        "catalog.createCourse",
        json!({ "title": "Full Stack Development", "code": "WD601" }),
        admin(),
    );
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "section",
        "catalog.createSection",
        json!({ "courseId": course["id"].as_i64().expect("course id"), "sectionName": "A" }),
        admin(),
    );
    let section_id = section["id"].as_i64().expect("section id");
    request_ok(
        &mut stdin,
        &mut reader,
        "tt",
        "timetable.createEntry",
        json!({
            "sectionId": section_id,
            "lecturerId": lecturer_id,
            "dayOfWeek": 1,
            "periodIndex": 1,
            "startTime": "09:00",
            "endTime": "10:00"
        }),
        admin(),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "student",
        "users.create",
        json!({
            "name": "sam toledo",
            "email": "s.toledo@college.edu",
            "collegeId": "BT2023051",
            "role": "STUDENT"
        }),
        admin(),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "enroll",
        "import.enrollments",
        json!({ "csv": "student_college_id,course_code,section_name\nBT2023051,WD601,A" }),
        admin(),
    );

    // start after end: zero possible sessions, percentage falls back to 100.
    let reports = request_ok(
        &mut stdin,
        &mut reader,
        "reports",
        "reports.lecturer",
        json!({ "startDate": WEEK_END, "endDate": WEEK_START }),
        json!({ "id": lecturer_id, "role": "LECTURER" }),
    );
    let report = &reports["reports"].as_array().expect("reports")[0];
    assert_eq!(report["totalPossible"].as_i64(), Some(0));
    assert_eq!(report["attendancePercentage"].as_i64(), Some(100));
}

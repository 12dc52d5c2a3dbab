use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::calendar;
use crate::ipc::helpers::{
    optional_i64, optional_str, require_admin, require_lecturer_or_admin, require_student,
    required_date, required_i64, required_str, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

const ENTRY_SELECT: &str = "SELECT t.id, t.section_id, t.lecturer_id, t.day_of_week,
        t.period_index, t.start_time, t.end_time,
        c.id, c.title, c.code, s.section_name
 FROM timetable_entries t
 JOIN sections s ON s.id = t.section_id
 JOIN courses c ON c.id = s.course_id";

fn entry_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "sectionId": r.get::<_, i64>(1)?,
        "lecturerId": r.get::<_, i64>(2)?,
        "dayOfWeek": r.get::<_, i64>(3)?,
        "periodIndex": r.get::<_, i64>(4)?,
        "startTime": r.get::<_, String>(5)?,
        "endTime": r.get::<_, String>(6)?,
        "course": {
            "id": r.get::<_, i64>(7)?,
            "title": r.get::<_, String>(8)?,
            "code": r.get::<_, String>(9)?,
        },
        "section": {
            "id": r.get::<_, i64>(1)?,
            "courseId": r.get::<_, i64>(7)?,
            "sectionName": r.get::<_, String>(10)?,
        }
    }))
}

fn timetable_for_lecturer(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_lecturer_or_admin(req)?;
    let date = required_date(&req.params, "date")?;
    let dow = calendar::day_of_week(date) as i64;

    let sql = format!(
        "{} WHERE t.lecturer_id = ? AND t.day_of_week = ? ORDER BY t.period_index",
        ENTRY_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map((actor.id, dow), entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "entries": entries }))
}

fn timetable_lecturer_courses(
    conn: &Connection,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_lecturer_or_admin(req)?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT c.id, c.title, c.code, s.id, s.section_name
         FROM timetable_entries t
         JOIN sections s ON s.id = t.section_id
         JOIN courses c ON c.id = s.course_id
         WHERE t.lecturer_id = ?
         ORDER BY c.code, s.section_name",
    )?;
    let courses = stmt
        .query_map([actor.id], |r| {
            let course_id: i64 = r.get(0)?;
            let section_id: i64 = r.get(3)?;
            Ok(json!({
                "id": format!("{}-{}", course_id, section_id),
                "course": {
                    "id": course_id,
                    "title": r.get::<_, String>(1)?,
                    "code": r.get::<_, String>(2)?,
                },
                "section": {
                    "id": section_id,
                    "courseId": course_id,
                    "sectionName": r.get::<_, String>(4)?,
                }
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "courses": courses }))
}

fn timetable_for_student(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_student(req)?;
    let student_id = optional_i64(&req.params, "studentId").unwrap_or(actor.id);

    let sql = format!(
        "{} WHERE t.section_id IN (SELECT section_id FROM enrollments WHERE student_id = ?)
         ORDER BY t.day_of_week, t.period_index",
        ENTRY_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([student_id], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "entries": entries }))
}

fn timetable_full(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let sql = format!("{} ORDER BY t.day_of_week, t.period_index", ENTRY_SELECT);
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "entries": entries }))
}

fn validate_day_of_week(dow: i64) -> Result<(), HandlerErr> {
    if !(0..=6).contains(&dow) {
        return Err(HandlerErr::bad_params("dayOfWeek must be 0..=6"));
    }
    Ok(())
}

fn timetable_create_entry(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let section_id = required_i64(&req.params, "sectionId")?;
    let day_of_week = required_i64(&req.params, "dayOfWeek")?;
    let period_index = required_i64(&req.params, "periodIndex")?;
    let start_time = required_str(&req.params, "startTime")?;
    let end_time = required_str(&req.params, "endTime")?;
    let lecturer_id = optional_i64(&req.params, "lecturerId").unwrap_or(-1);
    validate_day_of_week(day_of_week)?;

    let section: Option<i64> = conn
        .query_row("SELECT id FROM sections WHERE id = ?", [section_id], |r| {
            r.get(0)
        })
        .optional()?;
    if section.is_none() {
        return Err(HandlerErr::not_found("Section not found."));
    }

    conn.execute(
        "INSERT INTO timetable_entries(section_id, lecturer_id, day_of_week, period_index, start_time, end_time)
         VALUES(?, ?, ?, ?, ?, ?)",
        (section_id, lecturer_id, day_of_week, period_index, &start_time, &end_time),
    )
    .map_err(HandlerErr::db_update)?;
    Ok(json!({ "id": conn.last_insert_rowid() }))
}

fn timetable_update_entry(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_lecturer_or_admin(req)?;
    let entry_id = required_i64(&req.params, "entryId")?;

    let existing: Option<(i64, i64, i64, String, String)> = conn
        .query_row(
            "SELECT lecturer_id, day_of_week, period_index, start_time, end_time
             FROM timetable_entries WHERE id = ?",
            [entry_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((cur_lecturer, cur_dow, cur_period, cur_start, cur_end)) = existing else {
        return Err(HandlerErr::not_found("Timetable entry not found."));
    };

    let lecturer_id = optional_i64(&req.params, "lecturerId").unwrap_or(cur_lecturer);
    let day_of_week = optional_i64(&req.params, "dayOfWeek").unwrap_or(cur_dow);
    let period_index = optional_i64(&req.params, "periodIndex").unwrap_or(cur_period);
    let start_time = optional_str(&req.params, "startTime").unwrap_or(cur_start);
    let end_time = optional_str(&req.params, "endTime").unwrap_or(cur_end);
    validate_day_of_week(day_of_week)?;

    conn.execute(
        "UPDATE timetable_entries
         SET lecturer_id = ?, day_of_week = ?, period_index = ?, start_time = ?, end_time = ?
         WHERE id = ?",
        (lecturer_id, day_of_week, period_index, &start_time, &end_time, entry_id),
    )
    .map_err(HandlerErr::db_update)?;
    Ok(json!({ "id": entry_id }))
}

/// Rewrite section -> lecturer assignments from a map. A null lecturer means
/// unassigned (-1).
fn timetable_update_assignments(
    conn: &Connection,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let assignments = req
        .params
        .get("assignments")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing assignments"))?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    for (section_key, lecturer) in assignments {
        let section_id: i64 = section_key
            .parse()
            .map_err(|_| HandlerErr::bad_params("assignments keys must be section ids"))?;
        let lecturer_id = lecturer.as_i64().unwrap_or(-1);
        tx.execute(
            "UPDATE timetable_entries SET lecturer_id = ? WHERE section_id = ?",
            (lecturer_id, section_id),
        )
        .map_err(HandlerErr::db_update)?;
    }
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "success": true }))
}

fn timetable_assigned_sections(
    conn: &Connection,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let lecturer_id = required_i64(&req.params, "lecturerId")?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT section_id FROM timetable_entries WHERE lecturer_id = ? ORDER BY section_id",
    )?;
    let sections = stmt
        .query_map([lecturer_id], |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "sectionIds": sections }))
}

/// Give the lecturer every section in the list; unassign any section that was
/// previously theirs but is no longer listed.
fn timetable_update_lecturer_assignments(
    conn: &Connection,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let lecturer_id = required_i64(&req.params, "lecturerId")?;
    let section_ids: Vec<i64> = req
        .params
        .get("sectionIds")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing sectionIds"))?
        .iter()
        .filter_map(|v| v.as_i64())
        .collect();

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    tx.execute(
        "UPDATE timetable_entries SET lecturer_id = -1 WHERE lecturer_id = ?",
        [lecturer_id],
    )
    .map_err(HandlerErr::db_update)?;
    for section_id in &section_ids {
        tx.execute(
            "UPDATE timetable_entries SET lecturer_id = ? WHERE section_id = ?",
            (lecturer_id, section_id),
        )
        .map_err(HandlerErr::db_update)?;
    }
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "success": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.forLecturer" => Some(with_db(state, req, timetable_for_lecturer)),
        "timetable.lecturerCourses" => Some(with_db(state, req, timetable_lecturer_courses)),
        "timetable.forStudent" => Some(with_db(state, req, timetable_for_student)),
        "timetable.full" => Some(with_db(state, req, timetable_full)),
        "timetable.createEntry" => Some(with_db(state, req, timetable_create_entry)),
        "timetable.updateEntry" => Some(with_db(state, req, timetable_update_entry)),
        "timetable.updateAssignments" => Some(with_db(state, req, timetable_update_assignments)),
        "timetable.assignedSections" => Some(with_db(state, req, timetable_assigned_sections)),
        "timetable.updateLecturerAssignments" => {
            Some(with_db(state, req, timetable_update_lecturer_assignments))
        }
        _ => None,
    }
}

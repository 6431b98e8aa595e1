use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::grading::{
    assessment_mean, classify_achievement, parse_assessment_score, parse_weighted_percent,
    resolve_grade,
};
use crate::ipc::error::{err, grading_err, ok};
use crate::ipc::helpers::{db_conn, optional_str, require_role, required_str};
use crate::ipc::types::{AppState, Request, Role};
use crate::report;

const PENDING: &str = "pending";
const APPROVED: &str = "approved";
const REJECTED: &str = "rejected";

fn handle_submissions_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let identity = match require_role(state, req, Role::Teacher) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Assessment scores carry explicit decimals; weighted percentages are
    // bare integers. The two rules are asymmetric on purpose.
    let a1_score = match parse_assessment_score("a1Score", req.params.get("a1Score")) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    let a2_score = match parse_assessment_score("a2Score", req.params.get("a2Score")) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    let a3_score = match parse_assessment_score("a3Score", req.params.get("a3Score")) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    let percentage_20 = match parse_weighted_percent("percentage20", req.params.get("percentage20"))
    {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    let percentage_80 = match parse_weighted_percent("percentage80", req.params.get("percentage80"))
    {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    let percentage_100 =
        match parse_weighted_percent("percentage100", req.params.get("percentage100")) {
            Ok(v) => v,
            Err(e) => return grading_err(req, e),
        };
    let teacher_comment = optional_str(req, "teacherComment");

    let student_in_class: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_in_class.is_none() {
        return err(&req.id, "not_found", "student not found in class", None);
    }
    let subject_in_class: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM subjects WHERE id = ? AND class_id = ?",
            (&subject_id, &class_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if subject_in_class.is_none() {
        return err(&req.id, "not_found", "subject not found in class", None);
    }

    // Resubmission overwrites in place, but only while the existing row is
    // still pending and owned by this teacher.
    let existing: Option<(String, String, String)> = match conn
        .query_row(
            "SELECT id, teacher_id, status FROM subject_submissions
             WHERE class_id = ? AND student_id = ? AND subject_id = ?",
            (&class_id, &student_id, &subject_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some((_, ref owner, ref status)) = existing {
        if status != PENDING {
            return err(
                &req.id,
                "unauthorized",
                "submission has already been reviewed",
                Some(json!({ "status": status })),
            );
        }
        if owner != &identity.profile_id {
            return err(
                &req.id,
                "unauthorized",
                "submission belongs to another teacher",
                None,
            );
        }
    }

    let boundaries = match report::load_grade_boundaries(conn) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };

    let average_score = assessment_mean(a1_score, a2_score, a3_score);
    let grade = resolve_grade(percentage_100 as f64, &boundaries);
    let remarks = classify_achievement(percentage_100 as f64);
    let now = Utc::now().to_rfc3339();

    let submission_id = match existing {
        Some((id, _, _)) => id,
        None => Uuid::new_v4().to_string(),
    };
    if let Err(e) = conn.execute(
        "INSERT INTO subject_submissions(
           id, teacher_id, class_id, subject_id, student_id,
           a1_score, a2_score, a3_score, average_score,
           percentage_20, percentage_80, percentage_100,
           grade, remarks, teacher_comment,
           status, submitted_at, reviewed_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
         ON CONFLICT(class_id, student_id, subject_id) DO UPDATE SET
           a1_score = excluded.a1_score,
           a2_score = excluded.a2_score,
           a3_score = excluded.a3_score,
           average_score = excluded.average_score,
           percentage_20 = excluded.percentage_20,
           percentage_80 = excluded.percentage_80,
           percentage_100 = excluded.percentage_100,
           grade = excluded.grade,
           remarks = excluded.remarks,
           teacher_comment = excluded.teacher_comment,
           status = excluded.status,
           submitted_at = excluded.submitted_at,
           reviewed_at = NULL",
        params![
            &submission_id,
            &identity.profile_id,
            &class_id,
            &subject_id,
            &student_id,
            a1_score,
            a2_score,
            a3_score,
            average_score,
            percentage_20,
            percentage_80,
            percentage_100,
            &grade,
            remarks,
            &teacher_comment,
            PENDING,
            &now,
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subject_submissions" })),
        );
    }

    ok(
        &req.id,
        json!({
            "submissionId": submission_id,
            "averageScore": average_score,
            "grade": grade,
            "remarks": remarks,
            "status": PENDING
        }),
    )
}

fn handle_submissions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let identity = match require_role(state, req, Role::Teacher) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let submission_id = match required_str(req, "submissionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Ownership and pending state are row-filter conditions; zero rows
    // affected is an error, never a silent no-op.
    let deleted = match conn.execute(
        "DELETE FROM subject_submissions
         WHERE id = ? AND teacher_id = ? AND status = 'pending'",
        (&submission_id, &identity.profile_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        let exists: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM subject_submissions WHERE id = ?",
                [&submission_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        return match exists {
            None => err(&req.id, "not_found", "submission not found", None),
            Some(_) => err(
                &req.id,
                "unauthorized",
                "submission is not pending or not owned by caller",
                None,
            ),
        };
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_submissions_review(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(state, req, Role::Admin) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let submission_id = match required_str(req, "submissionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let action = match required_str(req, "action") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e,
    };
    let new_status = match action.as_str() {
        "approve" => APPROVED,
        "reject" => REJECTED,
        other => {
            return err(
                &req.id,
                "bad_params",
                "action must be one of: approve, reject",
                Some(json!({ "action": other })),
            )
        }
    };

    let now = Utc::now().to_rfc3339();
    let updated = match conn.execute(
        "UPDATE subject_submissions SET status = ?, reviewed_at = ?
         WHERE id = ? AND status = 'pending'",
        (new_status, &now, &submission_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        let status: Option<String> = match conn
            .query_row(
                "SELECT status FROM subject_submissions WHERE id = ?",
                [&submission_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        return match status {
            None => err(&req.id, "not_found", "submission not found", None),
            Some(status) => err(
                &req.id,
                "not_pending",
                "submission has already been reviewed",
                Some(json!({ "status": status })),
            ),
        };
    }

    ok(
        &req.id,
        json!({ "submissionId": submission_id, "status": new_status, "reviewedAt": now }),
    )
}

fn handle_submissions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut sql = String::from(
        "SELECT id, teacher_id, subject_id, student_id,
                a1_score, a2_score, a3_score, average_score,
                percentage_20, percentage_80, percentage_100,
                grade, remarks, teacher_comment, status, submitted_at, reviewed_at
         FROM subject_submissions
         WHERE class_id = ?",
    );
    let mut bind_values: Vec<Value> = vec![Value::Text(class_id)];
    if let Some(student_id) = optional_str(req, "studentId") {
        sql.push_str(" AND student_id = ?");
        bind_values.push(Value::Text(student_id));
    }
    if let Some(subject_id) = optional_str(req, "subjectId") {
        sql.push_str(" AND subject_id = ?");
        bind_values.push(Value::Text(subject_id));
    }
    if let Some(status) = optional_str(req, "status") {
        let status = status.to_ascii_lowercase();
        if status != PENDING && status != APPROVED && status != REJECTED {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: pending, approved, rejected",
                Some(json!({ "status": status })),
            );
        }
        sql.push_str(" AND status = ?");
        bind_values.push(Value::Text(status));
    }
    sql.push_str(" ORDER BY submitted_at, id");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "teacherId": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "studentId": r.get::<_, String>(3)?,
                "a1Score": r.get::<_, f64>(4)?,
                "a2Score": r.get::<_, f64>(5)?,
                "a3Score": r.get::<_, f64>(6)?,
                "averageScore": r.get::<_, f64>(7)?,
                "percentage20": r.get::<_, i64>(8)?,
                "percentage80": r.get::<_, i64>(9)?,
                "percentage100": r.get::<_, i64>(10)?,
                "grade": r.get::<_, String>(11)?,
                "remarks": r.get::<_, String>(12)?,
                "teacherComment": r.get::<_, Option<String>>(13)?,
                "status": r.get::<_, String>(14)?,
                "submittedAt": r.get::<_, String>(15)?,
                "reviewedAt": r.get::<_, Option<String>>(16)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(submissions) => ok(&req.id, json!({ "submissions": submissions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submissions.submit" => Some(handle_submissions_submit(state, req)),
        "submissions.delete" => Some(handle_submissions_delete(state, req)),
        "submissions.review" => Some(handle_submissions_review(state, req)),
        "submissions.list" => Some(handle_submissions_list(state, req)),
        _ => None,
    }
}

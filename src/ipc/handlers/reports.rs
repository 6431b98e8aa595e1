use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;

use crate::ipc::error::{err, grading_err, ok};
use crate::ipc::helpers::{db_conn, require_identity, require_role, required_str};
use crate::ipc::types::{AppState, Request, Role};
use crate::report::{self, ReportContext};

const GENERATION_TYPES: [&str; 3] = ["individual", "class", "stream"];

fn handle_reports_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    // Missing identity fails the whole request; per-student problems are
    // recorded in the results list instead.
    let identity = match require_identity(state, req) {
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
    let Some(student_ids_raw) = req.params.get("studentIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing studentIds[]", None);
    };
    if student_ids_raw.is_empty() {
        return err(&req.id, "bad_params", "studentIds must not be empty", None);
    }
    let mut student_ids: Vec<String> = Vec::with_capacity(student_ids_raw.len());
    for (i, v) in student_ids_raw.iter().enumerate() {
        let Some(s) = v.as_str() else {
            return err(
                &req.id,
                "bad_params",
                format!("studentIds[{}] must be a string", i),
                None,
            );
        };
        student_ids.push(s.to_string());
    }

    let generation_type = req
        .params
        .get("generationType")
        .and_then(|v| v.as_str())
        .unwrap_or("individual")
        .to_ascii_lowercase();
    if !GENERATION_TYPES.contains(&generation_type.as_str()) {
        return err(
            &req.id,
            "bad_params",
            "generationType must be one of: individual, class, stream",
            Some(json!({ "generationType": generation_type })),
        );
    }

    // The print-layout reference is recorded verbatim on the card.
    let template_id = match req.params.get("templateId") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => match v.as_i64() {
                Some(n) => Some(n.to_string()),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "templateId must be a string or integer",
                        None,
                    )
                }
            },
        },
    };

    let class_name: Option<String> = match conn
        .query_row("SELECT name FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_name) = class_name else {
        return err(&req.id, "not_found", "class not found", None);
    };

    // Config snapshots are read once and shared across the whole batch.
    let boundaries = match report::load_grade_boundaries(conn) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    let templates = match report::load_comment_templates(conn) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };

    let ctx = ReportContext {
        conn,
        class_id: &class_id,
    };

    // Students are processed one at a time; a failure is recorded and the
    // batch moves on.
    let mut results: Vec<serde_json::Value> = Vec::with_capacity(student_ids.len());
    let mut failure_count = 0usize;
    for student_id in &student_ids {
        match report::generate_report_card(
            &ctx,
            student_id,
            template_id.as_deref(),
            &identity.profile_id,
            &boundaries,
            &templates,
        ) {
            Ok(card) => results.push(json!({
                "studentId": student_id,
                "success": true,
                "reportCardId": card.report_card_id,
                "overallAverage": card.overall_average,
                "overallGrade": card.overall_grade,
                "created": card.created
            })),
            Err(e) => {
                failure_count += 1;
                results.push(json!({
                    "studentId": student_id,
                    "success": false,
                    "error": { "code": e.code, "message": e.message }
                }));
            }
        }
    }

    let generated = student_ids.len() - failure_count;
    let message = if failure_count == 0 {
        format!("generated {} report card(s)", generated)
    } else {
        format!(
            "generated {} report card(s), {} failed",
            generated, failure_count
        )
    };

    ok(
        &req.id,
        json!({
            "success": true,
            "message": message,
            "generationType": generation_type,
            "results": results,
            "classInfo": { "id": class_id, "name": class_name }
        }),
    )
}

fn handle_reports_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let card = conn
        .query_row(
            "SELECT id, overall_average, overall_grade,
                    class_teacher_comment, headteacher_comment,
                    template_id, status, generated_at, generated_by, updated_at,
                    fees_balance, fees_next_term, other_requirements,
                    term_ended_on, next_term_begins
             FROM report_cards
             WHERE student_id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "studentId": student_id,
                    "classId": class_id,
                    "overallAverage": r.get::<_, f64>(1)?,
                    "overallGrade": r.get::<_, String>(2)?,
                    "classTeacherComment": r.get::<_, Option<String>>(3)?,
                    "headteacherComment": r.get::<_, Option<String>>(4)?,
                    "templateId": r.get::<_, Option<String>>(5)?,
                    "status": r.get::<_, String>(6)?,
                    "generatedAt": r.get::<_, String>(7)?,
                    "generatedBy": r.get::<_, String>(8)?,
                    "updatedAt": r.get::<_, Option<String>>(9)?,
                    "feesBalance": r.get::<_, Option<f64>>(10)?,
                    "feesNextTerm": r.get::<_, Option<f64>>(11)?,
                    "otherRequirements": r.get::<_, Option<String>>(12)?,
                    "termEndedOn": r.get::<_, Option<String>>(13)?,
                    "nextTermBegins": r.get::<_, Option<String>>(14)?
                }))
            },
        )
        .optional();
    let card = match card {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "report card not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let ctx = ReportContext {
        conn,
        class_id: &class_id,
    };
    let subjects = match report::load_subject_lines(&ctx, &student_id) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };

    ok(&req.id, json!({ "reportCard": card, "subjects": subjects }))
}

fn handle_reports_set_admin_fields(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(state, req, Role::Admin) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let report_card_id = match required_str(req, "reportCardId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut sets: Vec<&'static str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = req.params.get("feesBalance") {
        let Some(n) = v.as_f64() else {
            return err(&req.id, "bad_params", "feesBalance must be a number", None);
        };
        sets.push("fees_balance = ?");
        bind_values.push(Value::Real(n));
    }
    if let Some(v) = req.params.get("feesNextTerm") {
        let Some(n) = v.as_f64() else {
            return err(&req.id, "bad_params", "feesNextTerm must be a number", None);
        };
        sets.push("fees_next_term = ?");
        bind_values.push(Value::Real(n));
    }
    if let Some(v) = req.params.get("otherRequirements") {
        let Some(s) = v.as_str() else {
            return err(
                &req.id,
                "bad_params",
                "otherRequirements must be a string",
                None,
            );
        };
        sets.push("other_requirements = ?");
        bind_values.push(Value::Text(s.to_string()));
    }
    if let Some(v) = req.params.get("termEndedOn") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "termEndedOn must be a string", None);
        };
        sets.push("term_ended_on = ?");
        bind_values.push(Value::Text(s.to_string()));
    }
    if let Some(v) = req.params.get("nextTermBegins") {
        let Some(s) = v.as_str() else {
            return err(
                &req.id,
                "bad_params",
                "nextTermBegins must be a string",
                None,
            );
        };
        sets.push("next_term_begins = ?");
        bind_values.push(Value::Text(s.to_string()));
    }
    if let Some(v) = req.params.get("status") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "status must be a string", None);
        };
        let s = s.to_ascii_lowercase();
        if s != "draft" && s != "published" {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: draft, published",
                Some(json!({ "status": s })),
            );
        }
        sets.push("status = ?");
        bind_values.push(Value::Text(s));
    }

    if sets.is_empty() {
        return err(&req.id, "bad_params", "no fields to update", None);
    }

    sets.push("updated_at = ?");
    bind_values.push(Value::Text(Utc::now().to_rfc3339()));
    bind_values.push(Value::Text(report_card_id.clone()));

    let sql = format!(
        "UPDATE report_cards SET {} WHERE id = ?",
        sets.join(", ")
    );
    match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(0) => err(&req.id, "not_found", "report card not found", None),
        Ok(_) => ok(&req.id, json!({ "reportCardId": report_card_id })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.generate" => Some(handle_reports_generate(state, req)),
        "reports.get" => Some(handle_reports_get(state, req)),
        "reports.setAdminFields" => Some(handle_reports_set_admin_fields(state, req)),
        _ => None,
    }
}

use serde_json::json;
use uuid::Uuid;

use crate::grading;
use crate::ipc::error::{err, grading_err, ok};
use crate::ipc::helpers::{db_conn, optional_str, require_role, required_str};
use crate::ipc::types::{AppState, Request, Role};

fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing/invalid {}", key), None))
}

fn handle_boundaries_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(state, req, Role::Admin) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade = match required_str(req, "grade") {
        Ok(v) => v.trim().to_ascii_uppercase(),
        Err(e) => return e,
    };
    let min_score = match required_f64(req, "minScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_score = match required_f64(req, "maxScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let boundary_id = optional_str(req, "boundaryId");

    if let Err(e) = grading::validate_boundary(&grade, min_score, max_score) {
        return grading_err(req, e);
    }

    // The write side is the only overlap guard; the resolver trusts the
    // configured set blindly.
    let mut stmt = match conn.prepare("SELECT id, grade, min_score, max_score FROM grade_boundaries")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let existing = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let existing = match existing {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    for (other_id, other_grade, other_min, other_max) in &existing {
        if boundary_id.as_deref() == Some(other_id.as_str()) {
            continue;
        }
        if grading::ranges_overlap(min_score, max_score, *other_min, *other_max) {
            return err(
                &req.id,
                "bad_params",
                "boundary range overlaps an existing boundary",
                Some(json!({
                    "grade": grade,
                    "conflictsWith": { "grade": other_grade, "minScore": other_min, "maxScore": other_max }
                })),
            );
        }
    }

    match boundary_id {
        Some(boundary_id) => {
            let updated = conn.execute(
                "UPDATE grade_boundaries SET grade = ?, min_score = ?, max_score = ? WHERE id = ?",
                (&grade, min_score, max_score, &boundary_id),
            );
            match updated {
                Ok(0) => err(&req.id, "not_found", "boundary not found", None),
                Ok(_) => ok(&req.id, json!({ "boundaryId": boundary_id })),
                Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
            }
        }
        None => {
            let boundary_id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO grade_boundaries(id, grade, min_score, max_score) VALUES(?, ?, ?, ?)",
                (&boundary_id, &grade, min_score, max_score),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "grade_boundaries" })),
                );
            }
            ok(&req.id, json!({ "boundaryId": boundary_id }))
        }
    }
}

fn handle_boundaries_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(state, req, Role::Admin) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let boundary_id = match required_str(req, "boundaryId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match conn.execute("DELETE FROM grade_boundaries WHERE id = ?", [&boundary_id]) {
        Ok(0) => err(&req.id, "not_found", "boundary not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

fn handle_boundaries_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, grade, min_score, max_score FROM grade_boundaries ORDER BY min_score",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let grade: String = r.get(1)?;
            let min_score: f64 = r.get(2)?;
            let max_score: f64 = r.get(3)?;
            Ok(json!({
                "id": id,
                "grade": grade,
                "minScore": min_score,
                "maxScore": max_score
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(boundaries) => ok(&req.id, json!({ "boundaries": boundaries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_templates_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(state, req, Role::Admin) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let min_percentage =
        match grading::parse_weighted_percent("minPercentage", req.params.get("minPercentage")) {
            Ok(v) => v,
            Err(e) => return grading_err(req, e),
        };
    let max_percentage =
        match grading::parse_weighted_percent("maxPercentage", req.params.get("maxPercentage")) {
            Ok(v) => v,
            Err(e) => return grading_err(req, e),
        };
    if min_percentage > max_percentage {
        return err(
            &req.id,
            "bad_params",
            "minPercentage must not exceed maxPercentage",
            Some(json!({ "minPercentage": min_percentage, "maxPercentage": max_percentage })),
        );
    }
    let class_teacher_comment = match required_str(req, "classTeacherComment") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let headteacher_comment = match required_str(req, "headteacherComment") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Unlike grade boundaries, template ranges are allowed to overlap;
    // the matcher's read order decides ties.
    match optional_str(req, "templateId") {
        Some(template_id) => {
            let updated = conn.execute(
                "UPDATE comment_templates SET
                   min_percentage = ?, max_percentage = ?,
                   class_teacher_comment = ?, headteacher_comment = ?
                 WHERE id = ?",
                (
                    min_percentage,
                    max_percentage,
                    &class_teacher_comment,
                    &headteacher_comment,
                    &template_id,
                ),
            );
            match updated {
                Ok(0) => err(&req.id, "not_found", "template not found", None),
                Ok(_) => ok(&req.id, json!({ "templateId": template_id })),
                Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
            }
        }
        None => {
            let template_id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO comment_templates(
                   id, min_percentage, max_percentage,
                   class_teacher_comment, headteacher_comment
                 ) VALUES(?, ?, ?, ?, ?)",
                (
                    &template_id,
                    min_percentage,
                    max_percentage,
                    &class_teacher_comment,
                    &headteacher_comment,
                ),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "comment_templates" })),
                );
            }
            ok(&req.id, json!({ "templateId": template_id }))
        }
    }
}

fn handle_templates_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(state, req, Role::Admin) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let template_id = match required_str(req, "templateId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match conn.execute("DELETE FROM comment_templates WHERE id = ?", [&template_id]) {
        Ok(0) => err(&req.id, "not_found", "template not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

fn handle_templates_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, min_percentage, max_percentage, class_teacher_comment, headteacher_comment
         FROM comment_templates
         ORDER BY min_percentage, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let min_percentage: i64 = r.get(1)?;
            let max_percentage: i64 = r.get(2)?;
            let class_teacher_comment: String = r.get(3)?;
            let headteacher_comment: String = r.get(4)?;
            Ok(json!({
                "id": id,
                "minPercentage": min_percentage,
                "maxPercentage": max_percentage,
                "classTeacherComment": class_teacher_comment,
                "headteacherComment": headteacher_comment
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(templates) => ok(&req.id, json!({ "templates": templates })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradeBoundaries.upsert" => Some(handle_boundaries_upsert(state, req)),
        "gradeBoundaries.delete" => Some(handle_boundaries_delete(state, req)),
        "gradeBoundaries.list" => Some(handle_boundaries_list(state, req)),
        "commentTemplates.upsert" => Some(handle_templates_upsert(state, req)),
        "commentTemplates.delete" => Some(handle_templates_delete(state, req)),
        "commentTemplates.list" => Some(handle_templates_list(state, req)),
        _ => None,
    }
}

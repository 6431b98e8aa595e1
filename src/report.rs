use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::grading::{
    self, match_comment, resolve_grade, round_off_2_decimals, CommentTemplate, GradeBoundary,
    GradingError,
};

/// Only status the aggregation engine ever writes. `draft`/`published`
/// belong to the admin edit surface and are never touched here.
pub const GENERATED_STATUS: &str = "generated";

#[derive(Debug, Clone)]
pub struct ReportContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedCard {
    pub report_card_id: String,
    pub overall_average: f64,
    pub overall_grade: String,
    pub created: bool,
}

/// Snapshot of the admin-configured boundary set, read once per request
/// and passed into the pure resolver.
pub fn load_grade_boundaries(conn: &Connection) -> Result<Vec<GradeBoundary>, GradingError> {
    let mut stmt = conn
        .prepare("SELECT grade, min_score, max_score FROM grade_boundaries ORDER BY min_score")
        .map_err(|e| GradingError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([], |r| {
        Ok(GradeBoundary {
            grade: r.get(0)?,
            min_score: r.get(1)?,
            max_score: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| GradingError::new("db_query_failed", e.to_string()))
}

/// Templates are not overlap-checked on write, so the read order is the
/// tie-break: ascending min_percentage, then id. First match wins.
pub fn load_comment_templates(conn: &Connection) -> Result<Vec<CommentTemplate>, GradingError> {
    let mut stmt = conn
        .prepare(
            "SELECT min_percentage, max_percentage, class_teacher_comment, headteacher_comment
             FROM comment_templates
             ORDER BY min_percentage, id",
        )
        .map_err(|e| GradingError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([], |r| {
        Ok(CommentTemplate {
            min_percentage: r.get(0)?,
            max_percentage: r.get(1)?,
            class_teacher_comment: r.get(2)?,
            headteacher_comment: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| GradingError::new("db_query_failed", e.to_string()))
}

/// Generate (or regenerate) the report card for one student.
///
/// Only `approved` submissions feed the overall average; zero approved
/// rows is a valid card with average 0. Regeneration rewrites the computed
/// columns and leaves the admin-entered financial and term-date columns
/// exactly as they are.
pub fn generate_report_card(
    ctx: &ReportContext<'_>,
    student_id: &str,
    template_id: Option<&str>,
    generated_by: &str,
    boundaries: &[GradeBoundary],
    templates: &[CommentTemplate],
) -> Result<GeneratedCard, GradingError> {
    let conn = ctx.conn;
    let class_id = ctx.class_id;

    let student_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (student_id, class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| GradingError::new("db_query_failed", e.to_string()))?;
    if student_exists.is_none() {
        return Err(GradingError::with_details(
            "not_found",
            "student not found in class",
            json!({ "studentId": student_id }),
        ));
    }

    let mut stmt = conn
        .prepare(
            "SELECT percentage_100 FROM subject_submissions
             WHERE class_id = ? AND student_id = ? AND status = 'approved'",
        )
        .map_err(|e| GradingError::new("db_query_failed", e.to_string()))?;
    let percentages: Vec<i64> = stmt
        .query_map((class_id, student_id), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| GradingError::new("db_query_failed", e.to_string()))?;

    let overall_average = if percentages.is_empty() {
        0.0
    } else {
        let sum: i64 = percentages.iter().sum();
        round_off_2_decimals(sum as f64 / percentages.len() as f64)
    };
    let overall_grade = resolve_grade(overall_average, boundaries);
    let comment = match_comment(overall_average, templates);
    let (class_teacher_comment, headteacher_comment) = match comment {
        Some(c) => (Some(c.class_teacher_comment), Some(c.headteacher_comment)),
        None => (None, None),
    };

    let existing_id: Option<String> = conn
        .query_row(
            "SELECT id FROM report_cards WHERE student_id = ? AND class_id = ?",
            (student_id, class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| GradingError::new("db_query_failed", e.to_string()))?;

    let now = Utc::now().to_rfc3339();

    match existing_id {
        Some(report_card_id) => {
            conn.execute(
                "UPDATE report_cards SET
                   overall_average = ?,
                   overall_grade = ?,
                   class_teacher_comment = ?,
                   headteacher_comment = ?,
                   template_id = ?,
                   status = ?,
                   generated_at = ?,
                   generated_by = ?,
                   updated_at = ?
                 WHERE id = ?",
                (
                    overall_average,
                    &overall_grade,
                    &class_teacher_comment,
                    &headteacher_comment,
                    template_id,
                    GENERATED_STATUS,
                    &now,
                    generated_by,
                    &now,
                    &report_card_id,
                ),
            )
            .map_err(|e| GradingError::new("db_update_failed", e.to_string()))?;

            Ok(GeneratedCard {
                report_card_id,
                overall_average,
                overall_grade,
                created: false,
            })
        }
        None => {
            let report_card_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO report_cards(
                   id, student_id, class_id,
                   overall_average, overall_grade,
                   class_teacher_comment, headteacher_comment,
                   template_id, status, generated_at, generated_by, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &report_card_id,
                    student_id,
                    class_id,
                    overall_average,
                    &overall_grade,
                    &class_teacher_comment,
                    &headteacher_comment,
                    template_id,
                    GENERATED_STATUS,
                    &now,
                    generated_by,
                    &now,
                ),
            )
            .map_err(|e| GradingError::new("db_insert_failed", e.to_string()))?;

            Ok(GeneratedCard {
                report_card_id,
                overall_average,
                overall_grade,
                created: true,
            })
        }
    }
}

/// Per-subject row for the printed report, derived from an approved
/// submission. The identifier column uses its own banding, not the
/// achievement thresholds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject_id: String,
    pub subject_name: String,
    pub a1_score: f64,
    pub a2_score: f64,
    pub a3_score: f64,
    pub average_score: f64,
    pub percentage_20: i64,
    pub percentage_80: i64,
    pub percentage_100: i64,
    pub grade: String,
    pub identifier: i64,
    pub remarks: String,
    pub teacher_comment: Option<String>,
}

pub fn load_subject_lines(
    ctx: &ReportContext<'_>,
    student_id: &str,
) -> Result<Vec<SubjectLine>, GradingError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT s.subject_id, sub.name,
                    s.a1_score, s.a2_score, s.a3_score, s.average_score,
                    s.percentage_20, s.percentage_80, s.percentage_100,
                    s.grade, s.remarks, s.teacher_comment
             FROM subject_submissions s
             JOIN subjects sub ON sub.id = s.subject_id
             WHERE s.class_id = ? AND s.student_id = ? AND s.status = 'approved'
             ORDER BY sub.name",
        )
        .map_err(|e| GradingError::new("db_query_failed", e.to_string()))?;

    stmt.query_map((ctx.class_id, student_id), |r| {
        let percentage_100: i64 = r.get(8)?;
        Ok(SubjectLine {
            subject_id: r.get(0)?,
            subject_name: r.get(1)?,
            a1_score: r.get(2)?,
            a2_score: r.get(3)?,
            a3_score: r.get(4)?,
            average_score: r.get(5)?,
            percentage_20: r.get(6)?,
            percentage_80: r.get(7)?,
            percentage_100,
            grade: r.get(9)?,
            identifier: grading::report_identifier(percentage_100 as f64),
            remarks: r.get(10)?,
            teacher_comment: r.get(11)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| GradingError::new("db_query_failed", e.to_string()))
}

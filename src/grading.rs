use serde::{Deserialize, Serialize};
use serde_json::json;

/// 2-decimal rounding used everywhere a mark is persisted:
/// `Int(100*x + 0.5) / 100`
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Mean of the three raw assessment scores, rounded to 2 decimals.
pub fn assessment_mean(a1: f64, a2: f64, a3: f64) -> f64 {
    round_off_2_decimals((a1 + a2 + a3) / 3.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBoundary {
    pub grade: String,
    pub min_score: f64,
    pub max_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentTemplate {
    pub min_percentage: i64,
    pub max_percentage: i64,
    pub class_teacher_comment: String,
    pub headteacher_comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentPair {
    pub class_teacher_comment: String,
    pub headteacher_comment: String,
}

pub const FALLBACK_GRADE: &str = "F";

/// First boundary covering the percentage wins. The admin write path keeps
/// the configured set non-overlapping, so at most one boundary can match.
pub fn resolve_grade(percentage: f64, boundaries: &[GradeBoundary]) -> String {
    for b in boundaries {
        if percentage >= b.min_score && percentage <= b.max_score {
            return b.grade.clone();
        }
    }
    FALLBACK_GRADE.to_string()
}

/// Textual achievement band printed in the submission "remarks" column.
/// Thresholds are fixed, not admin-configurable.
pub fn classify_achievement(percentage: f64) -> &'static str {
    if percentage >= 90.0 {
        "Outstanding"
    } else if percentage >= 75.0 {
        "Exceptional"
    } else if percentage >= 60.0 {
        "Satisfactory"
    } else {
        "Basic"
    }
}

/// Numeric 0-3 code for the per-subject "Ident" column on the printed
/// report. Distinct banding from `classify_achievement`; the two schemes
/// are not interchangeable.
pub fn report_identifier(percentage: f64) -> i64 {
    if percentage >= 80.0 {
        3
    } else if percentage >= 70.0 {
        2
    } else if percentage >= 40.0 {
        1
    } else {
        0
    }
}

/// Templates must already be ordered by (min_percentage, id); the first
/// covering template wins, which makes overlapping templates deterministic.
pub fn match_comment(overall_average: f64, templates: &[CommentTemplate]) -> Option<CommentPair> {
    templates
        .iter()
        .find(|t| {
            overall_average >= t.min_percentage as f64 && overall_average <= t.max_percentage as f64
        })
        .map(|t| CommentPair {
            class_teacher_comment: t.class_teacher_comment.clone(),
            headteacher_comment: t.headteacher_comment.clone(),
        })
}

#[derive(Debug, Clone, Serialize)]
pub struct GradingError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GradingError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

pub fn ranges_overlap(a_min: f64, a_max: f64, b_min: f64, b_max: f64) -> bool {
    a_min <= b_max && b_min <= a_max
}

/// Write-side invariant for a single boundary row. Overlap against the
/// rest of the configured set is checked separately by the handler.
pub fn validate_boundary(grade: &str, min_score: f64, max_score: f64) -> Result<(), GradingError> {
    if grade.chars().count() != 1 || !grade.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(GradingError::with_details(
            "bad_params",
            "grade must be a single letter",
            json!({ "grade": grade }),
        ));
    }
    if !(0.0..=100.0).contains(&min_score) || !(0.0..=100.0).contains(&max_score) {
        return Err(GradingError::with_details(
            "bad_params",
            "boundary scores must be within 0..=100",
            json!({ "minScore": min_score, "maxScore": max_score }),
        ));
    }
    if min_score >= max_score {
        return Err(GradingError::with_details(
            "bad_params",
            "minScore must be less than maxScore",
            json!({ "minScore": min_score, "maxScore": max_score }),
        ));
    }
    Ok(())
}

/// A1/A2/A3 must be written with an explicit decimal fraction. On the JSON
/// wire that means the number token itself carries a fraction (`85.0`, not
/// `85`); the single exception is a bare `0`.
pub fn parse_assessment_score(
    field: &str,
    value: Option<&serde_json::Value>,
) -> Result<f64, GradingError> {
    let Some(value) = value else {
        return Err(GradingError::new("bad_params", format!("missing {}", field)));
    };
    let Some(n) = value.as_f64() else {
        return Err(GradingError::with_details(
            "bad_params",
            format!("{} must be a number", field),
            json!({ "field": field }),
        ));
    };
    if n < 0.0 {
        return Err(GradingError::with_details(
            "bad_params",
            format!("{} must not be negative", field),
            json!({ "field": field, "value": n }),
        ));
    }
    if value.is_i64() || value.is_u64() {
        if value.as_i64() == Some(0) {
            return Ok(0.0);
        }
        return Err(GradingError::with_details(
            "bad_params",
            format!("{} must include a decimal fraction (e.g. 85.0)", field),
            json!({ "field": field, "value": value }),
        ));
    }
    Ok(n)
}

/// The weighted 20/80/100 percentages are whole numbers; a decimal point
/// anywhere in the value is rejected.
pub fn parse_weighted_percent(
    field: &str,
    value: Option<&serde_json::Value>,
) -> Result<i64, GradingError> {
    let Some(value) = value else {
        return Err(GradingError::new("bad_params", format!("missing {}", field)));
    };
    let Some(n) = value.as_i64() else {
        return Err(GradingError::with_details(
            "bad_params",
            format!("{} must be an integer with no decimal point", field),
            json!({ "field": field, "value": value }),
        ));
    };
    if !(0..=100).contains(&n) {
        return Err(GradingError::with_details(
            "bad_params",
            format!("{} must be within 0..=100", field),
            json!({ "field": field, "value": n }),
        ));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundaries() -> Vec<GradeBoundary> {
        let mk = |grade: &str, min: f64, max: f64| GradeBoundary {
            grade: grade.to_string(),
            min_score: min,
            max_score: max,
        };
        vec![
            mk("A", 80.0, 100.0),
            mk("B", 70.0, 79.99),
            mk("C", 60.0, 69.99),
            mk("D", 40.0, 59.99),
        ]
    }

    #[test]
    fn round_off_matches_persisted_precision() {
        assert_eq!(round_off_2_decimals(0.0), 0.0);
        assert_eq!(round_off_2_decimals(85.166_666), 85.17);
        assert_eq!(round_off_2_decimals(85.164_999), 85.16);
        assert_eq!(round_off_2_decimals(79.995), 80.0);
    }

    #[test]
    fn assessment_mean_rounds_to_two_decimals() {
        assert_eq!(assessment_mean(80.0, 85.5, 90.0), 85.17);
        assert_eq!(assessment_mean(0.0, 0.0, 0.0), 0.0);
        assert_eq!(assessment_mean(100.0, 100.0, 100.0), 100.0);
    }

    #[test]
    fn resolve_grade_first_covering_boundary_wins() {
        let b = boundaries();
        assert_eq!(resolve_grade(80.0, &b), "A");
        assert_eq!(resolve_grade(79.99, &b), "B");
        assert_eq!(resolve_grade(60.0, &b), "C");
        assert_eq!(resolve_grade(100.0, &b), "A");
    }

    #[test]
    fn resolve_grade_falls_back_to_f() {
        let b = boundaries();
        assert_eq!(resolve_grade(12.5, &b), "F");
        assert_eq!(resolve_grade(0.0, &b), "F");
        assert_eq!(resolve_grade(50.0, &[]), "F");
    }

    #[test]
    fn achievement_bands_are_monotonic_across_thresholds() {
        assert_eq!(classify_achievement(90.0), "Outstanding");
        assert_eq!(classify_achievement(89.99), "Exceptional");
        assert_eq!(classify_achievement(75.0), "Exceptional");
        assert_eq!(classify_achievement(74.99), "Satisfactory");
        assert_eq!(classify_achievement(60.0), "Satisfactory");
        assert_eq!(classify_achievement(59.99), "Basic");
        assert_eq!(classify_achievement(0.0), "Basic");
    }

    #[test]
    fn report_identifier_uses_its_own_banding() {
        assert_eq!(report_identifier(80.0), 3);
        assert_eq!(report_identifier(79.99), 2);
        assert_eq!(report_identifier(70.0), 2);
        assert_eq!(report_identifier(69.99), 1);
        assert_eq!(report_identifier(40.0), 1);
        assert_eq!(report_identifier(39.99), 0);
        // The two schemes disagree between 60 and 70.
        assert_eq!(classify_achievement(65.0), "Satisfactory");
        assert_eq!(report_identifier(65.0), 1);
    }

    #[test]
    fn match_comment_returns_first_covering_template() {
        let mk = |min: i64, max: i64, ct: &str, ht: &str| CommentTemplate {
            min_percentage: min,
            max_percentage: max,
            class_teacher_comment: ct.to_string(),
            headteacher_comment: ht.to_string(),
        };
        // Sorted by min_percentage; the 50..=80 template shadows 60..=100
        // for any average in the overlap.
        let templates = vec![
            mk(50, 80, "Keep it up", "Good effort"),
            mk(60, 100, "Excellent work", "Outstanding term"),
        ];
        let hit = match_comment(65.0, &templates).expect("template should match");
        assert_eq!(hit.class_teacher_comment, "Keep it up");
        let hit = match_comment(90.0, &templates).expect("template should match");
        assert_eq!(hit.class_teacher_comment, "Excellent work");
        assert!(match_comment(20.0, &templates).is_none());
    }

    #[test]
    fn boundary_validation_rejects_bad_rows() {
        assert!(validate_boundary("A", 80.0, 100.0).is_ok());
        assert!(validate_boundary("AB", 80.0, 100.0).is_err());
        assert!(validate_boundary("", 80.0, 100.0).is_err());
        assert!(validate_boundary("A", 90.0, 80.0).is_err());
        assert!(validate_boundary("A", -1.0, 50.0).is_err());
        assert!(validate_boundary("A", 50.0, 101.0).is_err());
    }

    #[test]
    fn assessment_scores_require_explicit_decimals() {
        let ok = parse_assessment_score("a1", Some(&serde_json::json!(85.5)));
        assert_eq!(ok.expect("decimal accepted"), 85.5);

        // A fractionless decimal token still counts as decimal on the wire.
        let ok = parse_assessment_score("a1", Some(&serde_json::json!(85.0)));
        assert_eq!(ok.expect("decimal accepted"), 85.0);

        let err = parse_assessment_score("a1", Some(&serde_json::json!(85)));
        assert_eq!(err.expect_err("bare integer rejected").code, "bad_params");

        // Exactly zero is the one permitted bare integer.
        let ok = parse_assessment_score("a1", Some(&serde_json::json!(0)));
        assert_eq!(ok.expect("bare zero accepted"), 0.0);

        assert!(parse_assessment_score("a1", Some(&serde_json::json!(-3.5))).is_err());
        assert!(parse_assessment_score("a1", None).is_err());
    }

    #[test]
    fn weighted_percentages_must_be_integers() {
        let ok = parse_weighted_percent("percentage100", Some(&serde_json::json!(85)));
        assert_eq!(ok.expect("integer accepted"), 85);

        let err = parse_weighted_percent("percentage100", Some(&serde_json::json!(85.5)));
        assert_eq!(err.expect_err("fraction rejected").code, "bad_params");

        let err = parse_weighted_percent("percentage100", Some(&serde_json::json!(85.0)));
        assert!(err.is_err(), "decimal token rejected even when whole");

        assert!(parse_weighted_percent("percentage20", Some(&serde_json::json!(101))).is_err());
        assert!(parse_weighted_percent("percentage20", Some(&serde_json::json!(-1))).is_err());
    }
}

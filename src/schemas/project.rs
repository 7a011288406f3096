use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use time::{
    format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime,
    PrimitiveDateTime,
};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::Project;
use crate::db::types::{ProjectStatus, QuestionType};

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ProjectCreate {
    #[validate(length(min = 1, message = "title must not be empty"))]
    pub(crate) title: String,
    #[serde(
        default,
        alias = "startTime",
        deserialize_with = "deserialize_option_offset_datetime_flexible"
    )]
    pub(crate) start_time: Option<OffsetDateTime>,
    #[serde(
        default,
        alias = "endTime",
        deserialize_with = "deserialize_option_offset_datetime_flexible"
    )]
    pub(crate) end_time: Option<OffsetDateTime>,
    #[serde(alias = "totalTimeMinutes")]
    #[validate(range(min = 1, message = "total_time_minutes must be positive"))]
    pub(crate) total_time_minutes: i32,
    #[serde(default = "default_variant_count", alias = "variantCount")]
    #[validate(range(min = 1, max = 100, message = "variant_count must be between 1 and 100"))]
    pub(crate) variant_count: i32,
    #[serde(default, alias = "maxStudents")]
    #[validate(range(min = 1, message = "max_students must be positive"))]
    pub(crate) max_students: Option<i32>,
    #[serde(default, alias = "allowedStudentEmails")]
    pub(crate) allowed_student_emails: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProjectResponse {
    pub(crate) id: String,
    pub(crate) owner_id: String,
    pub(crate) title: String,
    pub(crate) status: ProjectStatus,
    pub(crate) start_time: Option<String>,
    pub(crate) end_time: Option<String>,
    pub(crate) total_time_minutes: i32,
    pub(crate) variant_count: i32,
    pub(crate) max_students: Option<i32>,
    pub(crate) allowed_student_emails: Vec<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl From<Project> for ProjectResponse {
    fn from(project: Project) -> Self {
        Self {
            id: project.id,
            owner_id: project.owner_id,
            title: project.title,
            status: project.status,
            start_time: project.start_time.map(format_primitive),
            end_time: project.end_time.map(format_primitive),
            total_time_minutes: project.total_time_minutes,
            variant_count: project.variant_count,
            max_students: project.max_students,
            allowed_student_emails: project.allowed_student_emails.0,
            created_at: format_primitive(project.created_at),
            updated_at: format_primitive(project.updated_at),
        }
    }
}

/// One generated question as deposited by the generation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QuestionInput {
    #[serde(alias = "questionType", alias = "type")]
    pub(crate) question_type: QuestionType,
    pub(crate) text: String,
    #[serde(default = "default_points")]
    pub(crate) points: f64,
    #[serde(default)]
    pub(crate) options: serde_json::Value,
    #[serde(default, alias = "correctAnswer")]
    pub(crate) correct_answer: serde_json::Value,
    #[serde(default, alias = "expectedKeywords")]
    pub(crate) expected_keywords: Vec<String>,
    #[serde(default)]
    pub(crate) rubric: Option<String>,
    #[serde(default)]
    pub(crate) order: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct VariantSetInput {
    #[serde(alias = "variantNumber")]
    pub(crate) variant_number: i32,
    pub(crate) questions: Vec<QuestionInput>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct VariantSetsImport {
    #[serde(alias = "variantSets")]
    #[validate(length(min = 1, message = "variant_sets must not be empty"))]
    pub(crate) variant_sets: Vec<VariantSetInput>,
}

#[derive(Debug, Serialize)]
pub(crate) struct VariantSetsImported {
    pub(crate) project_id: String,
    pub(crate) variant_count: i32,
    pub(crate) question_count: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TransitionRequest {
    pub(crate) target: ProjectStatus,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KickRequest {
    #[serde(alias = "studentId")]
    pub(crate) student_id: String,
}

fn default_variant_count() -> i32 {
    1
}

fn default_points() -> f64 {
    1.0
}

fn parse_offset_datetime_flexible(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(value) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(value);
    }

    // datetime-local inputs arrive without an offset; they are read as UTC.
    if let Ok(value) =
        PrimitiveDateTime::parse(raw, &format_description!("[year]-[month]-[day]T[hour]:[minute]"))
    {
        return Some(value.assume_utc());
    }
    if let Ok(value) = PrimitiveDateTime::parse(
        raw,
        &format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    ) {
        return Some(value.assume_utc());
    }

    None
}

fn deserialize_option_offset_datetime_flexible<'de, D>(
    deserializer: D,
) -> Result<Option<OffsetDateTime>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        Some(value) => parse_offset_datetime_flexible(&value)
            .ok_or_else(|| D::Error::custom(format!("invalid datetime: {value}")))
            .map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn project_create_accepts_camel_case_and_local_times() {
        let payload: ProjectCreate = serde_json::from_value(json!({
            "title": "Midterm",
            "startTime": "2025-05-01T10:00",
            "endTime": "2025-05-01T12:00:00+02:00",
            "totalTimeMinutes": 45,
            "variantCount": 3,
            "allowedStudentEmails": ["a@example.com"]
        }))
        .unwrap();

        assert_eq!(payload.start_time, Some(datetime!(2025-05-01 10:00:00 UTC)));
        assert_eq!(payload.end_time, Some(datetime!(2025-05-01 10:00:00 UTC)));
        assert_eq!(payload.variant_count, 3);
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn project_create_rejects_zero_budget() {
        let payload: ProjectCreate =
            serde_json::from_value(json!({"title": "Quiz", "total_time_minutes": 0})).unwrap();
        assert!(payload.validate().is_err());
    }

    #[test]
    fn question_input_defaults() {
        let input: QuestionInput =
            serde_json::from_value(json!({"type": "essay", "text": "Explain osmosis"})).unwrap();
        assert_eq!(input.question_type, QuestionType::Essay);
        assert_eq!(input.points, 1.0);
        assert!(input.correct_answer.is_null());
    }

    #[test]
    fn variant_sets_import_requires_at_least_one_set() {
        let empty: VariantSetsImport =
            serde_json::from_value(json!({"variantSets": []})).unwrap();
        let err = empty.validate().unwrap_err();
        assert!(err.to_string().contains("variant_sets must not be empty"));

        let one: VariantSetsImport = serde_json::from_value(json!({
            "variant_sets": [{"variant_number": 1, "questions": [{"type": "essay", "text": "Why?"}]}]
        }))
        .unwrap();
        assert!(one.validate().is_ok());
    }
}

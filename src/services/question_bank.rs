use std::collections::BTreeSet;

use sqlx::types::Json;
use uuid::Uuid;

use crate::db::models::{Project, Question};
use crate::db::types::{ProjectStatus, QuestionType};
use crate::repositories::ExamStore;
use crate::schemas::project::{QuestionInput, VariantSetInput};
use crate::schemas::session::QuestionView;
use crate::services::errors::ExamError;

/// The immutable question list of one variant. Every score ceiling is derived
/// from this type, never from the project's full question pool.
#[derive(Debug, Clone)]
pub(crate) struct VariantQuestionSet {
    project_id: String,
    variant_number: i32,
    questions: Vec<Question>,
}

impl VariantQuestionSet {
    pub(crate) async fn load(
        store: &dyn ExamStore,
        project_id: &str,
        variant_number: i32,
    ) -> Result<Self, ExamError> {
        let questions = store.list_variant_questions(project_id, variant_number).await?;
        Self::from_questions(project_id, variant_number, questions)
    }

    pub(crate) fn from_questions(
        project_id: &str,
        variant_number: i32,
        questions: Vec<Question>,
    ) -> Result<Self, ExamError> {
        let foreign = questions
            .iter()
            .any(|q| q.project_id != project_id || q.variant_number != variant_number);
        if questions.is_empty() || foreign {
            return Err(ExamError::VariantDataMissing {
                project_id: project_id.to_string(),
                variant_number,
            });
        }

        Ok(Self { project_id: project_id.to_string(), variant_number, questions })
    }

    pub(crate) fn project_id(&self) -> &str {
        &self.project_id
    }

    pub(crate) fn variant_number(&self) -> i32 {
        self.variant_number
    }

    pub(crate) fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub(crate) fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|question| question.id == question_id)
    }

    pub(crate) fn max_score(&self) -> f64 {
        self.questions.iter().map(|question| question.points).sum()
    }

    /// Student-facing copy with correct answers, keywords and rubrics removed.
    pub(crate) fn student_view(&self) -> Vec<QuestionView> {
        self.questions
            .iter()
            .map(|question| QuestionView {
                id: question.id.clone(),
                order: question.order_index,
                question_type: question.question_type,
                text: question.text.clone(),
                points: question.points,
                options: question.options.0.clone(),
            })
            .collect()
    }
}

/// Validates and stores the generator output for a project in one write.
pub(crate) async fn import_variant_sets(
    store: &dyn ExamStore,
    project: &Project,
    sets: Vec<VariantSetInput>,
) -> Result<usize, ExamError> {
    if !matches!(project.status, ProjectStatus::Draft | ProjectStatus::Ready) {
        return Err(ExamError::VariantSetsLocked);
    }

    let questions = build_questions(project, sets)?;
    let count = questions.len();

    if !store.insert_variant_sets(&project.id, questions).await? {
        return Err(ExamError::VariantSetsLocked);
    }

    tracing::info!(
        project_id = %project.id,
        variant_count = project.variant_count,
        questions = count,
        "Variant sets imported"
    );
    Ok(count)
}

/// Variant numbers `1..=variant_count` that have no stored questions.
pub(crate) async fn missing_variants(
    store: &dyn ExamStore,
    project: &Project,
) -> Result<Vec<i32>, ExamError> {
    let present: BTreeSet<i32> = store.list_variant_numbers(&project.id).await?.into_iter().collect();
    Ok((1..=project.variant_count).filter(|number| !present.contains(number)).collect())
}

fn build_questions(project: &Project, sets: Vec<VariantSetInput>) -> Result<Vec<Question>, ExamError> {
    let expected: BTreeSet<i32> = (1..=project.variant_count).collect();
    let provided: BTreeSet<i32> = sets.iter().map(|set| set.variant_number).collect();
    if provided.len() != sets.len() {
        return Err(ExamError::InvalidVariantSets("duplicate variant number".to_string()));
    }
    if provided != expected {
        return Err(ExamError::InvalidVariantSets(format!(
            "expected variants 1..={}, got {:?}",
            project.variant_count, provided
        )));
    }

    let mut questions = Vec::new();
    for set in sets {
        if set.questions.is_empty() {
            return Err(ExamError::InvalidVariantSets(format!(
                "variant {} has no questions",
                set.variant_number
            )));
        }

        for (position, input) in set.questions.into_iter().enumerate() {
            questions.push(build_question(project, set.variant_number, position, input)?);
        }
    }

    Ok(questions)
}

fn build_question(
    project: &Project,
    variant_number: i32,
    position: usize,
    input: QuestionInput,
) -> Result<Question, ExamError> {
    if !input.points.is_finite() || input.points < 0.0 {
        return Err(ExamError::InvalidVariantSets(format!(
            "variant {variant_number} question {position} has invalid points"
        )));
    }
    if input.question_type.is_objective() && input.correct_answer.is_null() {
        return Err(ExamError::InvalidVariantSets(format!(
            "variant {variant_number} question {position} lacks a correct answer"
        )));
    }
    if matches!(input.question_type, QuestionType::SingleChoice | QuestionType::MultipleChoice)
        && !input.options.as_array().is_some_and(|options| !options.is_empty())
    {
        return Err(ExamError::InvalidVariantSets(format!(
            "variant {variant_number} question {position} has no options"
        )));
    }

    Ok(Question {
        id: Uuid::new_v4().to_string(),
        project_id: project.id.clone(),
        variant_number,
        order_index: input.order.unwrap_or(position as i32),
        question_type: input.question_type,
        text: input.text,
        points: input.points,
        options: Json(input.options),
        correct_answer: Json(input.correct_answer),
        expected_keywords: Json(input.expected_keywords),
        rubric: input.rubric,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::{question, sample_project};

    #[test]
    fn max_score_covers_only_the_variant() {
        let set = VariantQuestionSet::from_questions(
            "p1",
            2,
            vec![
                question("p1", 2, 0, QuestionType::SingleChoice, 3.0),
                question("p1", 2, 1, QuestionType::Essay, 7.5),
            ],
        )
        .unwrap();

        assert_eq!(set.max_score(), 10.5);
        assert_eq!(set.variant_number(), 2);
    }

    #[test]
    fn foreign_questions_are_rejected() {
        let err = VariantQuestionSet::from_questions(
            "p1",
            1,
            vec![question("p1", 2, 0, QuestionType::TrueFalse, 1.0)],
        )
        .unwrap_err();

        assert!(matches!(err, ExamError::VariantDataMissing { variant_number: 1, .. }));
    }

    #[test]
    fn student_view_strips_answers() {
        let set = VariantQuestionSet::from_questions(
            "p1",
            1,
            vec![question("p1", 1, 0, QuestionType::SingleChoice, 2.0)],
        )
        .unwrap();

        let view = serde_json::to_value(set.student_view()).unwrap();
        let text = view.to_string();
        assert!(!text.contains("correct"));
        assert!(!text.contains("rubric"));
        assert_eq!(view[0]["options"], json!(["a", "b", "c"]));
    }

    #[test]
    fn import_requires_every_variant() {
        let project = sample_project("p1", 2);
        let sets = vec![VariantSetInput {
            variant_number: 1,
            questions: vec![QuestionInput {
                question_type: QuestionType::TrueFalse,
                text: "Water is wet".into(),
                points: 1.0,
                options: json!([]),
                correct_answer: json!(true),
                expected_keywords: Vec::new(),
                rubric: None,
                order: None,
            }],
        }];

        assert!(matches!(build_questions(&project, sets), Err(ExamError::InvalidVariantSets(_))));
    }
}

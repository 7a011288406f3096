use std::collections::BTreeSet;

use serde_json::Value;

use crate::db::models::{Answer, Question};
use crate::db::types::{GradingStatus, QuestionType};
use crate::repositories::{AnswerGrade, SessionGrade};
use crate::services::question_bank::VariantQuestionSet;

/// Grades every stored answer against the assigned variant. Objective types
/// are scored now; non-empty open-ended answers are left pending.
pub(crate) fn grade_session(set: &VariantQuestionSet, answers: &[Answer]) -> SessionGrade {
    let mut graded = Vec::with_capacity(answers.len());
    let mut score = 0.0;

    for answer in answers {
        let Some(question) = set.question(&answer.question_id) else {
            tracing::warn!(
                question_id = %answer.question_id,
                variant_number = set.variant_number(),
                "Answer references a question outside the assigned variant"
            );
            continue;
        };

        let grade = grade_answer(question, &answer.value.0);
        if let Some(points) = grade.score {
            score += points;
        }
        graded.push(grade);
    }

    SessionGrade { answers: graded, score, max_score: set.max_score() }
}

pub(crate) fn grade_answer(question: &Question, value: &Value) -> AnswerGrade {
    if !question.question_type.is_objective() {
        if is_blank(value) {
            return graded(question, false);
        }
        return AnswerGrade {
            question_id: question.id.clone(),
            grading_status: GradingStatus::Pending,
            is_correct: None,
            score: None,
        };
    }

    let correct = is_objectively_correct(question, value).unwrap_or(false);
    graded(question, correct)
}

/// `None` when either side cannot be interpreted for the question type.
fn is_objectively_correct(question: &Question, value: &Value) -> Option<bool> {
    let expected = &question.correct_answer.0;
    let options = &question.options.0;

    match question.question_type {
        QuestionType::SingleChoice => {
            Some(choice_index(value, options)? == choice_index(expected, options)?)
        }
        QuestionType::MultipleChoice => {
            Some(choice_set(value, options)? == choice_set(expected, options)?)
        }
        QuestionType::TrueFalse => Some(as_bool(value)? == as_bool(expected)?),
        QuestionType::Matching => Some(pair_set(value)? == pair_set(expected)?),
        QuestionType::ShortAnswer | QuestionType::Essay => None,
    }
}

fn graded(question: &Question, correct: bool) -> AnswerGrade {
    AnswerGrade {
        question_id: question.id.clone(),
        grading_status: GradingStatus::Graded,
        is_correct: Some(correct),
        score: Some(if correct { question.points } else { 0.0 }),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

/// Accepts an option index or the option text itself.
fn choice_index(value: &Value, options: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => {
            let text = text.trim();
            let by_text = options
                .as_array()
                .and_then(|items| items.iter().position(|item| item.as_str().map(str::trim) == Some(text)));
            match by_text {
                Some(position) => i64::try_from(position).ok(),
                None => text.parse().ok(),
            }
        }
        _ => None,
    }
}

fn choice_set(value: &Value, options: &Value) -> Option<BTreeSet<i64>> {
    value.as_array()?.iter().map(|item| choice_index(item, options)).collect()
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Pairs may be `[left, right]` arrays or `{left, right}` objects.
fn pair_set(value: &Value) -> Option<BTreeSet<(String, String)>> {
    value
        .as_array()?
        .iter()
        .map(|pair| {
            let (left, right) = match pair {
                Value::Array(items) if items.len() == 2 => (&items[0], &items[1]),
                Value::Object(map) => (map.get("left")?, map.get("right")?),
                _ => return None,
            };
            Some((scalar_text(left)?, scalar_text(right)?))
        })
        .collect()
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::types::Json;

    use super::*;
    use crate::test_support::{answer, question};

    fn with_answer(mut q: Question, correct: Value, options: Value) -> Question {
        q.correct_answer = Json(correct);
        q.options = Json(options);
        q
    }

    #[test]
    fn single_choice_accepts_index_or_text() {
        let q = with_answer(
            question("p", 1, 0, QuestionType::SingleChoice, 2.0),
            json!(1),
            json!(["red", "green", "blue"]),
        );

        assert_eq!(grade_answer(&q, &json!(1)).score, Some(2.0));
        assert_eq!(grade_answer(&q, &json!("green")).score, Some(2.0));
        assert_eq!(grade_answer(&q, &json!(2)).is_correct, Some(false));
    }

    #[test]
    fn multiple_choice_uses_set_equality() {
        let q = with_answer(
            question("p", 1, 0, QuestionType::MultipleChoice, 4.0),
            json!([0, 2]),
            json!(["a", "b", "c"]),
        );

        assert_eq!(grade_answer(&q, &json!([2, 0])).score, Some(4.0));
        assert_eq!(grade_answer(&q, &json!([0])).score, Some(0.0));
        assert_eq!(grade_answer(&q, &json!([0, 1, 2])).score, Some(0.0));
    }

    #[test]
    fn true_false_and_matching() {
        let tf = with_answer(question("p", 1, 0, QuestionType::TrueFalse, 1.0), json!(false), json!([]));
        assert_eq!(grade_answer(&tf, &json!("False")).is_correct, Some(true));

        let matching = with_answer(
            question("p", 1, 1, QuestionType::Matching, 3.0),
            json!([["H", "hydrogen"], ["O", "oxygen"]]),
            json!([]),
        );
        let student = json!([{"left": "O", "right": "oxygen"}, {"left": "H", "right": "hydrogen"}]);
        assert_eq!(grade_answer(&matching, &student).score, Some(3.0));
        assert_eq!(grade_answer(&matching, &json!([["H", "oxygen"]])).score, Some(0.0));
    }

    #[test]
    fn malformed_objective_answer_scores_zero() {
        let q = with_answer(question("p", 1, 0, QuestionType::Matching, 3.0), json!([["a", "b"]]), json!([]));
        let grade = grade_answer(&q, &json!({"oops": true}));
        assert_eq!(grade.grading_status, GradingStatus::Graded);
        assert_eq!(grade.score, Some(0.0));
    }

    #[test]
    fn open_ended_answers_stay_pending_unless_blank() {
        let essay = question("p", 1, 0, QuestionType::Essay, 10.0);
        assert_eq!(grade_answer(&essay, &json!("A long essay")).grading_status, GradingStatus::Pending);
        let blank = grade_answer(&essay, &json!("   "));
        assert_eq!(blank.grading_status, GradingStatus::Graded);
        assert_eq!(blank.score, Some(0.0));
    }

    #[test]
    fn session_grade_excludes_pending_points() {
        let objective = with_answer(
            question("p", 1, 0, QuestionType::TrueFalse, 2.0),
            json!(true),
            json!([]),
        );
        let essay = question("p", 1, 1, QuestionType::ShortAnswer, 5.0);
        let set = VariantQuestionSet::from_questions("p", 1, vec![objective.clone(), essay.clone()]).unwrap();

        let grade = grade_session(
            &set,
            &[answer("s", &objective.id, json!(true)), answer("s", &essay.id, json!("photosynthesis"))],
        );

        assert_eq!(grade.score, 2.0);
        assert_eq!(grade.max_score, 7.0);
        assert_eq!(grade.answers.len(), 2);
    }
}

use crate::db::models::Question;

pub(crate) const COLUMNS: &str = "\
    id, project_id, variant_number, order_index, question_type, text, points, \
    options, correct_answer, expected_keywords, rubric";

pub(crate) async fn insert(
    executor: impl sqlx::PgExecutor<'_>,
    question: &Question,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO questions (
            id, project_id, variant_number, order_index, question_type, text, points,
            options, correct_answer, expected_keywords, rubric
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
    )
    .bind(&question.id)
    .bind(&question.project_id)
    .bind(question.variant_number)
    .bind(question.order_index)
    .bind(question.question_type)
    .bind(&question.text)
    .bind(question.points)
    .bind(&question.options)
    .bind(&question.correct_answer)
    .bind(&question.expected_keywords)
    .bind(&question.rubric)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn exists_for_project(
    executor: impl sqlx::PgExecutor<'_>,
    project_id: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM questions WHERE project_id = $1)")
        .bind(project_id)
        .fetch_one(executor)
        .await
}

pub(crate) async fn list_by_variant(
    executor: impl sqlx::PgExecutor<'_>,
    project_id: &str,
    variant_number: i32,
) -> Result<Vec<Question>, sqlx::Error> {
    sqlx::query_as::<_, Question>(&format!(
        "SELECT {COLUMNS} FROM questions
         WHERE project_id = $1 AND variant_number = $2
         ORDER BY order_index"
    ))
    .bind(project_id)
    .bind(variant_number)
    .fetch_all(executor)
    .await
}

pub(crate) async fn list_variant_numbers(
    executor: impl sqlx::PgExecutor<'_>,
    project_id: &str,
) -> Result<Vec<i32>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT DISTINCT variant_number FROM questions WHERE project_id = $1 ORDER BY variant_number",
    )
    .bind(project_id)
    .fetch_all(executor)
    .await
}

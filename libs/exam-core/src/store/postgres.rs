use super::{CloseReason, ExamStore, GradingOutcome};
use crate::error::{ExamError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exam_common::types::{
    Attempt, AttemptId, AttemptStatus, AnswerRecord, CandidateId, CodeSubmissionRecord, CodeTask,
    ItemId, Language, MultipleChoiceItem, TaskId, TestCase, Verdict,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use uuid::Uuid;

const ATTEMPT_COLUMNS: &str =
    "id, candidate_id, status, started_at, deadline, closed_at, score_total, score_blocks";

#[derive(FromRow)]
struct AttemptRow {
    id: Uuid,
    candidate_id: i64,
    status: String,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    score_total: Option<i64>,
    score_blocks: Option<Json<BTreeMap<String, i64>>>,
}

impl TryFrom<AttemptRow> for Attempt {
    type Error = ExamError;

    fn try_from(row: AttemptRow) -> Result<Self> {
        let status: AttemptStatus = row.status.parse().map_err(ExamError::Infrastructure)?;
        Ok(Attempt {
            id: row.id,
            candidate_id: row.candidate_id,
            status,
            started_at: row.started_at,
            deadline: row.deadline,
            closed_at: row.closed_at,
            score_total: row.score_total,
            score_blocks: row.score_blocks.map(|Json(blocks)| blocks),
        })
    }
}

#[derive(FromRow)]
struct ItemRow {
    id: i64,
    subject: String,
    prompt: String,
    options: Json<Vec<String>>,
    correct_index: i32,
    points: i64,
    published: bool,
}

impl From<ItemRow> for MultipleChoiceItem {
    fn from(row: ItemRow) -> Self {
        MultipleChoiceItem {
            id: row.id,
            subject: row.subject,
            prompt: row.prompt,
            options: row.options.0,
            correct_index: row.correct_index,
            points: row.points,
            published: row.published,
        }
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: i64,
    title: String,
    statement: String,
    points: i64,
    published: bool,
}

#[derive(FromRow)]
struct TestCaseRow {
    id: i64,
    task_id: i64,
    input_data: String,
    expected_output: String,
    hidden: bool,
}

#[derive(FromRow)]
struct SubmissionRow {
    attempt_id: Uuid,
    task_id: i64,
    language: Option<String>,
    code: Option<String>,
    verdicts: Json<Vec<Verdict>>,
    is_correct: Option<bool>,
}

impl From<SubmissionRow> for CodeSubmissionRecord {
    fn from(row: SubmissionRow) -> Self {
        let language = row.language.as_deref().and_then(|tag| match tag.parse::<Language>() {
            Ok(language) => Some(language),
            Err(e) => {
                tracing::warn!(attempt_id = %row.attempt_id, task_id = row.task_id, error = %e, "Stored draft has unsupported language");
                None
            }
        });
        CodeSubmissionRecord {
            attempt_id: row.attempt_id,
            task_id: row.task_id,
            language,
            code: row.code,
            verdicts: row.verdicts.0,
            is_correct: row.is_correct,
        }
    }
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_tasks(&self, filter: &str, ids: Option<&[TaskId]>) -> Result<Vec<CodeTask>> {
        let sql = format!(
            "SELECT id, title, statement, points, published FROM code_tasks WHERE {} ORDER BY id",
            filter
        );
        let mut query = sqlx::query_as::<_, TaskRow>(&sql);
        if let Some(ids) = ids {
            query = query.bind(ids);
        }
        let rows = query.fetch_all(&self.pool).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let task_ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let cases = sqlx::query_as::<_, TestCaseRow>(
            r#"
            SELECT id, task_id, input_data, expected_output, hidden
            FROM code_test_cases
            WHERE task_id = ANY($1)
            ORDER BY task_id, position, id
            "#,
        )
        .bind(&task_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_task: HashMap<i64, Vec<TestCase>> = HashMap::new();
        for case in cases {
            by_task.entry(case.task_id).or_default().push(TestCase {
                id: case.id,
                input: case.input_data,
                expected_output: case.expected_output,
                hidden: case.hidden,
            });
        }

        Ok(rows
            .into_iter()
            .map(|row| CodeTask {
                test_cases: by_task.remove(&row.id).unwrap_or_default(),
                id: row.id,
                title: row.title,
                statement: row.statement,
                points: row.points,
                published: row.published,
            })
            .collect())
    }

    /// Row-locks the attempt for the rest of `tx` and reports whether it still
    /// accepts answers. A concurrent close blocks on this lock.
    async fn lock_if_writable(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        attempt_id: AttemptId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let writable: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT status = 'in_progress' AND deadline > $2
            FROM exam_attempts
            WHERE id = $1
            FOR SHARE
            "#,
        )
        .bind(attempt_id)
        .bind(now)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(writable == Some(true))
    }
}

#[async_trait]
impl ExamStore for PgStore {
    async fn create_attempt(
        &self,
        candidate_id: CandidateId,
        started_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<Attempt> {
        let sql = format!(
            r#"
            INSERT INTO exam_attempts (id, candidate_id, status, started_at, deadline)
            VALUES ($1, $2, 'in_progress', $3, $4)
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        );
        let row = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(candidate_id)
            .bind(started_at)
            .bind(deadline)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => ExamError::AlreadyExists(
                    format!("attempt for candidate {}", candidate_id),
                ),
                other => ExamError::Database(other),
            })?;
        row.try_into()
    }

    async fn attempt(&self, id: AttemptId) -> Result<Option<Attempt>> {
        let sql = format!("SELECT {} FROM exam_attempts WHERE id = $1", ATTEMPT_COLUMNS);
        let row = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Attempt::try_from).transpose()
    }

    async fn attempt_by_candidate(&self, candidate_id: CandidateId) -> Result<Option<Attempt>> {
        let sql = format!(
            "SELECT {} FROM exam_attempts WHERE candidate_id = $1",
            ATTEMPT_COLUMNS
        );
        let row = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(candidate_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Attempt::try_from).transpose()
    }

    async fn close_attempt(
        &self,
        id: AttemptId,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<Option<Attempt>> {
        let deadline_guard = match reason {
            CloseReason::Expired => "deadline <= $3",
            CloseReason::Submitted => "deadline > $3",
        };
        let sql = format!(
            r#"
            UPDATE exam_attempts
            SET status = $2, closed_at = $3
            WHERE id = $1 AND status = 'in_progress' AND {}
            RETURNING {}
            "#,
            deadline_guard, ATTEMPT_COLUMNS
        );
        let row = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(id)
            .bind(reason.target_status().as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Attempt::try_from).transpose()
    }

    async fn overdue_attempt_ids(&self, now: DateTime<Utc>) -> Result<Vec<AttemptId>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM exam_attempts
            WHERE status = 'in_progress' AND deadline <= $1
            ORDER BY deadline
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn ungraded_attempt_ids(&self) -> Result<Vec<AttemptId>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM exam_attempts
            WHERE status <> 'in_progress' AND score_total IS NULL
            ORDER BY closed_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn upsert_answer(
        &self,
        attempt_id: AttemptId,
        item_id: ItemId,
        selected_index: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !Self::lock_if_writable(&mut tx, attempt_id, now).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO attempt_answers (attempt_id, item_id, selected_index)
            VALUES ($1, $2, $3)
            ON CONFLICT (attempt_id, item_id)
            DO UPDATE SET selected_index = EXCLUDED.selected_index, is_correct = NULL
            "#,
        )
        .bind(attempt_id)
        .bind(item_id)
        .bind(selected_index)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn upsert_draft(
        &self,
        attempt_id: AttemptId,
        task_id: TaskId,
        language: Language,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !Self::lock_if_writable(&mut tx, attempt_id, now).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO attempt_submissions (attempt_id, task_id, language, code)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (attempt_id, task_id)
            DO UPDATE SET language = EXCLUDED.language, code = EXCLUDED.code,
                          verdicts = '[]'::jsonb, is_correct = NULL
            "#,
        )
        .bind(attempt_id)
        .bind(task_id)
        .bind(language.as_str())
        .bind(code)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn answers(&self, attempt_id: AttemptId) -> Result<Vec<AnswerRecord>> {
        let rows: Vec<(Uuid, i64, Option<i32>, Option<bool>)> = sqlx::query_as(
            r#"
            SELECT attempt_id, item_id, selected_index, is_correct
            FROM attempt_answers
            WHERE attempt_id = $1
            ORDER BY item_id
            "#,
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(attempt_id, item_id, selected_index, is_correct)| AnswerRecord {
                attempt_id,
                item_id,
                selected_index,
                is_correct,
            })
            .collect())
    }

    async fn submissions(&self, attempt_id: AttemptId) -> Result<Vec<CodeSubmissionRecord>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(
            r#"
            SELECT attempt_id, task_id, language, code, verdicts, is_correct
            FROM attempt_submissions
            WHERE attempt_id = $1
            ORDER BY task_id
            "#,
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CodeSubmissionRecord::from).collect())
    }

    async fn items(&self, ids: &[ItemId]) -> Result<Vec<MultipleChoiceItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT id, subject, prompt, options, correct_index, points, published
            FROM mc_items
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MultipleChoiceItem::from).collect())
    }

    async fn tasks(&self, ids: &[TaskId]) -> Result<Vec<CodeTask>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.load_tasks("id = ANY($1)", Some(ids)).await
    }

    async fn published_items(&self) -> Result<Vec<MultipleChoiceItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT id, subject, prompt, options, correct_index, points, published
            FROM mc_items
            WHERE published
            ORDER BY subject, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MultipleChoiceItem::from).collect())
    }

    async fn published_tasks(&self) -> Result<Vec<CodeTask>> {
        self.load_tasks("published", None).await
    }

    async fn save_grading(&self, outcome: &GradingOutcome) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM exam_attempts WHERE id = $1 FOR UPDATE")
                .bind(outcome.attempt_id)
                .fetch_optional(&mut *tx)
                .await?;
        match status.as_deref() {
            None => {
                return Err(ExamError::NotFound(format!("attempt {}", outcome.attempt_id)))
            }
            Some("in_progress") => {
                return Err(ExamError::InvalidState(format!(
                    "attempt {} is still in progress",
                    outcome.attempt_id
                )))
            }
            Some(_) => {}
        }

        for grade in &outcome.answers {
            sqlx::query(
                "UPDATE attempt_answers SET is_correct = $3 WHERE attempt_id = $1 AND item_id = $2",
            )
            .bind(outcome.attempt_id)
            .bind(grade.item_id)
            .bind(grade.is_correct)
            .execute(&mut *tx)
            .await?;
        }

        for grade in &outcome.submissions {
            sqlx::query(
                r#"
                UPDATE attempt_submissions
                SET verdicts = $3, is_correct = $4
                WHERE attempt_id = $1 AND task_id = $2
                "#,
            )
            .bind(outcome.attempt_id)
            .bind(grade.task_id)
            .bind(Json(&grade.verdicts))
            .bind(grade.is_correct)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE exam_attempts SET score_total = $2, score_blocks = $3 WHERE id = $1",
        )
        .bind(outcome.attempt_id)
        .bind(outcome.score_total)
        .bind(Json(&outcome.score_blocks))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

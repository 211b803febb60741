// In-process store: one mutex around all tables, so every method is atomic.
// Used by tests and for running the pipeline without PostgreSQL.

use super::{CloseReason, ExamStore, GradingOutcome};
use crate::error::{ExamError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exam_common::types::{
    Attempt, AttemptId, AttemptStatus, AnswerRecord, CandidateId, CodeSubmissionRecord, CodeTask,
    ItemId, Language, MultipleChoiceItem, TaskId,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    attempts: HashMap<AttemptId, Attempt>,
    by_candidate: HashMap<CandidateId, AttemptId>,
    answers: BTreeMap<(AttemptId, ItemId), AnswerRecord>,
    submissions: BTreeMap<(AttemptId, TaskId), CodeSubmissionRecord>,
    items: BTreeMap<ItemId, MultipleChoiceItem>,
    tasks: BTreeMap<TaskId, CodeTask>,
}

impl Tables {
    fn accepts_writes(&self, attempt_id: AttemptId, now: DateTime<Utc>) -> bool {
        self.attempts
            .get(&attempt_id)
            .map(|a| a.is_open() && now < a.deadline)
            .unwrap_or(false)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_item(&self, item: MultipleChoiceItem) {
        self.tables.lock().await.items.insert(item.id, item);
    }

    pub async fn insert_task(&self, task: CodeTask) {
        self.tables.lock().await.tasks.insert(task.id, task);
    }

    /// Deleting a task cascades to the submissions referencing it
    pub async fn delete_task(&self, task_id: TaskId) {
        let mut tables = self.tables.lock().await;
        tables.tasks.remove(&task_id);
        tables.submissions.retain(|(_, t), _| *t != task_id);
    }
}

#[async_trait]
impl ExamStore for MemoryStore {
    async fn create_attempt(
        &self,
        candidate_id: CandidateId,
        started_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<Attempt> {
        let mut tables = self.tables.lock().await;
        if tables.by_candidate.contains_key(&candidate_id) {
            return Err(ExamError::AlreadyExists(format!(
                "attempt for candidate {}",
                candidate_id
            )));
        }

        let attempt = Attempt {
            id: Uuid::new_v4(),
            candidate_id,
            status: AttemptStatus::InProgress,
            started_at,
            deadline,
            closed_at: None,
            score_total: None,
            score_blocks: None,
        };
        tables.by_candidate.insert(candidate_id, attempt.id);
        tables.attempts.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    async fn attempt(&self, id: AttemptId) -> Result<Option<Attempt>> {
        Ok(self.tables.lock().await.attempts.get(&id).cloned())
    }

    async fn attempt_by_candidate(&self, candidate_id: CandidateId) -> Result<Option<Attempt>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .by_candidate
            .get(&candidate_id)
            .and_then(|id| tables.attempts.get(id))
            .cloned())
    }

    async fn close_attempt(
        &self,
        id: AttemptId,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<Option<Attempt>> {
        let mut tables = self.tables.lock().await;
        let Some(attempt) = tables.attempts.get_mut(&id) else {
            return Ok(None);
        };
        let deadline_ok = match reason {
            CloseReason::Expired => now >= attempt.deadline,
            CloseReason::Submitted => now < attempt.deadline,
        };
        if !attempt.is_open() || !deadline_ok {
            return Ok(None);
        }
        attempt.status = reason.target_status();
        attempt.closed_at = Some(now);
        Ok(Some(attempt.clone()))
    }

    async fn overdue_attempt_ids(&self, now: DateTime<Utc>) -> Result<Vec<AttemptId>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .attempts
            .values()
            .filter(|a| a.is_overdue(now))
            .map(|a| a.id)
            .collect())
    }

    async fn ungraded_attempt_ids(&self) -> Result<Vec<AttemptId>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .attempts
            .values()
            .filter(|a| a.status.is_terminal() && !a.is_graded())
            .map(|a| a.id)
            .collect())
    }

    async fn upsert_answer(
        &self,
        attempt_id: AttemptId,
        item_id: ItemId,
        selected_index: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        if !tables.accepts_writes(attempt_id, now) {
            return Ok(false);
        }
        tables.answers.insert(
            (attempt_id, item_id),
            AnswerRecord {
                attempt_id,
                item_id,
                selected_index,
                is_correct: None,
            },
        );
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
        let mut tables = self.tables.lock().await;
        if !tables.accepts_writes(attempt_id, now) {
            return Ok(false);
        }
        tables.submissions.insert(
            (attempt_id, task_id),
            CodeSubmissionRecord {
                attempt_id,
                task_id,
                language: Some(language),
                code: Some(code.to_string()),
                verdicts: Vec::new(),
                is_correct: None,
            },
        );
        Ok(true)
    }

    async fn answers(&self, attempt_id: AttemptId) -> Result<Vec<AnswerRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .answers
            .values()
            .filter(|a| a.attempt_id == attempt_id)
            .cloned()
            .collect())
    }

    async fn submissions(&self, attempt_id: AttemptId) -> Result<Vec<CodeSubmissionRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .submissions
            .values()
            .filter(|s| s.attempt_id == attempt_id)
            .cloned()
            .collect())
    }

    async fn items(&self, ids: &[ItemId]) -> Result<Vec<MultipleChoiceItem>> {
        let tables = self.tables.lock().await;
        Ok(ids.iter().filter_map(|id| tables.items.get(id)).cloned().collect())
    }

    async fn tasks(&self, ids: &[TaskId]) -> Result<Vec<CodeTask>> {
        let tables = self.tables.lock().await;
        Ok(ids.iter().filter_map(|id| tables.tasks.get(id)).cloned().collect())
    }

    async fn published_items(&self) -> Result<Vec<MultipleChoiceItem>> {
        let tables = self.tables.lock().await;
        Ok(tables.items.values().filter(|i| i.published).cloned().collect())
    }

    async fn published_tasks(&self) -> Result<Vec<CodeTask>> {
        let tables = self.tables.lock().await;
        Ok(tables.tasks.values().filter(|t| t.published).cloned().collect())
    }

    async fn save_grading(&self, outcome: &GradingOutcome) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let attempt_id = outcome.attempt_id;
        match tables.attempts.get(&attempt_id) {
            None => return Err(ExamError::NotFound(format!("attempt {}", attempt_id))),
            Some(a) if a.is_open() => {
                return Err(ExamError::InvalidState(format!(
                    "attempt {} is still in progress",
                    attempt_id
                )))
            }
            Some(_) => {}
        }

        for grade in &outcome.answers {
            if let Some(record) = tables.answers.get_mut(&(attempt_id, grade.item_id)) {
                record.is_correct = Some(grade.is_correct);
            }
        }
        for grade in &outcome.submissions {
            if let Some(record) = tables.submissions.get_mut(&(attempt_id, grade.task_id)) {
                record.verdicts = grade.verdicts.clone();
                record.is_correct = Some(grade.is_correct);
            }
        }
        if let Some(attempt) = tables.attempts.get_mut(&attempt_id) {
            attempt.score_total = Some(outcome.score_total);
            attempt.score_blocks = Some(outcome.score_blocks.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc::now();
        (start, start + Duration::minutes(60))
    }

    #[tokio::test]
    async fn test_second_attempt_for_candidate_is_rejected() {
        let store = MemoryStore::new();
        let (start, deadline) = window();
        store.create_attempt(1, start, deadline).await.unwrap();

        let err = store.create_attempt(1, start, deadline).await.unwrap_err();
        assert!(matches!(err, ExamError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_concurrent_starts_create_one_attempt() {
        let store = Arc::new(MemoryStore::new());
        let (start, deadline) = window();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create_attempt(42, start, deadline).await })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_close_is_compare_and_set() {
        let store = MemoryStore::new();
        let (start, deadline) = window();
        let attempt = store.create_attempt(1, start, deadline).await.unwrap();

        let won = store
            .close_attempt(attempt.id, CloseReason::Expired, deadline)
            .await
            .unwrap();
        assert_eq!(won.unwrap().status, AttemptStatus::TimedOut);

        let lost = store
            .close_attempt(attempt.id, CloseReason::Expired, deadline)
            .await
            .unwrap();
        assert!(lost.is_none());
    }

    #[tokio::test]
    async fn test_submit_after_deadline_does_not_win() {
        let store = MemoryStore::new();
        let (start, deadline) = window();
        let attempt = store.create_attempt(1, start, deadline).await.unwrap();

        let result = store
            .close_attempt(attempt.id, CloseReason::Submitted, deadline)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(store.attempt(attempt.id).await.unwrap().unwrap().is_open());
    }

    #[tokio::test]
    async fn test_upsert_answer_overwrites() {
        let store = MemoryStore::new();
        let (start, deadline) = window();
        let attempt = store.create_attempt(1, start, deadline).await.unwrap();

        assert!(store.upsert_answer(attempt.id, 5, Some(1), start).await.unwrap());
        assert!(store.upsert_answer(attempt.id, 5, Some(2), start).await.unwrap());

        let answers = store.answers(attempt.id).await.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].selected_index, Some(2));
    }

    #[tokio::test]
    async fn test_upsert_rejected_past_deadline() {
        let store = MemoryStore::new();
        let (start, deadline) = window();
        let attempt = store.create_attempt(1, start, deadline).await.unwrap();

        assert!(!store.upsert_answer(attempt.id, 5, Some(1), deadline).await.unwrap());
        assert!(!store
            .upsert_draft(attempt.id, 9, Language::Python, "print(1)", deadline)
            .await
            .unwrap());
        assert!(store.answers(attempt.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_grading_requires_closed_attempt() {
        let store = MemoryStore::new();
        let (start, deadline) = window();
        let attempt = store.create_attempt(1, start, deadline).await.unwrap();

        let outcome = GradingOutcome {
            attempt_id: attempt.id,
            answers: Vec::new(),
            submissions: Vec::new(),
            score_total: 0,
            score_blocks: BTreeMap::new(),
        };
        let err = store.save_grading(&outcome).await.unwrap_err();
        assert!(matches!(err, ExamError::InvalidState(_)));
    }
}

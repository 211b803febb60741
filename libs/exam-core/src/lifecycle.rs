/// Attempt Lifecycle Controller
///
/// **Core Responsibility:**
/// Own the `in_progress -> {submitted, timed_out}` state machine and make
/// sure each closing event schedules exactly one grading job.
///
/// **Concurrency Model:**
/// - Uniqueness of the candidate's attempt is enforced by the store
/// - Every close goes through `ExamStore::close_attempt` (compare-and-set
///   on status); only the winner enqueues grading
/// - The periodic sweep and the opportunistic check on every candidate
///   action share `close_expired`, so there is one write path for expiry
/// - Expiry takes precedence: a submission at or after the deadline loses
use crate::error::{ExamError, Result};
use crate::queue::GradingQueue;
use crate::store::{CloseReason, ExamStore};
use chrono::{DateTime, Duration, Utc};
use exam_common::types::{
    Attempt, AttemptId, AttemptResult, CandidateId, Draft, ExamView, ItemId, Language, PublicItem,
    PublicTask, TaskId,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, instrument, warn};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct AttemptLifecycle {
    store: Arc<dyn ExamStore>,
    queue: Arc<dyn GradingQueue>,
    clock: Arc<dyn Clock>,
    duration: Duration,
}

impl AttemptLifecycle {
    pub fn new(store: Arc<dyn ExamStore>, queue: Arc<dyn GradingQueue>, duration: Duration) -> Self {
        Self {
            store,
            queue,
            clock: Arc::new(SystemClock),
            duration,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[instrument(skip(self))]
    pub async fn start_attempt(&self, candidate_id: CandidateId) -> Result<Attempt> {
        let now = self.clock.now();
        let attempt = self
            .store
            .create_attempt(candidate_id, now, now + self.duration)
            .await?;
        info!(
            attempt_id = %attempt.id,
            candidate_id,
            deadline = %attempt.deadline,
            "Attempt started"
        );
        Ok(attempt)
    }

    /// Fetch the candidate's attempt, closing it first if it has expired
    pub async fn get_attempt(&self, candidate_id: CandidateId) -> Result<Attempt> {
        let attempt = self
            .store
            .attempt_by_candidate(candidate_id)
            .await?
            .ok_or_else(|| ExamError::NotFound(format!("attempt for candidate {}", candidate_id)))?;
        self.check_and_close_if_expired(attempt).await
    }

    /// The candidate's attempt together with published content and saved work
    pub async fn exam_view(&self, candidate_id: CandidateId) -> Result<ExamView> {
        let attempt = self.get_attempt(candidate_id).await?;

        let items = self.store.published_items().await?;
        let tasks = self.store.published_tasks().await?;
        let answers = self
            .store
            .answers(attempt.id)
            .await?
            .into_iter()
            .map(|a| (a.item_id, a.selected_index))
            .collect();
        let drafts = self
            .store
            .submissions(attempt.id)
            .await?
            .into_iter()
            .map(|s| {
                (
                    s.task_id,
                    Draft {
                        language: s.language,
                        code: s.code,
                    },
                )
            })
            .collect();

        Ok(ExamView {
            attempt,
            items: items.iter().map(PublicItem::from).collect(),
            tasks: tasks.iter().map(PublicTask::from).collect(),
            answers,
            drafts,
        })
    }

    /// Idempotent: closes an overdue attempt as `timed_out` and schedules
    /// grading once; otherwise returns the attempt as currently stored.
    pub async fn check_and_close_if_expired(&self, attempt: Attempt) -> Result<Attempt> {
        let now = self.clock.now();
        if !attempt.is_overdue(now) {
            return Ok(attempt);
        }
        match self.close_expired(attempt.id, now).await? {
            Some(closed) => Ok(closed),
            // Another trigger won the transition
            None => self.load(attempt.id).await,
        }
    }

    #[instrument(skip(self))]
    pub async fn record_answer(
        &self,
        attempt_id: AttemptId,
        item_id: ItemId,
        selected_index: Option<i32>,
    ) -> Result<()> {
        self.open_attempt(attempt_id).await?;

        let item = self.store.items(&[item_id]).await?.into_iter().next();
        if !item.map(|i| i.published).unwrap_or(false) {
            return Err(ExamError::NotFound(format!("item {}", item_id)));
        }

        let now = self.clock.now();
        if !self.store.upsert_answer(attempt_id, item_id, selected_index, now).await? {
            return Err(self.rejected_write(attempt_id).await);
        }
        debug!(attempt_id = %attempt_id, item_id, "Answer saved");
        Ok(())
    }

    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub async fn record_draft(
        &self,
        attempt_id: AttemptId,
        task_id: TaskId,
        language: Language,
        code: &str,
    ) -> Result<()> {
        self.open_attempt(attempt_id).await?;

        let task = self.store.tasks(&[task_id]).await?.into_iter().next();
        if !task.map(|t| t.published).unwrap_or(false) {
            return Err(ExamError::NotFound(format!("task {}", task_id)));
        }

        let now = self.clock.now();
        if !self
            .store
            .upsert_draft(attempt_id, task_id, language, code, now)
            .await?
        {
            return Err(self.rejected_write(attempt_id).await);
        }
        debug!(attempt_id = %attempt_id, task_id, language = %language, "Draft saved");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn submit(&self, attempt_id: AttemptId) -> Result<Attempt> {
        self.open_attempt(attempt_id).await?;

        let now = self.clock.now();
        match self
            .store
            .close_attempt(attempt_id, CloseReason::Submitted, now)
            .await?
        {
            Some(closed) => {
                info!(attempt_id = %attempt_id, "Attempt submitted");
                self.schedule_grading(&closed).await;
                Ok(closed)
            }
            None => {
                // Lost to the sweep, or the deadline passed since the check above
                let current = self.load(attempt_id).await?;
                let current = self.check_and_close_if_expired(current).await?;
                Err(ExamError::InvalidState(format!(
                    "attempt {} is already {}",
                    attempt_id, current.status
                )))
            }
        }
    }

    pub async fn get_result(&self, attempt_id: AttemptId) -> Result<AttemptResult> {
        let attempt = self.load(attempt_id).await?;
        let attempt = self.check_and_close_if_expired(attempt).await?;
        if attempt.is_open() {
            return Err(ExamError::InvalidState(format!(
                "attempt {} has not been submitted",
                attempt_id
            )));
        }

        let mut result = AttemptResult {
            attempt_id,
            status: attempt.status,
            total_score: attempt.score_total,
            block_scores: attempt.score_blocks.clone().unwrap_or_default(),
            per_item: BTreeMap::new(),
            per_task: BTreeMap::new(),
        };
        if !attempt.is_graded() {
            return Ok(result);
        }

        for answer in self.store.answers(attempt_id).await? {
            result
                .per_item
                .insert(answer.item_id, answer.is_correct.unwrap_or(false));
        }
        for submission in self.store.submissions(attempt_id).await? {
            result
                .per_task
                .insert(submission.task_id, submission.is_correct.unwrap_or(false));
        }
        Ok(result)
    }

    /// Periodic expiry sweep; returns how many attempts this call closed
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let overdue = self.store.overdue_attempt_ids(now).await?;
        let mut closed = 0;

        for attempt_id in overdue {
            match self.close_expired(attempt_id, now).await {
                Ok(Some(_)) => closed += 1,
                Ok(None) => debug!(attempt_id = %attempt_id, "Attempt already closed by another trigger"),
                Err(e) => warn!(attempt_id = %attempt_id, error = %e, "Failed to close expired attempt"),
            }
        }

        if closed > 0 {
            info!(closed, "Expiry sweep closed attempts");
        }
        Ok(closed)
    }

    /// Re-enqueue grading for closed attempts that never got a score
    pub async fn requeue_ungraded(&self) -> Result<usize> {
        let ids = self.store.ungraded_attempt_ids().await?;
        for attempt_id in &ids {
            self.queue.enqueue_attempt(*attempt_id).await?;
            info!(attempt_id = %attempt_id, "Grading re-enqueued");
        }
        Ok(ids.len())
    }

    async fn close_expired(&self, attempt_id: AttemptId, now: DateTime<Utc>) -> Result<Option<Attempt>> {
        let Some(closed) = self
            .store
            .close_attempt(attempt_id, CloseReason::Expired, now)
            .await?
        else {
            return Ok(None);
        };
        info!(attempt_id = %attempt_id, deadline = %closed.deadline, "Attempt timed out");
        self.schedule_grading(&closed).await;
        Ok(Some(closed))
    }

    /// The close has already committed; a queue failure leaves the attempt
    /// closed and ungraded until `requeue_ungraded` picks it up.
    async fn schedule_grading(&self, attempt: &Attempt) {
        if let Err(e) = self.queue.enqueue_attempt(attempt.id).await {
            error!(attempt_id = %attempt.id, error = %e, "Failed to enqueue grading");
        }
    }

    async fn load(&self, attempt_id: AttemptId) -> Result<Attempt> {
        self.store
            .attempt(attempt_id)
            .await?
            .ok_or_else(|| ExamError::NotFound(format!("attempt {}", attempt_id)))
    }

    async fn open_attempt(&self, attempt_id: AttemptId) -> Result<Attempt> {
        let attempt = self.load(attempt_id).await?;
        let attempt = self.check_and_close_if_expired(attempt).await?;
        if !attempt.is_open() {
            return Err(ExamError::InvalidState(format!(
                "attempt {} is closed ({})",
                attempt_id, attempt.status
            )));
        }
        Ok(attempt)
    }

    /// The store refused a write: apply expiry if that is why, then report
    async fn rejected_write(&self, attempt_id: AttemptId) -> ExamError {
        let status = match self.load(attempt_id).await {
            Ok(attempt) => match self.check_and_close_if_expired(attempt).await {
                Ok(current) => current.status.to_string(),
                Err(e) => return e,
            },
            Err(e) => return e,
        };
        ExamError::InvalidState(format!("attempt {} is closed ({})", attempt_id, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryGradingQueue;
    use crate::store::{GradingOutcome, MemoryStore};
    use exam_common::types::{AttemptStatus, CodeTask, MultipleChoiceItem, TestCase};

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryGradingQueue>,
        clock: Arc<ManualClock>,
        lifecycle: Arc<AttemptLifecycle>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryGradingQueue::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let lifecycle = Arc::new(
            AttemptLifecycle::new(store.clone(), queue.clone(), Duration::minutes(60))
                .with_clock(clock.clone()),
        );

        store
            .insert_item(MultipleChoiceItem {
                id: 1,
                subject: "math".to_string(),
                prompt: "2 + 2 = ?".to_string(),
                options: vec!["1".into(), "2".into(), "3".into(), "4".into()],
                correct_index: 3,
                points: 2,
                published: true,
            })
            .await;
        store
            .insert_item(MultipleChoiceItem {
                id: 2,
                subject: "math".to_string(),
                prompt: "draft question".to_string(),
                options: vec!["a".into(), "b".into()],
                correct_index: 0,
                points: 1,
                published: false,
            })
            .await;
        store
            .insert_task(CodeTask {
                id: 10,
                title: "Echo".to_string(),
                statement: "Print the input".to_string(),
                points: 5,
                published: true,
                test_cases: vec![
                    TestCase { id: 1, input: "a".into(), expected_output: "a".into(), hidden: false },
                    TestCase { id: 2, input: "b".into(), expected_output: "b".into(), hidden: true },
                ],
            })
            .await;

        Harness { store, queue, clock, lifecycle }
    }

    #[tokio::test]
    async fn test_start_sets_deadline_from_duration() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::InProgress);
        assert_eq!(attempt.deadline - attempt.started_at, Duration::minutes(60));
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_single_attempt() {
        let h = harness().await;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = h.lifecycle.clone();
                tokio::spawn(async move { lifecycle.start_attempt(5).await })
            })
            .collect();

        let mut ok = 0;
        let mut already = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(ExamError::AlreadyExists(_)) => already += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(already, 7);
    }

    #[tokio::test]
    async fn test_get_attempt_unknown_candidate() {
        let h = harness().await;
        let err = h.lifecycle.get_attempt(99).await.unwrap_err();
        assert!(matches!(err, ExamError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_check_and_close_twice_schedules_once() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();
        h.clock.advance(Duration::minutes(61));

        let first = h.lifecycle.check_and_close_if_expired(attempt.clone()).await.unwrap();
        let second = h.lifecycle.check_and_close_if_expired(attempt).await.unwrap();

        assert_eq!(first.status, AttemptStatus::TimedOut);
        assert_eq!(second.status, AttemptStatus::TimedOut);
        assert_eq!(first.closed_at, second.closed_at);
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_not_yet_expired_is_noop() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();
        h.clock.advance(Duration::minutes(59));

        let same = h.lifecycle.check_and_close_if_expired(attempt.clone()).await.unwrap();
        assert_eq!(same, attempt);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_and_opportunistic_check_race() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();
        h.clock.advance(Duration::minutes(60));

        let mut handles = Vec::new();
        for i in 0..10 {
            let lifecycle = h.lifecycle.clone();
            let attempt = attempt.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    lifecycle.sweep_expired().await.map(|_| ())
                } else {
                    lifecycle.check_and_close_if_expired(attempt).await.map(|_| ())
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let jobs = h.queue.drain().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt_id, attempt.id);
        let stored = h.store.attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_submit_then_everything_is_rejected() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();
        h.lifecycle.record_answer(attempt.id, 1, Some(3)).await.unwrap();

        let submitted = h.lifecycle.submit(attempt.id).await.unwrap();
        assert_eq!(submitted.status, AttemptStatus::Submitted);
        assert_eq!(h.queue.len().await, 1);

        let answer = h.lifecycle.record_answer(attempt.id, 1, Some(0)).await;
        assert!(matches!(answer, Err(ExamError::InvalidState(_))));
        let draft = h
            .lifecycle
            .record_draft(attempt.id, 10, Language::Python, "print(1)")
            .await;
        assert!(matches!(draft, Err(ExamError::InvalidState(_))));
        let again = h.lifecycle.submit(attempt.id).await;
        assert!(matches!(again, Err(ExamError::InvalidState(_))));

        let answers = h.store.answers(attempt.id).await.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].selected_index, Some(3));
        assert!(h.store.submissions(attempt.id).await.unwrap().is_empty());
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_expiry_takes_precedence_over_submit() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();
        h.clock.set(attempt.deadline);

        let err = h.lifecycle.submit(attempt.id).await.unwrap_err();
        assert!(matches!(err, ExamError::InvalidState(_)));

        let stored = h.store.attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::TimedOut);
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_answer_after_deadline_closes_attempt() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();
        h.clock.advance(Duration::minutes(75));

        let err = h.lifecycle.record_answer(attempt.id, 1, Some(3)).await.unwrap_err();
        assert!(matches!(err, ExamError::InvalidState(_)));
        assert!(h.store.answers(attempt.id).await.unwrap().is_empty());

        let stored = h.store.attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::TimedOut);
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_unpublished_or_missing_references_are_not_found() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();

        let unpublished = h.lifecycle.record_answer(attempt.id, 2, Some(0)).await;
        assert!(matches!(unpublished, Err(ExamError::NotFound(_))));
        let missing_task = h
            .lifecycle
            .record_draft(attempt.id, 404, Language::Cpp, "int main(){}")
            .await;
        assert!(matches!(missing_task, Err(ExamError::NotFound(_))));
        let missing_attempt = h.lifecycle.submit(uuid::Uuid::new_v4()).await;
        assert!(matches!(missing_attempt, Err(ExamError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_saving_twice_overwrites() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();

        h.lifecycle.record_draft(attempt.id, 10, Language::Python, "print(1)").await.unwrap();
        h.lifecycle.record_draft(attempt.id, 10, Language::Node, "console.log(1)").await.unwrap();
        h.lifecycle.record_answer(attempt.id, 1, Some(1)).await.unwrap();
        h.lifecycle.record_answer(attempt.id, 1, None).await.unwrap();

        let drafts = h.store.submissions(attempt.id).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].language, Some(Language::Node));
        let answers = h.store.answers(attempt.id).await.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].selected_index, None);
    }

    #[tokio::test]
    async fn test_result_requires_closed_attempt() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();

        let err = h.lifecycle.get_result(attempt.id).await.unwrap_err();
        assert!(matches!(err, ExamError::InvalidState(_)));

        h.lifecycle.submit(attempt.id).await.unwrap();
        let pending = h.lifecycle.get_result(attempt.id).await.unwrap();
        assert_eq!(pending.status, AttemptStatus::Submitted);
        assert_eq!(pending.total_score, None);
        assert!(pending.per_item.is_empty());
    }

    #[tokio::test]
    async fn test_result_after_grading() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();
        h.lifecycle.record_answer(attempt.id, 1, Some(3)).await.unwrap();
        h.lifecycle.submit(attempt.id).await.unwrap();

        h.store
            .save_grading(&GradingOutcome {
                attempt_id: attempt.id,
                answers: vec![crate::store::AnswerGrade { item_id: 1, is_correct: true }],
                submissions: Vec::new(),
                score_total: 2,
                score_blocks: BTreeMap::from([("math".to_string(), 2), ("code".to_string(), 0)]),
            })
            .await
            .unwrap();

        let result = h.lifecycle.get_result(attempt.id).await.unwrap();
        assert_eq!(result.total_score, Some(2));
        assert_eq!(result.block_scores.get("math"), Some(&2));
        assert_eq!(result.per_item.get(&1), Some(&true));
    }

    #[tokio::test]
    async fn test_sweep_only_closes_overdue() {
        let h = harness().await;
        let early = h.lifecycle.start_attempt(1).await.unwrap();
        h.clock.advance(Duration::minutes(30));
        let late = h.lifecycle.start_attempt(2).await.unwrap();
        h.clock.advance(Duration::minutes(31));

        assert_eq!(h.lifecycle.sweep_expired().await.unwrap(), 1);
        assert_eq!(h.lifecycle.sweep_expired().await.unwrap(), 0);

        let early = h.store.attempt(early.id).await.unwrap().unwrap();
        let late = h.store.attempt(late.id).await.unwrap().unwrap();
        assert_eq!(early.status, AttemptStatus::TimedOut);
        assert_eq!(late.status, AttemptStatus::InProgress);
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_requeue_ungraded_closed_attempts() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();
        h.lifecycle.start_attempt(2).await.unwrap();
        h.lifecycle.submit(attempt.id).await.unwrap();
        h.queue.drain().await;

        assert_eq!(h.lifecycle.requeue_ungraded().await.unwrap(), 1);
        let jobs = h.queue.drain().await;
        assert_eq!(jobs[0].attempt_id, attempt.id);
    }

    #[tokio::test]
    async fn test_exam_view_hides_answers_and_hidden_cases() {
        let h = harness().await;
        let attempt = h.lifecycle.start_attempt(1).await.unwrap();
        h.lifecycle.record_answer(attempt.id, 1, Some(2)).await.unwrap();

        let view = h.lifecycle.exam_view(1).await.unwrap();
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.tasks[0].samples.len(), 1);
        assert_eq!(view.answers.get(&1), Some(&Some(2)));
    }
}

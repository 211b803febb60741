//! Transactional store abstraction.
//!
//! The lifecycle controller and the grading orchestrator only talk to
//! [`ExamStore`]. Every method is atomic on its own; the two guarded
//! operations ([`ExamStore::close_attempt`] and the answer/draft upserts)
//! are the serialization points for an attempt.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exam_common::types::{
    Attempt, AttemptId, AttemptStatus, AnswerRecord, CandidateId, CodeSubmissionRecord, CodeTask,
    ItemId, Language, MultipleChoiceItem, TaskId, Verdict,
};
use std::collections::BTreeMap;

/// Why an attempt is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Deadline reached; only wins if `now >= deadline`
    Expired,
    /// Explicit submission; only wins if `now < deadline`
    Submitted,
}

impl CloseReason {
    pub fn target_status(&self) -> AttemptStatus {
        match self {
            CloseReason::Expired => AttemptStatus::TimedOut,
            CloseReason::Submitted => AttemptStatus::Submitted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerGrade {
    pub item_id: ItemId,
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionGrade {
    pub task_id: TaskId,
    pub verdicts: Vec<Verdict>,
    pub is_correct: bool,
}

/// Everything one grading pass writes, committed as a unit
#[derive(Debug, Clone, PartialEq)]
pub struct GradingOutcome {
    pub attempt_id: AttemptId,
    pub answers: Vec<AnswerGrade>,
    pub submissions: Vec<SubmissionGrade>,
    pub score_total: i64,
    pub score_blocks: BTreeMap<String, i64>,
}

#[async_trait]
pub trait ExamStore: Send + Sync {
    /// Insert a new in-progress attempt. Fails with `AlreadyExists` when the
    /// candidate already owns one (uniqueness is enforced by the store).
    async fn create_attempt(
        &self,
        candidate_id: CandidateId,
        started_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<Attempt>;

    async fn attempt(&self, id: AttemptId) -> Result<Option<Attempt>>;

    async fn attempt_by_candidate(&self, candidate_id: CandidateId) -> Result<Option<Attempt>>;

    /// Compare-and-set on status: moves an `in_progress` attempt into the
    /// terminal state for `reason`, stamping `closed_at = now`. Returns the
    /// updated attempt only for the caller that won the transition.
    async fn close_attempt(
        &self,
        id: AttemptId,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<Option<Attempt>>;

    /// Attempts still in progress whose deadline is `<= now`
    async fn overdue_attempt_ids(&self, now: DateTime<Utc>) -> Result<Vec<AttemptId>>;

    /// Closed attempts without a stored score
    async fn ungraded_attempt_ids(&self) -> Result<Vec<AttemptId>>;

    /// Upsert by (attempt, item). Returns `false` without writing when the
    /// attempt is closed or past its deadline.
    async fn upsert_answer(
        &self,
        attempt_id: AttemptId,
        item_id: ItemId,
        selected_index: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Upsert by (attempt, task), same guard as [`ExamStore::upsert_answer`]
    async fn upsert_draft(
        &self,
        attempt_id: AttemptId,
        task_id: TaskId,
        language: Language,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn answers(&self, attempt_id: AttemptId) -> Result<Vec<AnswerRecord>>;

    async fn submissions(&self, attempt_id: AttemptId) -> Result<Vec<CodeSubmissionRecord>>;

    /// Batch lookup; missing ids are simply absent from the result
    async fn items(&self, ids: &[ItemId]) -> Result<Vec<MultipleChoiceItem>>;

    /// Batch lookup with test cases in judging order
    async fn tasks(&self, ids: &[TaskId]) -> Result<Vec<CodeTask>>;

    async fn published_items(&self) -> Result<Vec<MultipleChoiceItem>>;

    async fn published_tasks(&self) -> Result<Vec<CodeTask>>;

    /// Write correctness, verdicts and scores for one attempt in a single
    /// transaction. Refuses attempts that are still in progress.
    async fn save_grading(&self, outcome: &GradingOutcome) -> Result<()>;
}

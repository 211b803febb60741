/// Grading Orchestrator
///
/// Scores one closed attempt end to end and commits the result in a single
/// `save_grading` call. Running it again recomputes and overwrites the same
/// rows, so duplicate or retried jobs are harmless.
use crate::engine::ExecutionEngine;
use crate::evaluator::judge;
use anyhow::Result;
use exam_common::types::{AttemptId, CodeSubmissionRecord, CodeTask};
use exam_core::store::{AnswerGrade, ExamStore, GradingOutcome, SubmissionGrade};
use exam_core::ExamError;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Score bucket shared by all code tasks
pub const CODE_BLOCK: &str = "code";

pub struct GradingService {
    store: Arc<dyn ExamStore>,
    engine: Arc<dyn ExecutionEngine>,
    concurrency: usize,
}

impl GradingService {
    pub fn new(store: Arc<dyn ExamStore>, engine: Arc<dyn ExecutionEngine>, concurrency: usize) -> Self {
        Self {
            store,
            engine,
            concurrency: concurrency.max(1),
        }
    }

    #[tracing::instrument(skip(self), fields(attempt_id = %attempt_id))]
    pub async fn grade_attempt(&self, attempt_id: AttemptId) -> Result<GradingOutcome> {
        let attempt = self
            .store
            .attempt(attempt_id)
            .await?
            .ok_or_else(|| ExamError::NotFound(format!("attempt {}", attempt_id)))?;
        if attempt.is_open() {
            return Err(ExamError::InvalidState(format!("attempt {} is still in progress", attempt_id)).into());
        }

        // Every published subject gets a bucket, answered or not
        let mut blocks: BTreeMap<String, i64> = self
            .store
            .published_items()
            .await?
            .into_iter()
            .map(|item| (item.subject, 0))
            .collect();

        // Multiple choice
        let answers = self.store.answers(attempt_id).await?;
        let item_ids: Vec<_> = answers.iter().map(|a| a.item_id).collect();
        let items: HashMap<_, _> = self
            .store
            .items(&item_ids)
            .await?
            .into_iter()
            .map(|item| (item.id, item))
            .collect();

        let mut answer_grades = Vec::with_capacity(answers.len());
        for answer in &answers {
            let is_correct = match items.get(&answer.item_id) {
                Some(item) => {
                    let correct = answer.selected_index == Some(item.correct_index);
                    let bucket = blocks.entry(item.subject.clone()).or_insert(0);
                    if correct {
                        *bucket += item.points;
                    }
                    correct
                }
                None => false,
            };
            answer_grades.push(AnswerGrade {
                item_id: answer.item_id,
                is_correct,
            });
        }

        // Code
        let submissions = self.store.submissions(attempt_id).await?;
        let task_ids: Vec<_> = submissions.iter().map(|s| s.task_id).collect();
        let tasks: HashMap<_, _> = self
            .store
            .tasks(&task_ids)
            .await?
            .into_iter()
            .map(|task| (task.id, task))
            .collect();

        let judged: Vec<Result<(SubmissionGrade, i64)>> = stream::iter(submissions.iter())
            .map(|submission| self.grade_submission(submission, tasks.get(&submission.task_id)))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut submission_grades = Vec::with_capacity(judged.len());
        let mut code_points = 0;
        for result in judged {
            let (grade, points) = result?;
            code_points += points;
            submission_grades.push(grade);
        }
        blocks.insert(CODE_BLOCK.to_string(), code_points);

        let outcome = GradingOutcome {
            attempt_id,
            answers: answer_grades,
            submissions: submission_grades,
            score_total: blocks.values().sum(),
            score_blocks: blocks,
        };
        self.store.save_grading(&outcome).await?;

        info!(
            attempt_id = %attempt_id,
            status = %attempt.status,
            score_total = outcome.score_total,
            blocks = ?outcome.score_blocks,
            answers = outcome.answers.len(),
            submissions = outcome.submissions.len(),
            "Attempt graded"
        );
        Ok(outcome)
    }

    /// Returns the grade and the points it earns
    async fn grade_submission(
        &self,
        submission: &CodeSubmissionRecord,
        task: Option<&CodeTask>,
    ) -> Result<(SubmissionGrade, i64)> {
        let empty = SubmissionGrade {
            task_id: submission.task_id,
            verdicts: Vec::new(),
            is_correct: false,
        };
        let Some(task) = task else {
            debug!(task_id = submission.task_id, "Task no longer exists");
            return Ok((empty, 0));
        };
        let Some((language, code)) = submission.judgeable() else {
            debug!(task_id = task.id, "Empty submission, not judged");
            return Ok((empty, 0));
        };

        let judgement = judge(self.engine.as_ref(), language, code, &task.test_cases).await?;
        debug!(
            task_id = task.id,
            language = %language,
            verdicts = ?judgement.verdicts,
            is_correct = judgement.all_accepted,
            "Submission judged"
        );

        let points = if judgement.all_accepted { task.points } else { 0 };
        Ok((
            SubmissionGrade {
                task_id: task.id,
                verdicts: judgement.verdicts,
                is_correct: judgement.all_accepted,
            },
            points,
        ))
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type AttemptId = Uuid;
pub type CandidateId = i64;
pub type ItemId = i64;
pub type TaskId = i64;

/// Languages with a pre-built execution template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Node,
    Cpp,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::Node, Language::Cpp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Node => "node",
            Language::Cpp => "cpp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(pub String);

impl fmt::Display for UnknownLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown language '{}'", self.0)
    }
}

impl std::error::Error for UnknownLanguage {}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "node" => Ok(Language::Node),
            "cpp" => Ok(Language::Cpp),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

/// Attempt lifecycle: `InProgress` moves forward to exactly one terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Submitted,
    TimedOut,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::InProgress)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(AttemptStatus::InProgress),
            "submitted" => Ok(AttemptStatus::Submitted),
            "timed_out" => Ok(AttemptStatus::TimedOut),
            other => Err(format!("unknown attempt status '{}'", other)),
        }
    }
}

/// Per-test-case judging outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::RuntimeError => "RE",
            Verdict::TimeLimitExceeded => "TLE",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub candidate_id: CandidateId,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub score_total: Option<i64>,
    pub score_blocks: Option<BTreeMap<String, i64>>,
}

impl Attempt {
    pub fn is_open(&self) -> bool {
        self.status == AttemptStatus::InProgress
    }

    /// Still marked in progress although the deadline has passed
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && now >= self.deadline
    }

    pub fn is_graded(&self) -> bool {
        self.score_total.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipleChoiceItem {
    pub id: ItemId,
    pub subject: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub correct_index: i32,
    pub points: i64,
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub input: String,
    pub expected_output: String,
    pub hidden: bool,
}

/// A programming problem; `test_cases` are kept in judging order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeTask {
    pub id: TaskId,
    pub title: String,
    pub statement: String,
    pub points: i64,
    pub published: bool,
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub attempt_id: AttemptId,
    pub item_id: ItemId,
    pub selected_index: Option<i32>,
    pub is_correct: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSubmissionRecord {
    pub attempt_id: AttemptId,
    pub task_id: TaskId,
    pub language: Option<Language>,
    pub code: Option<String>,
    pub verdicts: Vec<Verdict>,
    pub is_correct: Option<bool>,
}

impl CodeSubmissionRecord {
    /// Language and non-blank code, i.e. something that can be judged
    pub fn judgeable(&self) -> Option<(Language, &str)> {
        let language = self.language?;
        let code = self.code.as_deref()?;
        if code.trim().is_empty() {
            return None;
        }
        Some((language, code))
    }
}

/// Payload pushed to the grading queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingJob {
    pub attempt_id: AttemptId,
    #[serde(default)]
    pub retries: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl GradingJob {
    pub fn new(attempt_id: AttemptId) -> Self {
        Self {
            attempt_id,
            retries: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn retry(&self) -> Self {
        Self {
            attempt_id: self.attempt_id,
            retries: self.retries + 1,
            enqueued_at: Utc::now(),
        }
    }
}

/// Candidate-facing view of a multiple-choice item (no correct index)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicItem {
    pub id: ItemId,
    pub subject: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub points: i64,
}

impl From<&MultipleChoiceItem> for PublicItem {
    fn from(item: &MultipleChoiceItem) -> Self {
        Self {
            id: item.id,
            subject: item.subject.clone(),
            prompt: item.prompt.clone(),
            options: item.options.clone(),
            points: item.points,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleCase {
    pub input: String,
    pub expected_output: String,
}

/// Candidate-facing view of a code task; hidden test cases are stripped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicTask {
    pub id: TaskId,
    pub title: String,
    pub statement: String,
    pub points: i64,
    pub samples: Vec<SampleCase>,
}

impl From<&CodeTask> for PublicTask {
    fn from(task: &CodeTask) -> Self {
        Self {
            id: task.id,
            title: task.title.clone(),
            statement: task.statement.clone(),
            points: task.points,
            samples: task
                .test_cases
                .iter()
                .filter(|tc| !tc.hidden)
                .map(|tc| SampleCase {
                    input: tc.input.clone(),
                    expected_output: tc.expected_output.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub language: Option<Language>,
    pub code: Option<String>,
}

/// Everything a candidate sees while sitting the exam
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamView {
    pub attempt: Attempt,
    pub items: Vec<PublicItem>,
    pub tasks: Vec<PublicTask>,
    pub answers: BTreeMap<ItemId, Option<i32>>,
    pub drafts: BTreeMap<TaskId, Draft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub attempt_id: AttemptId,
    pub status: AttemptStatus,
    /// `None` until grading has completed
    pub total_score: Option<i64>,
    pub block_scores: BTreeMap<String, i64>,
    pub per_item: BTreeMap<ItemId, bool>,
    pub per_task: BTreeMap<TaskId, bool>,
}

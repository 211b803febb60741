/// Verdict Engine - judges one submission against its ordered test cases
///
/// **Policy: fail-fast-with-fill**
/// - Compile once; a failed compile is RE for every case, a compile that
///   hits the timeout is TLE for every case, nothing is run
/// - Cases run strictly in order, one at a time
/// - The first RE or TLE is recorded for that case and copied onto every
///   remaining case, which are never run
/// - WA does not stop the run
///
/// **Normalization Rules:**
/// - `\r\n` and lone `\r` become `\n`
/// - Each line is right-trimmed, then trailing blank lines are dropped
/// - Leading and internal whitespace and casing are preserved
///
/// Sandbox failures (`Err`) propagate; they are never turned into verdicts.
use crate::engine::{CompileOutcome, ExecutionEngine, ExecutionSession, RunOutcome, MAX_SOURCE_CODE_BYTES};
use anyhow::Result;
use exam_common::types::{Language, TestCase, Verdict};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgement {
    pub verdicts: Vec<Verdict>,
    pub all_accepted: bool,
}

impl Judgement {
    fn from_verdicts(verdicts: Vec<Verdict>) -> Self {
        let all_accepted = verdicts.iter().all(|v| *v == Verdict::Accepted);
        Self {
            verdicts,
            all_accepted,
        }
    }
}

pub fn normalize_output(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = unified.split('\n').map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

#[tracing::instrument(skip(engine, code, test_cases), fields(language = %language, test_count = test_cases.len()))]
pub async fn judge(
    engine: &dyn ExecutionEngine,
    language: Language,
    code: &str,
    test_cases: &[TestCase],
) -> Result<Judgement> {
    if test_cases.is_empty() {
        return Ok(Judgement::from_verdicts(Vec::new()));
    }
    if code.len() > MAX_SOURCE_CODE_BYTES {
        debug!(source_size = code.len(), "Oversized submission rejected without running");
        return Ok(Judgement::from_verdicts(vec![Verdict::RuntimeError; test_cases.len()]));
    }

    let mut session = engine.open_session(language, code).await?;
    let verdicts = run_cases(session.as_mut(), test_cases).await;
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to tear down execution session");
    }

    let judgement = Judgement::from_verdicts(verdicts?);
    debug!(
        accepted = judgement.verdicts.iter().filter(|v| **v == Verdict::Accepted).count(),
        all_accepted = judgement.all_accepted,
        "Submission judged"
    );
    Ok(judgement)
}

async fn run_cases(session: &mut dyn ExecutionSession, test_cases: &[TestCase]) -> Result<Vec<Verdict>> {
    match session.compile().await? {
        CompileOutcome::Compiled => {}
        CompileOutcome::Failed { .. } => {
            debug!("Compilation failed; every case is RE");
            return Ok(vec![Verdict::RuntimeError; test_cases.len()]);
        }
        CompileOutcome::TimedOut => {
            debug!("Compilation timed out; every case is TLE");
            return Ok(vec![Verdict::TimeLimitExceeded; test_cases.len()]);
        }
    }

    let mut verdicts = Vec::with_capacity(test_cases.len());
    for case in test_cases {
        let output = session.run(&case.input).await?;
        let verdict = match output.outcome {
            RunOutcome::Ok if outputs_match(&output.stdout, &case.expected_output) => Verdict::Accepted,
            RunOutcome::Ok => Verdict::WrongAnswer,
            RunOutcome::RuntimeError => Verdict::RuntimeError,
            RunOutcome::TimeLimitExceeded => Verdict::TimeLimitExceeded,
        };
        debug!(
            test_case_id = case.id,
            verdict = %verdict,
            execution_ms = output.execution_time_ms,
            exit_code = ?output.exit_code,
            "Test case judged"
        );
        verdicts.push(verdict);

        if matches!(verdict, Verdict::RuntimeError | Verdict::TimeLimitExceeded) {
            verdicts.resize(test_cases.len(), verdict);
            break;
        }
    }
    Ok(verdicts)
}

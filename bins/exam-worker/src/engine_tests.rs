/// Docker-backed tests for the execution engine and verdict engine
///
/// These need a Docker daemon and the templates from `judge_images/`
/// (`exam-cli build-images`), so they are ignored by default:
///
///     cargo test -p exam-worker -- --ignored
use crate::config::LanguageConfigManager;
use crate::engine::{DockerEngine, ExecutionEngine, RunOutcome};
use crate::evaluator::judge;
use exam_common::types::{Language, TestCase, Verdict};
use std::path::Path;
use std::time::Duration;

fn engine() -> DockerEngine {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
    let languages = LanguageConfigManager::load(&path).expect("Failed to load language config");
    DockerEngine::new(languages, Duration::from_millis(1200), 64 * 1024).expect("Failed to create Docker engine")
}

fn case(id: i64, input: &str, expected: &str) -> TestCase {
    TestCase {
        id,
        input: input.to_string(),
        expected_output: expected.to_string(),
        hidden: false,
    }
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_templates_present() {
    engine().verify_templates().await.expect("templates should be built");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_python_reads_stdin() {
    let output = engine()
        .execute(Language::Python, "a, b = map(int, input().split())\nprint(a + b)\n", "2 3\n")
        .await
        .unwrap();
    assert_eq!(output.outcome, RunOutcome::Ok);
    assert_eq!(output.stdout.trim_end(), "5");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_cpp_compiles_once_and_runs_all_cases() {
    let source = r#"
#include <iostream>
int main() { long long n; std::cin >> n; std::cout << n * 2 << "\n"; }
"#;
    let cases = [case(1, "5", "10"), case(2, "21", "42"), case(3, "0", "1")];
    let judgement = judge(&engine(), Language::Cpp, source, &cases).await.unwrap();
    assert_eq!(
        judgement.verdicts,
        vec![Verdict::Accepted, Verdict::Accepted, Verdict::WrongAnswer]
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_cpp_compile_error_is_re() {
    let cases = [case(1, "1", "1"), case(2, "2", "2")];
    let judgement = judge(&engine(), Language::Cpp, "int main( {", &cases).await.unwrap();
    assert_eq!(judgement.verdicts, vec![Verdict::RuntimeError; 2]);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_infinite_loop_is_tle() {
    let output = engine()
        .execute(Language::Node, "while (true) {}", "")
        .await
        .unwrap();
    assert_eq!(output.outcome, RunOutcome::TimeLimitExceeded);
    assert!(output.execution_time_ms < 5000);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_hang_after_closing_stdio_is_tle() {
    let source = "import os\nos.close(1)\nos.close(2)\nwhile True:\n    pass\n";
    let output = engine().execute(Language::Python, source, "").await.unwrap();
    assert_eq!(output.outcome, RunOutcome::TimeLimitExceeded);

    let cases = [case(1, "", ""), case(2, "", "")];
    let judgement = judge(&engine(), Language::Python, source, &cases).await.unwrap();
    assert_eq!(judgement.verdicts, vec![Verdict::TimeLimitExceeded; 2]);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_nonzero_exit_is_re() {
    let output = engine()
        .execute(Language::Python, "import sys\nsys.exit(3)\n", "")
        .await
        .unwrap();
    assert_eq!(output.outcome, RunOutcome::RuntimeError);
    assert_eq!(output.exit_code, Some(3));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_network_is_unreachable() {
    let source = r#"
import socket
try:
    socket.create_connection(("1.1.1.1", 53), timeout=0.5)
    print("connected")
except OSError:
    print("blocked")
"#;
    let output = engine().execute(Language::Python, source, "").await.unwrap();
    assert_eq!(output.stdout.trim_end(), "blocked");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_memory_ceiling_is_re() {
    let output = engine()
        .execute(Language::Python, "x = bytearray(1024 * 1024 * 1024)\nprint(len(x))\n", "")
        .await
        .unwrap();
    assert_eq!(output.outcome, RunOutcome::RuntimeError);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_fork_bomb_is_contained() {
    let source = r#"
import os
pids = 0
try:
    for _ in range(500):
        if os.fork() == 0:
            import time
            time.sleep(5)
            os._exit(0)
        pids += 1
except OSError:
    print("limited")
"#;
    let output = engine().execute(Language::Python, source, "").await.unwrap();
    assert!(output.stdout.contains("limited") || output.outcome != RunOutcome::Ok);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_output_is_truncated_not_failed() {
    let output = engine()
        .execute(Language::Python, "print('x' * (1024 * 1024))\n", "")
        .await
        .unwrap();
    assert_eq!(output.outcome, RunOutcome::Ok);
    assert_eq!(output.stdout.len(), 64 * 1024);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_runs_do_not_share_scratch_directory() {
    let source = r#"
import os
print(len(os.listdir(".")))
open("marker", "w").write("x")
"#;
    let cases = [case(1, "", "0"), case(2, "", "0")];
    let judgement = judge(&engine(), Language::Python, source, &cases).await.unwrap();
    assert!(judgement.all_accepted);
}

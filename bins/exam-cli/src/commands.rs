use anyhow::{bail, Context, Result};
use exam_common::config::Settings;
use exam_common::types::{Language, TestCase};
use exam_core::{AttemptLifecycle, ExamStore, PgStore, RedisGradingQueue};
use exam_worker::config::{LanguageConfig, LanguageConfigManager};
use exam_worker::engine::DockerEngine;
use exam_worker::evaluator::judge;
use exam_worker::grading::GradingService;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use uuid::Uuid;

fn load_settings() -> Result<Settings> {
    Settings::from_env().map_err(anyhow::Error::msg)
}

fn load_languages(settings: &Settings) -> Result<LanguageConfigManager> {
    LanguageConfigManager::load(Path::new(&settings.languages_config))
}

fn docker_engine(settings: &Settings) -> Result<DockerEngine> {
    DockerEngine::new(
        load_languages(settings)?,
        settings.exec_timeout(),
        settings.max_output_bytes,
    )
}

async fn connect_store(settings: &Settings) -> Result<Arc<dyn ExamStore>> {
    let store = PgStore::connect(&settings.database_url)
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Failed to run migrations")?;
    Ok(Arc::new(store))
}

async fn lifecycle(settings: &Settings) -> Result<AttemptLifecycle> {
    let store = connect_store(settings).await?;
    let queue = RedisGradingQueue::connect(&settings.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    Ok(AttemptLifecycle::new(store, Arc::new(queue), settings.attempt_duration()))
}

/// List all configured languages
pub fn list_languages() -> Result<()> {
    let languages = load_languages(&load_settings()?)?;

    println!("📋 Configured Languages:\n");
    println!(
        "{:<8} {:<8} {:<22} {:<9} {:<6} {:<6} {}",
        "Name", "Version", "Image", "Compiled", "CPU", "Pids", "Memory"
    );
    println!("{}", "─".repeat(76));

    for lang in languages.configs() {
        println!(
            "{:<8} {:<8} {:<22} {:<9} {:<6.1} {:<6} {} MB",
            lang.name.as_str(),
            lang.version,
            lang.image,
            if lang.compile.is_some() { "yes" } else { "no" },
            lang.cpu_limit,
            lang.pids_limit,
            lang.memory_limit_mb
        );
    }
    Ok(())
}

fn image_exists(image: &str) -> bool {
    Command::new("docker")
        .args(["image", "inspect", image])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn build_image(config: &LanguageConfig, no_cache: bool) -> Result<()> {
    let dockerfile_path = Path::new(&config.dockerfile_path);
    if !dockerfile_path.exists() {
        bail!("Dockerfile not found at {}", dockerfile_path.display());
    }
    let build_context = dockerfile_path.parent().unwrap_or_else(|| Path::new("."));

    let mut docker_args = vec![
        "build".to_string(),
        "-t".to_string(),
        config.image.clone(),
        "-f".to_string(),
        dockerfile_path.to_string_lossy().to_string(),
    ];
    if no_cache {
        docker_args.push("--no-cache".to_string());
    }
    docker_args.push(build_context.to_string_lossy().to_string());

    println!("\n🔨 Running: docker {}", docker_args.join(" "));
    let status = Command::new("docker")
        .args(&docker_args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to execute docker build. Is Docker installed and running?")?;

    if !status.success() {
        bail!("Docker build for {} failed with exit code: {:?}", config.name, status.code());
    }
    println!("✅ Built {}", config.image);
    Ok(())
}

/// Build judge images; existing images are kept unless `force`
pub async fn build_images(only: Option<Language>, force: bool, no_cache: bool) -> Result<()> {
    let languages = load_languages(&load_settings()?)?;

    for config in languages.configs() {
        if only.is_some_and(|l| l != config.name) {
            continue;
        }
        if !force && image_exists(&config.image) {
            println!("✓ {} already present ({})", config.image, config.name);
            continue;
        }
        println!("🐳 Building image for: {}", config.name);
        build_image(config, no_cache)?;
    }
    Ok(())
}

pub async fn check_images() -> Result<()> {
    docker_engine(&load_settings()?)?.verify_templates().await?;
    println!("✅ All execution templates present");
    Ok(())
}

pub async fn sweep() -> Result<()> {
    let closed = lifecycle(&load_settings()?).await?.sweep_expired().await?;
    println!("Closed {} expired attempt(s)", closed);
    Ok(())
}

pub async fn requeue_ungraded() -> Result<()> {
    let requeued = lifecycle(&load_settings()?).await?.requeue_ungraded().await?;
    println!("Enqueued grading for {} attempt(s)", requeued);
    Ok(())
}

pub async fn grade(attempt_id: Uuid) -> Result<()> {
    let settings = load_settings()?;
    let engine = docker_engine(&settings)?;
    engine.verify_templates().await?;
    let store = connect_store(&settings).await?;

    let grading = GradingService::new(store, Arc::new(engine), settings.grading_concurrency);
    let outcome = grading.grade_attempt(attempt_id).await?;

    println!("Attempt {}", attempt_id);
    for (block, score) in &outcome.score_blocks {
        println!("  {:<10} {}", block, score);
    }
    println!("  {:<10} {}", "total", outcome.score_total);
    Ok(())
}

/// Parse `INPUT=>EXPECTED`, with `\n` standing for a newline
fn parse_case(id: i64, raw: &str) -> Result<TestCase> {
    let Some((input, expected)) = raw.split_once("=>") else {
        bail!("Test case '{}' must look like INPUT=>EXPECTED", raw);
    };
    Ok(TestCase {
        id,
        input: input.replace("\\n", "\n"),
        expected_output: expected.replace("\\n", "\n"),
        hidden: false,
    })
}

pub async fn judge_file(language: Language, file: &Path, raw_cases: &[String]) -> Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let cases = raw_cases
        .iter()
        .enumerate()
        .map(|(i, raw)| parse_case(i as i64 + 1, raw))
        .collect::<Result<Vec<_>>>()?;

    let engine = docker_engine(&load_settings()?)?;
    let judgement = judge(&engine, language, &code, &cases).await?;

    for (case, verdict) in cases.iter().zip(&judgement.verdicts) {
        println!("  case {:<3} {}", case.id, verdict);
    }
    if judgement.all_accepted {
        println!("✅ All test cases accepted");
    } else {
        println!("❌ Not accepted");
    }
    Ok(())
}

use anyhow::Context;
use exam_common::config::Settings;
use exam_common::redis;
use exam_common::types::GradingJob;
use exam_core::{AttemptLifecycle, ExamError, ExamStore, GradingQueue, PgStore, RedisGradingQueue};
use exam_worker::config::LanguageConfigManager;
use exam_worker::engine::DockerEngine;
use exam_worker::grading::GradingService;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, instrument, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Exam worker booting...");

    let settings = Settings::from_env().map_err(anyhow::Error::msg)?;

    let languages = LanguageConfigManager::load(Path::new(&settings.languages_config)).map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        error!("Make sure {} exists", settings.languages_config);
        e
    })?;
    info!(languages = ?languages.list_languages(), "Loaded language configurations");

    let engine = DockerEngine::new(languages, settings.exec_timeout(), settings.max_output_bytes)?;
    engine
        .verify_templates()
        .await
        .context("Execution templates unavailable; run `exam-cli build-images`")?;

    let store = PgStore::connect(&settings.database_url)
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Failed to run migrations")?;
    let store: Arc<dyn ExamStore> = Arc::new(store);
    info!("Connected to database");

    let queue = Arc::new(RedisGradingQueue::connect(&settings.redis_url).await?);
    let client = ::redis::Client::open(settings.redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;
    info!(redis_url = %settings.redis_url, "Connected to Redis");

    let lifecycle = AttemptLifecycle::new(store.clone(), queue.clone(), settings.attempt_duration());
    let grading = GradingService::new(store, Arc::new(engine), settings.grading_concurrency);

    recover_ungraded(&lifecycle).await;

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal");
    };

    tokio::select! {
        _ = worker_loop(&mut redis_conn, &grading, queue, settings.grading_max_retries) => {},
        _ = sweep_loop(&lifecycle, settings.sweep_interval()) => {},
        _ = shutdown => {},
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[instrument(skip_all)]
async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    grading: &GradingService,
    queue: Arc<RedisGradingQueue>,
    max_retries: u32,
) {
    loop {
        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_grading_job(redis_conn, 5.0).await {
            Ok(Some(job)) => {
                info!(attempt_id = %job.attempt_id, retries = job.retries, "Received grading job");
                if let Err(e) = grading.grade_attempt(job.attempt_id).await {
                    handle_failure(job, e, queue.clone(), max_retries);
                }
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn handle_failure(job: GradingJob, e: anyhow::Error, queue: Arc<RedisGradingQueue>, max_retries: u32) {
    let attempt_id = job.attempt_id;

    if let Some(exam_error) = e.downcast_ref::<ExamError>() {
        if !exam_error.is_infrastructure() {
            warn!(attempt_id = %attempt_id, error = %e, "Dropping grading job");
            return;
        }
    }

    if job.retries >= max_retries {
        error!(
            attempt_id = %attempt_id,
            retries = job.retries,
            error = %format!("{:#}", e),
            "Grading failed permanently; attempt stays ungraded until requeued"
        );
        return;
    }

    let retry = job.retry();
    let delay = retry_delay(retry.retries);
    warn!(
        attempt_id = %attempt_id,
        retries = retry.retries,
        delay_secs = delay.as_secs(),
        error = %format!("{:#}", e),
        "Grading failed; retrying"
    );
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = queue.enqueue(retry).await {
            error!(attempt_id = %attempt_id, error = %e, "Failed to re-enqueue grading job");
        }
    });
}

fn retry_delay(retries: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(retries.min(6)))
}

/// Jobs popped by a previous worker that died mid-grade, or parked in a retry
/// backoff at shutdown, are gone from Redis; re-enqueue every closed attempt
/// that still has no score
async fn recover_ungraded(lifecycle: &AttemptLifecycle) -> usize {
    match lifecycle.requeue_ungraded().await {
        Ok(0) => 0,
        Ok(requeued) => {
            info!(requeued, "Re-enqueued ungraded attempts");
            requeued
        }
        Err(e) => {
            error!(error = %e, "Failed to re-enqueue ungraded attempts");
            0
        }
    }
}

/// Periodic expiry sweep; the opportunistic check covers the gaps between ticks
#[instrument(skip_all, fields(interval_secs = interval.as_secs()))]
async fn sweep_loop(lifecycle: &AttemptLifecycle, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = lifecycle.sweep_expired().await {
            error!(error = %e, "Expiry sweep failed");
        }
    }
}

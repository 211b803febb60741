use crate::types::GradingJob;
use redis::{AsyncCommands, RedisResult};

/// Redis queue semantics - defines only semantics, not runtime logic
/// Keeps the lifecycle controller (producer) and the grading worker
/// (consumer) agreeing on key names and payload encoding.

pub const QUEUE_PREFIX: &str = "exam:queue";
pub const GRADING_QUEUE: &str = "grading";

/// Generate deterministic queue name
pub fn queue_name(queue: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, queue)
}

fn encode(job: &GradingJob) -> RedisResult<String> {
    serde_json::to_string(job).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
    })
}

fn decode(payload: &str) -> RedisResult<GradingJob> {
    serde_json::from_str(payload).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
    })
}

/// Push a grading job
/// Uses RPUSH for FIFO semantics
pub async fn push_grading_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &GradingJob,
) -> RedisResult<()> {
    let payload = encode(job)?;
    conn.rpush(queue_name(GRADING_QUEUE), payload).await
}

/// Pop a grading job
/// Uses BLPOP with timeout for graceful shutdown
pub async fn pop_grading_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<GradingJob>> {
    let result: Option<(String, String)> =
        conn.blpop(queue_name(GRADING_QUEUE), timeout_seconds).await?;

    match result {
        Some((_key, payload)) => Ok(Some(decode(&payload)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_queue_naming() {
        assert_eq!(queue_name(GRADING_QUEUE), "exam:queue:grading");
    }

    #[test]
    fn test_payload_roundtrip_keeps_retry_count() {
        let job = GradingJob::new(Uuid::new_v4()).retry().retry();
        let decoded = decode(&encode(&job).unwrap()).unwrap();
        assert_eq!(decoded.attempt_id, job.attempt_id);
        assert_eq!(decoded.retries, 2);
    }

    #[test]
    fn test_payload_without_retries_defaults_to_zero() {
        let id = Uuid::new_v4();
        let payload = format!(r#"{{"attempt_id":"{}","enqueued_at":"2026-01-01T00:00:00Z"}}"#, id);
        let job = decode(&payload).unwrap();
        assert_eq!(job.retries, 0);
        assert_eq!(job.attempt_id, id);
    }
}

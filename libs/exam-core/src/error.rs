pub type Result<T> = std::result::Result<T, ExamError>;

#[derive(Debug, thiserror::Error)]
pub enum ExamError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),
}

impl ExamError {
    /// Store, queue and sandbox failures; the affected job is retried as a whole
    pub fn is_infrastructure(&self) -> bool {
        !matches!(
            self,
            ExamError::NotFound(_) | ExamError::AlreadyExists(_) | ExamError::InvalidState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors_are_not_infrastructure() {
        assert!(!ExamError::NotFound("attempt".into()).is_infrastructure());
        assert!(!ExamError::InvalidState("closed".into()).is_infrastructure());
        assert!(ExamError::Infrastructure("template missing".into()).is_infrastructure());
        assert!(ExamError::Database(sqlx::Error::PoolTimedOut).is_infrastructure());
    }
}

pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod store;

pub use error::{ExamError, Result};
pub use lifecycle::{AttemptLifecycle, Clock, ManualClock, SystemClock};
pub use queue::{GradingQueue, MemoryGradingQueue, RedisGradingQueue};
pub use store::{ExamStore, MemoryStore, PgStore};

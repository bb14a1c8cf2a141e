//! Durable task queue between the write path and the workers.

mod clock;
mod retry;
mod store;
mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{InMemoryOutbox, OutboxStats, OutboxStore};
pub use task::{decode_seed, encode_seed, OutboxTask, TaskStatus};

pub mod pool;
pub mod task;

pub use pool::{successful, WorkerPool};
pub use task::{AtomicCounter, Counter, FailureCap, TaskExecutor, TaskReport};

//! Thread pool running long-lived, pausable tasks

pub mod pool;
pub mod task;

pub use pool::TaskScheduler;
pub use task::{Priority, PriorityGate, ReceptionThrottle, Step, Task, TaskControl};

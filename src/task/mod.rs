//! The task record and its lifecycle state machine.
//!
//! Nothing here does IO; timers and transport live in `crate::store`.

pub mod task;
pub mod timestamp;

pub use task::{
    Advance, Task, TaskError, TaskId, TaskStatus, Transition, CANCELLED_MESSAGE, MAX_PROGRESS,
};

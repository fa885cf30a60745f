//! Core domain models for taskhive.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: tasks, their payloads, and their results.

pub mod payload;
pub mod result;
pub mod task;

pub use payload::{FailureKind, TaskContext, TaskFailure, TaskOutput, TaskPayload};
pub use result::TaskResult;
pub use task::{
    Backoff, Classification, Lane, Priority, RetryDecision, RetryPolicy, Task, TaskId, TaskSpec,
    TaskStatus, WorkloadHint,
};

//! Port traits the task queue and front door depend on.

pub mod command_runner;
pub mod subscriber;
pub mod task_store;

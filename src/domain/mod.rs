//! Domain types: tasks, identifiers, retry policy, events and the Result
//! Index. Nothing in here touches the database or the network.

pub mod error;
pub mod event;
pub mod retry;
pub mod run_index;
pub mod settings;
pub mod task;
pub mod task_id;

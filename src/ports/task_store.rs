//! Durable storage port for tasks and the Result Index.

use std::path::Path;

use crate::domain::error::BusError;
use crate::domain::run_index::{derive_run_index, RunFilter, RunIndex};
use crate::domain::task::Task;

pub trait TaskStore: Send + Sync {
    /// Upserts by task ID.
    fn save_task(&self, task: &Task) -> Result<(), BusError>;

    /// Upserts by task ID; called on every lifecycle transition.
    fn update_task(&self, task: &Task) -> Result<(), BusError>;

    /// Every stored task, oldest first.
    fn load_tasks(&self) -> Result<Vec<Task>, BusError>;

    fn insert_run(&self, entry: &RunIndex) -> Result<(), BusError>;

    /// Newest first, at most `filter.limit` rows.
    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunIndex>, BusError>;

    /// Default implementation: derives the row from the run's artifacts under
    /// `repo_root`, then stores it with `insert_run`.
    fn save_run_index(&self, repo_root: &Path, task: &Task) -> Result<RunIndex, BusError> {
        let entry = derive_run_index(repo_root, task)?;
        self.insert_run(&entry)?;
        Ok(entry)
    }
}

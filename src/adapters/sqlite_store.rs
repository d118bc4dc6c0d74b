//! SQLite task store.
//!
//! One database file with two tables, `tasks` and `runs`. Older files are
//! upgraded in place by adding any column the current schema expects.

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::domain::error::BusError;
use crate::domain::run_index::{RunFilter, RunIndex};
use crate::domain::task::{RunOutcome, RunRequest, Task, TaskStatus};
use crate::domain::task_id::TaskId;
use crate::ports::task_store::TaskStore;

const TASK_COLUMNS: &[(&str, &str)] = &[
    ("last_error", "TEXT"),
    ("attempts", "INTEGER DEFAULT 0"),
    ("max_retries", "INTEGER DEFAULT 0"),
];

const RUN_COLUMNS: &[(&str, &str)] = &[
    ("symbol", "TEXT"),
    ("interval", "TEXT"),
    ("start", "TEXT"),
    ("end", "TEXT"),
];

fn pool_err(e: r2d2::Error) -> BusError {
    BusError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> BusError {
    BusError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw.filter(|s| !s.is_empty())?;
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(raw = %raw, error = %e, "unparseable timestamp in tasks table");
            None
        }
    }
}

pub struct SqliteTaskStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteTaskStore {
    /// Opens (creating if needed) the database file and brings its schema up
    /// to date.
    pub fn open(path: &Path) -> Result<Self, BusError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
        });
        let pool = Pool::builder().max_size(4).build(manager).map_err(pool_err)?;
        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, BusError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).map_err(pool_err)?;
        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, BusError> {
        self.pool.get().map_err(pool_err)
    }

    pub fn initialize_schema(&self) -> Result<(), BusError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                request_json TEXT NOT NULL,
                status TEXT NOT NULL,
                result_json TEXT,
                last_error TEXT,
                attempts INTEGER DEFAULT 0,
                max_retries INTEGER DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                config_path TEXT NOT NULL,
                result_dir TEXT NOT NULL,
                run_id TEXT,
                symbol TEXT,
                interval TEXT,
                "start" TEXT,
                "end" TEXT,
                summary_json TEXT,
                created_at TEXT NOT NULL
            );"#,
        )
        .map_err(query_err)?;

        add_missing_columns(&conn, "tasks", TASK_COLUMNS)?;
        add_missing_columns(&conn, "runs", RUN_COLUMNS)?;

        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_runs_task_id ON runs(task_id);
             CREATE INDEX IF NOT EXISTS idx_runs_symbol ON runs(symbol);",
        )
        .map_err(query_err)?;
        Ok(())
    }

    fn upsert(&self, task: &Task) -> Result<(), BusError> {
        let request_json = serde_json::to_string(&task.request)?;
        let result_json = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (id, type, request_json, status, result_json, last_error,
                                attempts, max_retries, created_at, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                request_json = excluded.request_json,
                status = excluded.status,
                result_json = excluded.result_json,
                last_error = excluded.last_error,
                attempts = excluded.attempts,
                max_retries = excluded.max_retries,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at",
            params![
                task.id.as_str(),
                task.task_type,
                request_json,
                task.status.as_str(),
                result_json,
                task.last_error,
                task.attempts,
                task.max_retries,
                format_time(&task.created_at),
                task.started_at.as_ref().map(format_time),
                task.finished_at.as_ref().map(format_time),
            ],
        )
        .map_err(query_err)?;
        Ok(())
    }
}

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, BusError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(query_err)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(query_err)?;
    let mut columns = HashSet::new();
    for name in names {
        columns.insert(name.map_err(query_err)?);
    }
    Ok(columns)
}

fn add_missing_columns(
    conn: &Connection,
    table: &str,
    wanted: &[(&str, &str)],
) -> Result<(), BusError> {
    let existing = table_columns(conn, table)?;
    for (name, decl) in wanted {
        if !existing.contains(*name) {
            tracing::info!(table, column = name, "adding missing column");
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN \"{name}\" {decl};"))
                .map_err(query_err)?;
        }
    }
    Ok(())
}

struct TaskRow {
    id: String,
    task_type: String,
    request_json: String,
    status: String,
    result_json: Option<String>,
    last_error: Option<String>,
    attempts: Option<u32>,
    max_retries: Option<u32>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Task {
        let request = serde_json::from_str::<RunRequest>(&self.request_json).unwrap_or_else(|e| {
            tracing::warn!(task_id = %self.id, error = %e, "corrupt request_json; using defaults");
            RunRequest::default().with_default_config()
        });
        let result = self
            .result_json
            .filter(|s| !s.is_empty())
            .and_then(|raw| match serde_json::from_str::<RunOutcome>(&raw) {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::warn!(task_id = %self.id, error = %e, "corrupt result_json; dropping it");
                    None
                }
            });
        let status = TaskStatus::parse(&self.status).unwrap_or_else(|| {
            tracing::warn!(task_id = %self.id, status = %self.status, "unknown status; treating as pending");
            TaskStatus::Pending
        });
        let created_at = parse_time(Some(self.created_at)).unwrap_or_else(Utc::now);

        Task {
            id: TaskId::from(self.id),
            task_type: self.task_type,
            request,
            status,
            result,
            last_error: self.last_error.filter(|s| !s.is_empty()),
            attempts: self.attempts.unwrap_or(0),
            max_retries: self.max_retries.unwrap_or(0),
            created_at,
            started_at: parse_time(self.started_at),
            finished_at: parse_time(self.finished_at),
        }
    }
}

impl TaskStore for SqliteTaskStore {
    fn save_task(&self, task: &Task) -> Result<(), BusError> {
        self.upsert(task)
    }

    fn update_task(&self, task: &Task) -> Result<(), BusError> {
        self.upsert(task)
    }

    fn load_tasks(&self) -> Result<Vec<Task>, BusError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, type, request_json, status, result_json, last_error,
                        attempts, max_retries, created_at, started_at, finished_at
                 FROM tasks ORDER BY id ASC",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TaskRow {
                    id: row.get(0)?,
                    task_type: row.get(1)?,
                    request_json: row.get(2)?,
                    status: row.get(3)?,
                    result_json: row.get(4)?,
                    last_error: row.get(5)?,
                    attempts: row.get(6)?,
                    max_retries: row.get(7)?,
                    created_at: row.get(8)?,
                    started_at: row.get(9)?,
                    finished_at: row.get(10)?,
                })
            })
            .map_err(query_err)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(query_err)?.into_task());
        }
        Ok(tasks)
    }

    fn insert_run(&self, entry: &RunIndex) -> Result<(), BusError> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO runs (task_id, task_type, config_path, result_dir, run_id, symbol,
                                interval, "start", "end", summary_json, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                entry.task_id,
                entry.task_type,
                entry.config_path,
                entry.result_dir,
                entry.run_id,
                entry.symbol,
                entry.interval,
                entry.start,
                entry.end,
                entry.summary,
                entry.created_at,
            ],
        )
        .map_err(query_err)?;
        Ok(())
    }

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunIndex>, BusError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let mut push = |clause: &'static str, value: &Option<String>| {
            if let Some(v) = value.as_ref().filter(|v| !v.is_empty()) {
                clauses.push(clause);
                values.push(Value::Text(v.clone()));
            }
        };
        push("task_id = ?", &filter.task_id);
        push("symbol = ?", &filter.symbol);
        push("created_at >= ?", &filter.from);
        push("created_at <= ?", &filter.to);

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let query = format!(
            r#"SELECT task_id, task_type, config_path, result_dir, run_id, symbol, interval,
                      "start", "end", summary_json, created_at
               FROM runs{where_clause} ORDER BY id DESC LIMIT ?"#
        );
        values.push(Value::Integer(filter.limit as i64));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query).map_err(query_err)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                let text = |idx: usize| -> rusqlite::Result<String> {
                    Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
                };
                Ok(RunIndex {
                    task_id: text(0)?,
                    task_type: text(1)?,
                    config_path: text(2)?,
                    result_dir: text(3)?,
                    run_id: text(4)?,
                    symbol: text(5)?,
                    interval: text(6)?,
                    start: text(7)?,
                    end: text(8)?,
                    summary: text(9)?,
                    created_at: text(10)?,
                })
            })
            .map_err(query_err)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(query_err)?);
        }
        Ok(runs)
    }
}

//! Result Index entries and their derivation from on-disk artifacts.
//!
//! A successful run leaves its output under
//! `<repo>/results/<task_type>/<symbol>/<interval>/<start>_<end>/<run>/`.
//! The descriptive fields come from the `backtest:` section of the task's
//! YAML config; when several runs share that prefix the most recently
//! modified directory wins.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::domain::error::BusError;
use crate::domain::task::Task;

pub const DEFAULT_RUN_LIMIT: usize = 20;
pub const MAX_RUN_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIndex {
    pub task_id: String,
    pub task_type: String,
    pub config_path: String,
    pub result_dir: String,
    pub run_id: String,
    pub symbol: String,
    pub interval: String,
    pub start: String,
    pub end: String,
    #[serde(rename = "summary_json")]
    pub summary: String,
    pub created_at: String,
}

/// Query over the Result Index. Empty strings are treated as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFilter {
    pub limit: usize,
    pub task_id: Option<String>,
    pub symbol: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RUN_LIMIT,
            task_id: None,
            symbol: None,
            from: None,
            to: None,
        }
    }
}

impl RunFilter {
    /// Interprets a raw `limit` query value: missing, non-numeric or
    /// non-positive values give the default, large ones are capped.
    pub fn parse_limit(raw: Option<&str>) -> usize {
        match raw.map(str::trim).and_then(|v| v.parse::<i64>().ok()) {
            Some(n) if n > 0 => (n as usize).min(MAX_RUN_LIMIT),
            _ => DEFAULT_RUN_LIMIT,
        }
    }

    pub fn non_empty(value: Option<String>) -> Option<String> {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigSnapshot {
    #[serde(default)]
    backtest: BacktestSection,
}

#[derive(Debug, Default, Deserialize)]
struct BacktestSection {
    symbol: Option<serde_yaml::Value>,
    interval: Option<serde_yaml::Value>,
    start: Option<serde_yaml::Value>,
    end: Option<serde_yaml::Value>,
}

fn scalar_text(value: Option<&serde_yaml::Value>) -> Option<String> {
    let text = match value? {
        serde_yaml::Value::String(s) => s.trim().to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// The descriptive fields a run directory is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKey {
    pub symbol: String,
    pub interval: String,
    pub start: String,
    pub end: String,
}

impl RunKey {
    pub fn from_yaml(file: &str, content: &str) -> Result<Self, BusError> {
        let snapshot: ConfigSnapshot =
            serde_yaml::from_str(content).map_err(|e| BusError::ConfigParse {
                file: file.to_string(),
                reason: e.to_string(),
            })?;
        let section = &snapshot.backtest;
        let field = |key: &str, value: Option<&serde_yaml::Value>| {
            scalar_text(value).ok_or_else(|| BusError::ConfigMissing {
                file: file.to_string(),
                key: key.to_string(),
            })
        };
        Ok(Self {
            symbol: field("symbol", section.symbol.as_ref())?,
            interval: field("interval", section.interval.as_ref())?,
            start: field("start", section.start.as_ref())?,
            end: field("end", section.end.as_ref())?,
        })
    }

    pub fn base_dir(&self, repo_root: &Path, task_type: &str) -> PathBuf {
        repo_root
            .join("results")
            .join(task_type)
            .join(&self.symbol)
            .join(&self.interval)
            .join(format!("{}_{}", self.start, self.end))
    }
}

pub fn resolve_config_path(repo_root: &Path, config: &str) -> PathBuf {
    let path = Path::new(config);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_root.join(path)
    }
}

/// Most recently modified subdirectory of `base`, if any.
pub fn find_latest_dir(base: &Path) -> Result<Option<PathBuf>, BusError> {
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(base)? {
        let Ok(entry) = entry else { continue };
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_dir() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let newer = match &latest {
            None => true,
            Some((best, _)) => modified > *best,
        };
        if newer {
            latest = Some((modified, entry.path()));
        }
    }
    Ok(latest.map(|(_, path)| path))
}

fn meta_run_id(run_dir: &Path) -> Option<String> {
    let raw = fs::read_to_string(run_dir.join("meta.json")).ok()?;
    let meta: serde_json::Value = serde_json::from_str(&raw).ok()?;
    match meta.get("run_id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(|v| v.to_string())
            .or_else(|| n.as_f64().map(|v| (v as i64).to_string())),
        _ => None,
    }
}

/// Builds the Result Index row for a succeeded task by inspecting the files
/// its run left behind.
pub fn derive_run_index(repo_root: &Path, task: &Task) -> Result<RunIndex, BusError> {
    let config_path = resolve_config_path(repo_root, &task.request.config);
    let config_display = config_path.display().to_string();
    let content = fs::read_to_string(&config_path).map_err(|e| BusError::ConfigRead {
        file: config_display.clone(),
        reason: e.to_string(),
    })?;
    let key = RunKey::from_yaml(&config_display, &content)?;

    let base = key.base_dir(repo_root, &task.task_type);
    let missing = || BusError::ResultDirMissing {
        dir: base.display().to_string(),
    };
    let run_dir = match find_latest_dir(&base) {
        Ok(Some(dir)) => dir,
        Ok(None) | Err(BusError::Io(_)) => return Err(missing()),
        Err(other) => return Err(other),
    };

    let run_id = meta_run_id(&run_dir).unwrap_or_else(|| {
        run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let summary = fs::read_to_string(run_dir.join("summary.json")).unwrap_or_default();

    Ok(RunIndex {
        task_id: task.id.to_string(),
        task_type: task.task_type.clone(),
        config_path: config_display,
        result_dir: run_dir.display().to_string(),
        run_id,
        symbol: key.symbol,
        interval: key.interval,
        start: key.start,
        end: key.end,
        summary,
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{RunRequest, TaskKind};
    use crate::domain::task_id::TaskId;
    use std::time::Duration;

    const CONFIG: &str = "backtest:\n  symbol: BTCUSDT\n  interval: 1h\n  start: 2024-01-01\n  end: 2024-02-01\n";

    fn task_for(config: &str) -> Task {
        Task::new(
            TaskId::from("20240101000000000-000000"),
            TaskKind::Backtest,
            RunRequest {
                config: config.to_string(),
                top_n: None,
            },
            0,
            Utc::now(),
        )
    }

    fn write_config(root: &Path, content: &str) {
        fs::create_dir_all(root.join("config")).unwrap();
        fs::write(root.join("config/config.yml"), content).unwrap();
    }

    fn run_base(root: &Path) -> PathBuf {
        root.join("results/backtest/BTCUSDT/1h/2024-01-01_2024-02-01")
    }

    #[test]
    fn parse_limit_defaults_and_caps() {
        assert_eq!(RunFilter::parse_limit(None), 20);
        assert_eq!(RunFilter::parse_limit(Some("abc")), 20);
        assert_eq!(RunFilter::parse_limit(Some("0")), 20);
        assert_eq!(RunFilter::parse_limit(Some("-3")), 20);
        assert_eq!(RunFilter::parse_limit(Some("5")), 5);
        assert_eq!(RunFilter::parse_limit(Some("5000")), 200);
    }

    #[test]
    fn run_key_accepts_numeric_scalars() {
        let key = RunKey::from_yaml(
            "c.yml",
            "backtest:\n  symbol: ETHUSDT\n  interval: 15\n  start: 20240101\n  end: 20240201\n",
        )
        .unwrap();
        assert_eq!(key.interval, "15");
        assert_eq!(key.start, "20240101");
    }

    #[test]
    fn run_key_reports_missing_field() {
        let err = RunKey::from_yaml("c.yml", "backtest:\n  symbol: BTCUSDT\n").unwrap_err();
        match err {
            BusError::ConfigMissing { key, .. } => assert_eq!(key, "interval"),
            other => panic!("expected ConfigMissing, got {other:?}"),
        }
    }

    #[test]
    fn derive_picks_latest_run_and_reads_artifacts() {
        let root = tempfile::tempdir().unwrap();
        write_config(root.path(), CONFIG);
        let base = run_base(root.path());
        fs::create_dir_all(base.join("old")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::create_dir_all(base.join("new")).unwrap();
        fs::write(base.join("new/meta.json"), r#"{"run_id": 42}"#).unwrap();
        fs::write(base.join("new/summary.json"), r#"{"sharpe":1.5}"#).unwrap();

        let entry = derive_run_index(root.path(), &task_for("config/config.yml")).unwrap();
        assert!(entry.result_dir.ends_with("new"));
        assert_eq!(entry.run_id, "42");
        assert_eq!(entry.summary, r#"{"sharpe":1.5}"#);
        assert_eq!(entry.symbol, "BTCUSDT");
        assert_eq!(entry.task_type, "backtest");
    }

    #[test]
    fn derive_defaults_run_id_to_dir_name() {
        let root = tempfile::tempdir().unwrap();
        write_config(root.path(), CONFIG);
        fs::create_dir_all(run_base(root.path()).join("run_0007")).unwrap();

        let entry = derive_run_index(root.path(), &task_for("config/config.yml")).unwrap();
        assert_eq!(entry.run_id, "run_0007");
        assert_eq!(entry.summary, "");
    }

    #[test]
    fn derive_fails_without_result_dir() {
        let root = tempfile::tempdir().unwrap();
        write_config(root.path(), CONFIG);
        let err = derive_run_index(root.path(), &task_for("config/config.yml")).unwrap_err();
        assert!(matches!(err, BusError::ResultDirMissing { .. }));
    }

    #[test]
    fn derive_fails_when_base_has_no_subdirectories() {
        let root = tempfile::tempdir().unwrap();
        write_config(root.path(), CONFIG);
        let base = run_base(root.path());
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("stray.txt"), "x").unwrap();
        let err = derive_run_index(root.path(), &task_for("config/config.yml")).unwrap_err();
        assert!(matches!(err, BusError::ResultDirMissing { .. }));
    }

    #[test]
    fn derive_fails_on_unreadable_config() {
        let root = tempfile::tempdir().unwrap();
        let err = derive_run_index(root.path(), &task_for("missing.yml")).unwrap_err();
        assert!(matches!(err, BusError::ConfigRead { .. }));
    }
}

//! Resolved server settings.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::error::BusError;
use crate::domain::retry::RetryPolicy;

pub const DEFAULT_ENTRYPOINT: &str = "main.py";
pub const FALLBACK_INTERPRETER: &str = "python3";

#[derive(Debug, Clone, PartialEq)]
pub struct BusSettings {
    pub addr: SocketAddr,
    pub repo_root: PathBuf,
    pub interpreter: PathBuf,
    pub entrypoint: String,
    /// `None` means a run may take as long as it likes.
    pub timeout: Option<Duration>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub db_path: PathBuf,
    pub retry: RetryPolicy,
}

/// Accepts `host:port` or the bare `:port` form, which binds all interfaces.
/// Host names are resolved and the first address wins.
pub fn parse_listen_addr(raw: &str) -> Result<SocketAddr, BusError> {
    let trimmed = raw.trim();
    let candidate = if trimmed.starts_with(':') {
        format!("0.0.0.0{trimmed}")
    } else {
        trimmed.to_string()
    };
    let invalid = |reason: String| BusError::InvalidSettings {
        name: "addr".into(),
        reason: format!("{raw}: {reason}"),
    };
    candidate
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("no address found".into()))
}

/// Prefers the repository's virtualenv interpreter when one exists.
pub fn resolve_interpreter(repo_root: &Path, explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return path;
    }
    let venv = repo_root.join(".venv").join("bin").join("python");
    if venv.exists() {
        venv
    } else {
        PathBuf::from(FALLBACK_INTERPRETER)
    }
}

pub fn default_db_path(repo_root: &Path) -> PathBuf {
    repo_root.join("results").join("api_bus.sqlite3")
}

pub fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_binds_all_interfaces() {
        let addr = parse_listen_addr(":8000").unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:8000");
    }

    #[test]
    fn host_names_are_resolved() {
        let addr = parse_listen_addr("localhost:8000").unwrap();
        assert_eq!(addr.port(), 8000);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn bad_addr_is_invalid_setting() {
        let err = parse_listen_addr("nowhere").unwrap_err();
        assert!(matches!(err, BusError::InvalidSettings { .. }));
    }

    #[test]
    fn interpreter_prefers_venv() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_interpreter(root.path(), None),
            PathBuf::from(FALLBACK_INTERPRETER)
        );

        let bin = root.path().join(".venv/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("python"), "").unwrap();
        assert_eq!(resolve_interpreter(root.path(), None), bin.join("python"));

        let explicit = PathBuf::from("/opt/py/bin/python");
        assert_eq!(
            resolve_interpreter(root.path(), Some(explicit.clone())),
            explicit
        );
    }

    #[test]
    fn zero_timeout_is_unbounded() {
        assert_eq!(timeout_from_secs(0), None);
        assert_eq!(timeout_from_secs(5), Some(Duration::from_secs(5)));
    }
}

//! Domain error types.

/// Top-level error type for apibus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    #[error("cannot read config {file}: {reason}")]
    ConfigRead { file: String, reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("config {file} is missing backtest.{key}")]
    ConfigMissing { file: String, key: String },

    #[error("no result directory under {dir}")]
    ResultDirMissing { dir: String },

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("invalid setting {name}: {reason}")]
    InvalidSettings { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<&BusError> for std::process::ExitCode {
    fn from(err: &BusError) -> Self {
        let code: u8 = match err {
            BusError::Io(_) => 1,
            BusError::InvalidSettings { .. }
            | BusError::ConfigRead { .. }
            | BusError::ConfigParse { .. }
            | BusError::ConfigMissing { .. } => 2,
            BusError::Database { .. }
            | BusError::DatabaseQuery { .. }
            | BusError::Serialization { .. } => 3,
            BusError::ResultDirMissing { .. } | BusError::UnknownTaskType(_) => 4,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_missing_names_the_key() {
        let err = BusError::ConfigMissing {
            file: "config/config.yml".into(),
            key: "symbol".into(),
        };
        assert_eq!(
            err.to_string(),
            "config config/config.yml is missing backtest.symbol"
        );
    }

    #[test]
    fn json_errors_become_serialization() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: BusError = parse.into();
        assert!(matches!(err, BusError::Serialization { .. }));
    }
}

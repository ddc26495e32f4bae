use std::path::PathBuf;

/// Common service configuration shared by server binaries.
///
/// The binary parses these from its CLI / config file, then hands them to
/// storage initialization.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding all persistent state.
    pub data_dir: Option<PathBuf>,

    /// Path to the SQLite database file.
    /// Defaults to `{data_dir}/data.sqlite` if not specified.
    pub sqlite_path: Option<PathBuf>,

    /// Listen address for the HTTP server.
    pub listen: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            sqlite_path: None,
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Resolve the SQLite database path, falling back to `{data_dir}/data.sqlite`.
    pub fn resolve_sqlite_path(&self) -> PathBuf {
        self.sqlite_path.clone().unwrap_or_else(|| {
            self.data_dir
                .as_ref()
                .map(|d| d.join("data.sqlite"))
                .unwrap_or_else(|| PathBuf::from("data.sqlite"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_defaults_under_data_dir() {
        let config = ServiceConfig {
            data_dir: Some(PathBuf::from("/data")),
            ..Default::default()
        };
        assert_eq!(config.resolve_sqlite_path(), PathBuf::from("/data/data.sqlite"));
    }

    #[test]
    fn explicit_path_wins() {
        let config = ServiceConfig {
            data_dir: Some(PathBuf::from("/data")),
            sqlite_path: Some(PathBuf::from("/elsewhere/ledger.sqlite")),
            ..Default::default()
        };
        assert_eq!(config.resolve_sqlite_path(), PathBuf::from("/elsewhere/ledger.sqlite"));
    }
}

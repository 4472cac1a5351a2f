//! Environment-derived server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default wall-clock budget for one agent turn.
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `PORT`, default 3000.
    pub port: u16,
    /// `BASE_URL`, default `/gm`. Every HTTP and WS route nests under it.
    pub base_url: String,
    /// `STARTUP_CWD`, optional default working directory for new
    /// conversations.
    pub startup_cwd: Option<String>,
    /// `GMGUI_DATA_DIR`, default `$HOME/.gmgui`. Holds the database file.
    pub data_dir: PathBuf,
    /// `GMGUI_RUN_TIMEOUT_SECS`, default 300.
    pub run_timeout: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let base_url = std::env::var("BASE_URL").unwrap_or_else(|_| "/gm".to_string());

        let startup_cwd = std::env::var("STARTUP_CWD").ok().filter(|s| !s.is_empty());

        let data_dir = std::env::var("GMGUI_DATA_DIR").map_or_else(
            |_| default_data_dir(),
            PathBuf::from,
        );

        let run_timeout = std::env::var("GMGUI_RUN_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map_or(
                Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
                Duration::from_secs,
            );

        Self {
            port,
            base_url,
            startup_cwd,
            data_dir,
            run_timeout,
        }
    }

    /// Path of the embedded database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("gmgui.db")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            base_url: "/gm".to_string(),
            startup_cwd: None,
            data_dir: default_data_dir(),
            run_timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
        }
    }
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".gmgui")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.base_url, "/gm");
        assert_eq!(config.run_timeout, Duration::from_secs(300));
        assert!(config.db_path().ends_with(".gmgui/gmgui.db"));
    }
}

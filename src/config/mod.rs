// SPDX-License-Identifier: MIT
//! Environment-driven configuration for the lifecycle engine.
//!
//! Every option the daemon accepts is resolved here, once, at startup. CLI
//! flags (parsed in `main.rs`) take priority over the environment variable
//! of the same name; the environment variable takes priority over the
//! built-in default. There is no TOML layer here — this daemon has no
//! end-user-editable config file beyond the handful of env vars it exposes.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_BLACKHOLE_PATH: &str = "/blackhole";
const DEFAULT_DOWNLOAD_PATH: &str = "/downloads";
const DEFAULT_DONE_PATH: &str = "/done";
const DEFAULT_CONFIG_PATH: &str = "/config";
const DEFAULT_DOWNLOAD_THREADS: usize = 2;
const DEFAULT_DOWNLOAD_SPEED_LIMIT_KB: i64 = -1;
const DEFAULT_RECHECK_DELAY_SECS: u64 = 60;
const DEFAULT_MAX_RETRY_COUNT: u32 = 6;
const DEFAULT_MAX_CLOUD_DL_MOVE_RETRY_COUNT: u32 = 3;
const DEFAULT_MAX_STATE_RETRY_COUNT: u32 = 3;
const DEFAULT_ROOT_DIR_NAME: &str = "premiumarr";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub blackhole_path: PathBuf,
    pub download_path: PathBuf,
    pub done_path: PathBuf,
    pub config_path: PathBuf,
    pub download_threads: usize,
    /// Bandwidth cap in KB/s; `-1` disables the cap.
    pub download_speed_limit_kb: i64,
    pub recheck_delay_secs: u64,
    pub max_retry_count: u32,
    pub max_cloud_dl_move_retry_count: u32,
    pub max_state_retry_count: u32,
    pub remote_root_dir_name: String,
    pub log_level: String,
}

impl Config {
    /// Build configuration from environment variables, with optional CLI
    /// overrides for the fields worth exposing on the command line.
    pub fn from_env(
        log_level: Option<String>,
        blackhole_path: Option<PathBuf>,
        download_path: Option<PathBuf>,
        done_path: Option<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> Result<Self> {
        let api_key = std::env::var("API_KEY")
            .context("the API_KEY environment variable must be set")?;
        if api_key.trim().is_empty() {
            bail!("the API_KEY environment variable must be set");
        }

        let blackhole_path =
            blackhole_path.unwrap_or_else(|| path_from_env("BLACKHOLE_PATH", DEFAULT_BLACKHOLE_PATH));
        let download_path =
            download_path.unwrap_or_else(|| path_from_env("DOWNLOAD_PATH", DEFAULT_DOWNLOAD_PATH));
        let done_path = done_path.unwrap_or_else(|| path_from_env("DONE_PATH", DEFAULT_DONE_PATH));
        let config_path =
            config_path.unwrap_or_else(|| path_from_env("CONFIG_PATH", DEFAULT_CONFIG_PATH));

        let download_threads = usize_from_env("DOWNLOAD_THREADS", DEFAULT_DOWNLOAD_THREADS);
        let download_speed_limit_kb =
            i64_from_env("DOWNLOAD_SPEED_LIMIT_KB", DEFAULT_DOWNLOAD_SPEED_LIMIT_KB);
        let recheck_delay_secs = u64_from_env(
            "RECHECK_PREMIUMIZE_CLOUD_DELAY",
            DEFAULT_RECHECK_DELAY_SECS,
        );
        let max_retry_count = u32_from_env("MAX_RETRY_COUNT", DEFAULT_MAX_RETRY_COUNT);
        let max_cloud_dl_move_retry_count = u32_from_env(
            "MAX_CLOUD_DL_MOVE_RETRY_COUNT",
            DEFAULT_MAX_CLOUD_DL_MOVE_RETRY_COUNT,
        );
        let max_state_retry_count =
            u32_from_env("MAX_STATE_RETRY_COUNT", DEFAULT_MAX_STATE_RETRY_COUNT);
        let remote_root_dir_name = std::env::var("PREMIUMIZE_CLOUD_ROOT_DIR_NAME")
            .unwrap_or_else(|_| DEFAULT_ROOT_DIR_NAME.to_string());
        let log_level = log_level
            .or_else(|| std::env::var("LOG_LEVEL").ok())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Ok(Self {
            api_key,
            blackhole_path,
            download_path,
            done_path,
            config_path,
            download_threads,
            download_speed_limit_kb,
            recheck_delay_secs,
            max_retry_count,
            max_cloud_dl_move_retry_count,
            max_state_retry_count,
            remote_root_dir_name,
            log_level,
        })
    }

    /// Path to the SQLite ledger file.
    pub fn db_path(&self) -> PathBuf {
        self.config_path.join("data.db")
    }

    /// Path to the terminally-archived descriptor directory.
    pub fn archive_path(&self) -> PathBuf {
        self.config_path.join("archive")
    }

    /// Path to the tail-readable plain-text log directory.
    pub fn log_path(&self) -> PathBuf {
        self.config_path.join("log")
    }

    /// Validate that every configured root exists and is writable, and
    /// create the `archive/` and `log/` subdirectories of `config_path` if
    /// they are missing. A misconfigured mount should fail loudly before the
    /// engine starts, not three stages deep into the first polling round.
    pub fn validate_paths(&self) -> Result<()> {
        check_path(&self.blackhole_path, "Blackhole")?;
        check_path(&self.download_path, "Download")?;
        check_path(&self.done_path, "Done")?;
        check_path(&self.config_path, "Config")?;

        std::fs::create_dir_all(self.archive_path())
            .with_context(|| format!("creating archive dir {}", self.archive_path().display()))?;
        std::fs::create_dir_all(self.log_path())
            .with_context(|| format!("creating log dir {}", self.log_path().display()))?;

        Ok(())
    }
}

fn check_path(dir_path: &Path, dir_name: &str) -> Result<()> {
    info!(path = %dir_path.display(), dir_name, "checking configured directory");
    if !dir_path.exists() {
        bail!(
            "{dir_name} directory does not exist: {} — check your mounts and configuration",
            dir_path.display()
        );
    }
    let metadata = std::fs::metadata(dir_path)
        .with_context(|| format!("statting {dir_name} directory {}", dir_path.display()))?;
    if metadata.permissions().readonly() {
        bail!(
            "{dir_name} directory is not writable: {} — check your mounts and configuration",
            dir_path.display()
        );
    }
    Ok(())
}

fn path_from_env(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn usize_from_env(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn u64_from_env(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn u32_from_env(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn i64_from_env(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global — serialize tests that touch
    // them so they don't interleave with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_api_key_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("API_KEY");
        let result = Config::from_env(None, None, None, None, None);
        assert!(result.is_err());
    }

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("API_KEY", "test-key");
        for key in [
            "BLACKHOLE_PATH",
            "DOWNLOAD_PATH",
            "DONE_PATH",
            "CONFIG_PATH",
            "DOWNLOAD_THREADS",
            "MAX_RETRY_COUNT",
        ] {
            std::env::remove_var(key);
        }

        let cfg = Config::from_env(None, None, None, None, None).unwrap();
        assert_eq!(cfg.blackhole_path, PathBuf::from(DEFAULT_BLACKHOLE_PATH));
        assert_eq!(cfg.download_threads, DEFAULT_DOWNLOAD_THREADS);
        assert_eq!(cfg.max_retry_count, DEFAULT_MAX_RETRY_COUNT);
        assert_eq!(cfg.remote_root_dir_name, DEFAULT_ROOT_DIR_NAME);
        std::env::remove_var("API_KEY");
    }

    #[test]
    fn cli_override_wins_over_env_and_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("API_KEY", "test-key");
        std::env::set_var("BLACKHOLE_PATH", "/from-env");

        let cfg = Config::from_env(None, Some(PathBuf::from("/from-cli")), None, None, None).unwrap();
        assert_eq!(cfg.blackhole_path, PathBuf::from("/from-cli"));

        std::env::remove_var("API_KEY");
        std::env::remove_var("BLACKHOLE_PATH");
    }
}

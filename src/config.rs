//! Service configuration, read from environment variables.
//!
//! Every setting has a default; a value that fails to parse is reported and
//! the default is used instead.

use crate::queue::DEFAULT_DRAIN_DELAY;
use crate::retry::DEFAULT_MAX_RETRIES;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub server_port: u16,
    /// Port the engine listener binds; never exposed externally.
    pub engine_port: u16,
    /// When set, `/convert` and `/reset` require this key.
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub drain_delay: Duration,
    /// unoconv invocation, e.g. `["python3", "/usr/bin/unoconv"]`.
    pub unoconv_command: Vec<String>,
    /// Case-insensitive marker of engine processes in the process table.
    pub engine_process_pattern: String,
    /// Per-attempt watchdog; `None` waits for the engine indefinitely.
    pub conversion_timeout: Option<Duration>,
    pub relaunch_delay: Duration,
    /// How long a launched listener may take to accept connections.
    pub engine_ready_timeout: Duration,
    /// Staging directory for uploads and produced PDFs.
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8084,
            engine_port: 8085,
            api_key: None,
            max_retries: DEFAULT_MAX_RETRIES,
            drain_delay: DEFAULT_DRAIN_DELAY,
            unoconv_command: vec!["unoconv".to_string()],
            engine_process_pattern: "soffice".to_string(),
            conversion_timeout: None,
            relaunch_delay: Duration::from_secs(1),
            engine_ready_timeout: Duration::from_secs(60),
            upload_dir: std::env::temp_dir(),
            max_upload_bytes: 100 * 1024 * 1024,
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let unoconv_command = var("PDFER_UNOCONV")
            .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
            .unwrap_or(defaults.unoconv_command);

        let timeout_key = "PDFER_CONVERSION_TIMEOUT_SECS";
        let conversion_timeout = parsed::<u64>(timeout_key, var(timeout_key))
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let log_format = match var("PDFER_LOG_FORMAT").as_deref() {
            Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            server_port: parsed("PDFER_PORT", var("PDFER_PORT")).unwrap_or(defaults.server_port),
            engine_port: parsed("PDFER_ENGINE_PORT", var("PDFER_ENGINE_PORT"))
                .unwrap_or(defaults.engine_port),
            api_key: var("PDFER_API_KEY"),
            max_retries: parsed("PDFER_MAX_RETRIES", var("PDFER_MAX_RETRIES"))
                .unwrap_or(defaults.max_retries),
            drain_delay: parsed("PDFER_DRAIN_DELAY_MS", var("PDFER_DRAIN_DELAY_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_delay),
            unoconv_command,
            engine_process_pattern: var("PDFER_ENGINE_PATTERN")
                .unwrap_or(defaults.engine_process_pattern),
            conversion_timeout,
            relaunch_delay: parsed("PDFER_RELAUNCH_DELAY_MS", var("PDFER_RELAUNCH_DELAY_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.relaunch_delay),
            engine_ready_timeout: parsed::<u64>(
                "PDFER_ENGINE_READY_TIMEOUT_SECS",
                var("PDFER_ENGINE_READY_TIMEOUT_SECS"),
            )
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.engine_ready_timeout),
            upload_dir: var("PDFER_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            max_upload_bytes: parsed::<usize>("PDFER_MAX_UPLOAD_MB", var("PDFER_MAX_UPLOAD_MB"))
                .map(|mb| mb.saturating_mul(1024 * 1024))
                .unwrap_or(defaults.max_upload_bytes),
            log_format,
        }
    }
}

fn parsed<T: FromStr>(key: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}, using default", key, value);
            None
        }
    }
}

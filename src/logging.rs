use std::env;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Target used for lines the agent writes to its stderr
pub const AGENT_STDERR_TARGET: &str = "agent_stderr";

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive (e.g. "info", "agent_rpc=trace")
    pub level: String,
    /// Log file; stderr when unset
    pub file_path: Option<PathBuf>,
    /// Emit one JSON object per line
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Read `RUST_LOG`, `AGENT_LOG_FILE`, `AGENT_LOG_UNIQUE` and `AGENT_LOG_JSON`
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let unique = env_flag("AGENT_LOG_UNIQUE");
        let file_path = env::var("AGENT_LOG_FILE").ok().map(|path| {
            let path = PathBuf::from(path);
            if unique {
                with_pid_suffix(&path, std::process::id())
            } else {
                path
            }
        });

        Self {
            level,
            file_path,
            json_format: env_flag("AGENT_LOG_JSON"),
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|value| value == "true" || value == "1")
}

/// `agent.log` becomes `agent.<pid>.log`, so parallel processes don't
/// interleave into one file
fn with_pid_suffix(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };
    let name = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{}.{}.{}", stem.to_string_lossy(), pid, ext),
        _ => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(name)
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(path), true) => {
            let layer = fmt::layer()
                .json()
                .with_writer(open_log_file(path)?)
                .with_ansi(false);
            subscriber.with(layer).try_init()?;
        }
        (Some(path), false) => {
            let layer = fmt::layer()
                .with_writer(open_log_file(path)?)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);
            subscriber.with(layer).try_init()?;
        }
        (None, true) => {
            let layer = fmt::layer().json().with_writer(io::stderr).with_ansi(false);
            subscriber.with(layer).try_init()?;
        }
        (None, false) => {
            // stdout may carry the RPC stream in stdio mode, so never log there
            let layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);
            subscriber.with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Log one JSON-RPC message on a single line
#[macro_export]
macro_rules! log_rpc_message {
    ($level:expr, $direction:expr, $method:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            method = $method,
            data = ?$data,
            pid = std::process::id(),
            "RPC message"
        );
    };
}

/// Log how long an operation took
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}

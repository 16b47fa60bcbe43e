//! Shared logging utilities for Cartograph binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "cartograph=info,cartograph_pipeline=info,cartograph_db=info,cartograph_llm=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration shared by Cartograph binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a rolling file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedRollingWriter::new(log_dir, config.app_name)
        .context("Failed to initialize rolling log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Get the Cartograph home directory: ~/.cartograph
pub fn cartograph_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("CARTOGRAPH_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".cartograph")
}

/// Get the logs directory: ~/.cartograph/logs
pub fn logs_dir() -> PathBuf {
    cartograph_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-capped rolling writer: `app.log` rotates to `app.1.log` ... up to
/// MAX_LOG_FILES, oldest dropped.
#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RollingState>>,
}

struct RollingState {
    dir: PathBuf,
    app_name: String,
    file: File,
    written: u64,
}

impl SharedRollingWriter {
    fn new(dir: PathBuf, app_name: &str) -> Result<Self> {
        let path = dir.join(format!("{app_name}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingState {
                dir,
                app_name: app_name.to_string(),
                file,
                written,
            })),
        })
    }
}

impl RollingState {
    fn rotate(&mut self) -> io::Result<()> {
        let base = |n: usize| {
            if n == 0 {
                self.dir.join(format!("{}.log", self.app_name))
            } else {
                self.dir.join(format!("{}.{}.log", self.app_name, n))
            }
        };
        let _ = fs::remove_file(base(MAX_LOG_FILES - 1));
        for n in (0..MAX_LOG_FILES - 1).rev() {
            let from = base(n);
            if from.exists() {
                let _ = fs::rename(&from, base(n + 1));
            }
        }
        self.file = OpenOptions::new().create(true).append(true).open(base(0))?;
        self.written = 0;
        Ok(())
    }
}

impl Write for SharedRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.lock().expect("log writer poisoned");
        if state.written + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            state.rotate()?;
        }
        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().expect("log writer poisoned").file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = SharedRollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::EnvFilter;

use crate::error::{HookError, Result};

static LOG_FILE_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Install the global tracing subscriber, appending to `dir/name`.  Lines carry the thread id and
/// the time since init, which is usually all that is needed to line up a crash report with
/// the frame that caused it.  `level` is an `EnvFilter` directive such as "info" or
/// "ext_bridge=debug,info"; an unparseable directive falls back to "info".
///
/// Only the first call does anything.
pub fn init_log(dir: &Path, name: &str, level: &str) -> Result<()> {
    if LOG_FILE_PATH.get().is_some() {
        return Ok(());
    }
    let mut path = dir.to_path_buf();
    path.push(name);

    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_thread_ids(true)
        .with_timer(uptime())
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| HookError::BadStateError(format!("log subscriber already set: {}", e)))?;
    let _ = LOG_FILE_PATH.set(path);
    Ok(())
}

/// Return the log file path, if logging was initialized.
pub fn log_file_path() -> Option<&'static Path> {
    LOG_FILE_PATH.get().map(|p| p.as_path())
}

/// Latch for warnings that would otherwise repeat every frame.  `first()` is true exactly once.
#[derive(Debug, Default, Clone)]
pub struct WarnOnce {
    fired: bool,
}

impl WarnOnce {
    pub const fn new() -> Self {
        Self { fired: false }
    }

    pub fn first(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_once_fires_once() {
        let mut w = WarnOnce::new();
        assert!(!w.has_fired());
        assert!(w.first());
        assert!(!w.first());
        assert!(!w.first());
        assert!(w.has_fired());
    }
}

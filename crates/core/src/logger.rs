// Session-based logging shared by the controller and the injected agent.
// The agent additionally forwards warnings and errors to the controller
// through a remote sink.
use crate::protocol::MessageSeverity;
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

type RemoteSink = Box<dyn Fn(MessageSeverity, &str) + Send + Sync>;

/// Lines kept in memory between flushes. Older lines are dropped first.
pub const MAX_PENDING_LINES: usize = 4096;

#[derive(Default)]
struct Pending {
    lines: VecDeque<String>,
    dropped: usize,
}

pub struct SessionLogger {
    pending: Mutex<Pending>,
    pending_limit: usize,
    path: PathBuf,
    session: String,
    echo: bool,
}

impl SessionLogger {
    /// Opens `<dir>/<session>_<timestamp>.log` and prunes older files of the
    /// same session so at most `keep` remain, counting the new one.
    pub fn new(dir: PathBuf, session: &str, keep: usize, echo: bool) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        prune_sessions(&dir, session, keep.saturating_sub(1));

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let logger = Self {
            pending: Mutex::new(Pending::default()),
            pending_limit: MAX_PENDING_LINES,
            path: dir.join(format!("{}_{}.log", session, stamp)),
            session: session.to_string(),
            echo,
        };
        logger.log(MessageSeverity::Information, format!("=== {} Session Started ===", session));
        Ok(logger)
    }

    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit.max(1);
        self
    }

    pub fn log(&self, severity: MessageSeverity, message: impl AsRef<str>) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = match severity {
            MessageSeverity::Information => format!("[{}] {}", stamp, message.as_ref()),
            other => format!("[{}] {}: {}", stamp, other.label(), message.as_ref()),
        };

        if self.echo {
            println!("{}", line);
            let _ = self.append(std::slice::from_ref(&line));
        } else {
            let mut pending = self.pending.lock();
            while pending.lines.len() >= self.pending_limit {
                pending.lines.pop_front();
                pending.dropped += 1;
            }
            pending.lines.push_back(line);
        }
    }

    fn append<'a>(&self, lines: impl IntoIterator<Item = &'a String>) -> Result<()> {
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Writes buffered lines. The agent only buffers, so nothing touches the
    /// disk from a render thread. The lock is released before the write.
    pub fn flush(&self) -> Result<()> {
        let Pending { lines, dropped } = std::mem::take(&mut *self.pending.lock());
        if dropped > 0 {
            let notice = format!("... {} log lines dropped ...", dropped);
            self.append(std::iter::once(&notice))?;
        }
        if !lines.is_empty() {
            self.append(&lines)?;
        }
        Ok(())
    }

    pub fn finalize(&self) -> Result<()> {
        self.log(MessageSeverity::Information, format!("=== {} Session Ended ===", self.session));
        self.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLogger {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

fn prune_sessions(dir: &Path, session: &str, keep: usize) {
    let prefix = format!("{}_", session);
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut files: Vec<(SystemTime, PathBuf)> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix))
        })
        .filter_map(|path| Some((fs::metadata(&path).and_then(|m| m.modified()).ok()?, path)))
        .collect();

    files.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in files.into_iter().skip(keep) {
        let _ = fs::remove_file(path);
    }
}

static LOGGER: once_cell::sync::OnceCell<SessionLogger> = once_cell::sync::OnceCell::new();
static REMOTE_SINK: RwLock<Option<RemoteSink>> = parking_lot::const_rwlock(None);

thread_local! {
    static IN_REMOTE_SINK: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

pub fn init_logger(log_dir: PathBuf, app_name: &str, retention_count: usize, stream_to_stdout: bool) -> Result<()> {
    let logger = SessionLogger::new(log_dir, app_name, retention_count, stream_to_stdout)?;
    LOGGER.set(logger).map_err(|_| anyhow::anyhow!("Logger already initialized"))?;
    Ok(())
}

/// Route warnings and errors to `sink` in addition to the session file.
/// The sink must not log through this module itself.
pub fn set_remote_sink<F>(sink: F)
where
    F: Fn(MessageSeverity, &str) + Send + Sync + 'static,
{
    *REMOTE_SINK.write() = Some(Box::new(sink));
}

pub fn clear_remote_sink() {
    REMOTE_SINK.write().take();
}

pub fn log(severity: MessageSeverity, message: impl AsRef<str>) {
    let message = message.as_ref();

    match severity {
        MessageSeverity::Debug => tracing::debug!("{}", message),
        MessageSeverity::Information => tracing::info!("{}", message),
        MessageSeverity::Warning => tracing::warn!("{}", message),
        MessageSeverity::Error => tracing::error!("{}", message),
    }

    if let Some(logger) = LOGGER.get() {
        logger.log(severity, message);
    }

    if matches!(severity, MessageSeverity::Warning | MessageSeverity::Error) {
        // A sink that fails and logs about it must not re-enter itself
        IN_REMOTE_SINK.with(|busy| {
            if busy.replace(true) {
                return;
            }
            if let Some(sink) = REMOTE_SINK.read().as_ref() {
                sink(severity, message);
            }
            busy.set(false);
        });
    }
}

/// Writes whatever the global logger has buffered so far.
pub fn flush_logs() -> Result<()> {
    if let Some(logger) = LOGGER.get() {
        logger.flush()?;
    }
    Ok(())
}

pub fn finalize_logs() -> Result<()> {
    if let Some(logger) = LOGGER.get() {
        logger.finalize()?;
    }
    Ok(())
}

pub fn log_path() -> Option<PathBuf> {
    LOGGER.get().map(|logger| logger.path.clone())
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::protocol::MessageSeverity::Information, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::protocol::MessageSeverity::Warning, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::protocol::MessageSeverity::Error, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::protocol::MessageSeverity::Debug, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_logger_writes_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::new(dir.path().to_path_buf(), "agent", 5, false).unwrap();
        logger.log(MessageSeverity::Warning, "staging texture lost");
        assert!(!logger.path().exists());

        logger.flush().unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("=== agent Session Started ==="));
        assert!(content.contains("WARN: staging texture lost"));
    }

    #[test]
    fn buffer_keeps_newest_lines_and_counts_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::new(dir.path().to_path_buf(), "agent", 5, false)
            .unwrap()
            .with_pending_limit(3);
        for i in 0..10 {
            logger.log(MessageSeverity::Information, format!("frame {}", i));
        }
        assert_eq!(logger.pending.lock().lines.len(), 3);

        logger.flush().unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("... 8 log lines dropped ..."));
        assert!(!content.contains("frame 6"));
        assert!(content.contains("frame 7"));
        assert!(content.contains("frame 9"));

        logger.log(MessageSeverity::Information, "after flush");
        logger.flush().unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert_eq!(content.matches("dropped").count(), 1);
    }

    #[test]
    fn old_sessions_beyond_retention_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("controller_2020010{}_000000.log", i)), "old").unwrap();
        }
        fs::write(dir.path().join("agent_20200101_000000.log"), "other app").unwrap();

        let _logger = SessionLogger::new(dir.path().to_path_buf(), "controller", 3, false).unwrap();

        let remaining = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("controller_"))
            .count();
        assert_eq!(remaining, 2);
        assert!(dir.path().join("agent_20200101_000000.log").exists());
    }
}

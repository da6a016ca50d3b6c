//! Access log files with reopen-in-place support.
//!
//! Log rotation works the traditional way: an external tool renames the
//! file, sends SIGUSR1, and [`AccessLogManager::reopen_all`] recreates
//! every path so new lines land in fresh files. Writes are buffered;
//! a main-loop timer calls [`AccessLogManager::flush_all`] on the
//! configured file-flush interval. Write failures drop the line and count
//! — logging must never take a connection down.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use gantry_core::stats::{Counter, Store};
use tracing::warn;

/// One append-mode log file.
pub struct AccessLogFile {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    write_fail: Arc<Counter>,
}

fn open_append(path: &Path) -> std::io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

impl AccessLogFile {
    /// Appends one line (newline added here). Failures increment the drop
    /// counter and are otherwise swallowed.
    pub fn write_line(&self, line: &str) {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if writeln!(writer, "{line}").is_err() {
            self.write_fail.inc();
        }
    }

    /// Flushes buffered lines to disk.
    pub fn flush(&self) {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if writer.flush().is_err() {
            self.write_fail.inc();
        }
    }

    /// Reopens the path, picking up a rotation rename.
    pub fn reopen(&self) {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writer.flush();
        match open_append(&self.path) {
            Ok(fresh) => *writer = fresh,
            Err(error) => {
                warn!(path = %self.path.display(), %error, "failed to reopen access log");
                self.write_fail.inc();
            }
        }
    }
}

/// Owns every open access log so the SIGUSR1 handler and the flush timer
/// can reach them all.
pub struct AccessLogManager {
    files: Mutex<Vec<Arc<AccessLogFile>>>,
    write_fail: Arc<Counter>,
}

impl AccessLogManager {
    pub fn new(store: &Store) -> Self {
        Self {
            files: Mutex::new(Vec::new()),
            write_fail: store.counter("access_log.write_fail"),
        }
    }

    /// Opens (or creates) an append-mode log at `path`.
    pub fn open(&self, path: &Path) -> std::io::Result<Arc<AccessLogFile>> {
        let file = Arc::new(AccessLogFile {
            path: path.to_owned(),
            writer: Mutex::new(open_append(path)?),
            write_fail: Arc::clone(&self.write_fail),
        });
        self.files.lock().unwrap().push(Arc::clone(&file));
        Ok(file)
    }

    /// Reopens every file. The SIGUSR1 log-rotate hook.
    pub fn reopen_all(&self) {
        for file in self.files.lock().unwrap().iter() {
            file.reopen();
        }
    }

    /// Flushes every file's buffer.
    pub fn flush_all(&self) {
        for file in self.files.lock().unwrap().iter() {
            file.flush();
        }
    }
}

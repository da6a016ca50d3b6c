//! Runtime overlay: feature flags and tunables loaded from a directory
//! tree at start-up.
//!
//! Each file under the runtime root is one value; its key is the relative
//! path with separators collapsed to dots (`health_check/min_interval` →
//! `health_check.min_interval`). The snapshot is immutable and fanned out
//! to every event-loop thread through a thread-local slot, so reads on
//! the hot path touch no locks. Without a configured runtime path a
//! permanently empty snapshot is published and every read falls back to
//! its default.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{info, warn};

use crate::thread_local::Slot;

/// An immutable key → value view of the runtime tree.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    values: HashMap<String, String>,
}

impl Snapshot {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Integer value of `key`, or `default` when absent or unparseable.
    pub fn get_integer(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Publishes runtime snapshots to all event-loop threads.
pub struct RuntimeLoader {
    slot: Slot,
}

impl RuntimeLoader {
    /// Loads the directory tree once and publishes it.
    pub fn file(root: &Path, slot: Slot) -> io::Result<Self> {
        let values = load_directory(root)?;
        info!(root = %root.display(), entries = values.len(), "runtime loaded");
        let shared = Arc::new(values);
        slot.set(move || Snapshot {
            values: (*shared).clone(),
        });
        Ok(Self { slot })
    }

    /// Publishes a permanently empty snapshot.
    pub fn null(slot: Slot) -> Self {
        slot.set(Snapshot::default);
        Self { slot }
    }

    /// The calling thread's snapshot. Empty until this thread's loop has
    /// processed the published update.
    pub fn snapshot(&self) -> Rc<Snapshot> {
        self.slot.get::<Snapshot>().unwrap_or_default()
    }
}

fn load_directory(root: &Path) -> io::Result<HashMap<String, String>> {
    let mut values = HashMap::new();
    walk(root, String::new(), &mut values)?;
    Ok(values)
}

fn walk(dir: &Path, prefix: String, values: &mut HashMap<String, String>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(name) => {
                warn!(?name, "skipping runtime entry with non-utf8 name");
                continue;
            }
        };
        let key = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}.{name}")
        };

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), key, values)?;
        } else {
            match std::fs::read_to_string(entry.path()) {
                Ok(contents) => {
                    values.insert(key, contents.trim().to_owned());
                }
                Err(error) => {
                    warn!(key, %error, "skipping unreadable runtime entry");
                }
            }
        }
    }
    Ok(())
}

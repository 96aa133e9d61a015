//! Segment file removal gating
//!
//! A segment file may be deleted only when no live snapshot references it
//! and its name is not marked ineligible for removal. Producers mark a
//! filename ineligible for the window between writing the file and its
//! introduction into the root; removal requests arriving inside that window
//! are deferred and executed at unmark time.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

#[derive(Default)]
struct CleanupState {
    ineligible: HashSet<OsString>,
    deferred: HashSet<PathBuf>,
}

/// Concurrent set of filenames currently protected from removal
#[derive(Default)]
pub struct FileCleanup {
    state: Mutex<CleanupState>,
}

impl FileCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect `name` from removal until unmarked
    pub fn mark_ineligible(&self, name: &str) {
        self.state.lock().ineligible.insert(OsString::from(name));
    }

    /// Lift protection and execute any removal deferred while it was held
    pub fn unmark_ineligible(&self, name: &str) {
        let deferred = {
            let mut state = self.state.lock();
            state.ineligible.remove(&OsString::from(name));
            let ready: Vec<PathBuf> = state
                .deferred
                .iter()
                .filter(|p| p.file_name().map_or(true, |f| !state.ineligible.contains(f)))
                .cloned()
                .collect();
            for p in &ready {
                state.deferred.remove(p);
            }
            ready
        };
        for path in deferred {
            remove_file(&path);
        }
    }

    pub fn is_ineligible(&self, name: &str) -> bool {
        self.state.lock().ineligible.contains(&OsString::from(name))
    }

    /// Remove the file now, or defer if its name is ineligible
    pub fn request_removal(&self, path: &Path) {
        {
            let mut state = self.state.lock();
            let protected = path
                .file_name()
                .map_or(false, |f| state.ineligible.contains(f));
            if protected {
                state.deferred.insert(path.to_path_buf());
                return;
            }
        }
        remove_file(path);
    }
}

fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), %err, "failed to remove segment file");
        }
    }
}

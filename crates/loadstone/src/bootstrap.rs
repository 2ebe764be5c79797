//! Active search-path list and the scoped bootstrap override of it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::ThreadId;

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::config::BootstrapConfig;
use crate::error::{LoadError, LoadResult};

/// The process-wide search-path list loads resolve against.
///
/// Loads take a snapshot under the read lock; bootstrap scopes swap the
/// whole list under the write lock.
#[derive(Debug, Default)]
pub struct ActivePaths {
    paths: RwLock<Vec<PathBuf>>,
}

impl ActivePaths {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths: RwLock::new(paths),
        }
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.paths.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Installs `paths`, returning the list it replaced.
    pub fn replace(&self, paths: Vec<PathBuf>) -> Vec<PathBuf> {
        let mut guard = self.paths.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, paths)
    }

    /// Moves `dir` to the front, dropping any later duplicate.
    pub fn prepend(&self, dir: PathBuf) {
        let mut guard = self.paths.write().unwrap_or_else(|e| e.into_inner());
        guard.retain(|p| p != &dir);
        guard.insert(0, dir);
    }
}

/// Owns the bootstrap search-path list and hands out [`BootstrapGuard`]s.
///
/// The list is computed on first use and kept for the manager's lifetime.
/// One scope may be active at a time: another thread entering waits, the
/// owning thread entering again gets [`LoadError::NestedBootstrap`].
pub struct BootstrapPathManager {
    runtime_root: Option<PathBuf>,
    matcher: GlobMatcher,
    active: Arc<ActivePaths>,
    memo: OnceCell<Vec<PathBuf>>,
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl BootstrapPathManager {
    pub fn new(config: &BootstrapConfig, active: Arc<ActivePaths>) -> Result<Self> {
        let matcher = GlobBuilder::new(&config.library_dir_pattern)
            .literal_separator(true)
            .build()
            .with_context(|| {
                format!(
                    "invalid bootstrap.library_dir_pattern: {:?}",
                    config.library_dir_pattern
                )
            })?
            .compile_matcher();
        Ok(Self {
            runtime_root: config.runtime_root.clone(),
            matcher,
            active,
            memo: OnceCell::new(),
            owner: Mutex::new(None),
            released: Condvar::new(),
        })
    }

    /// Library directories under the runtime root followed by the search
    /// paths that were active on the first call.
    pub fn bootstrap_paths(&self) -> &[PathBuf] {
        self.memo.get_or_init(|| {
            let mut paths = match &self.runtime_root {
                Some(root) => discover_library_dirs(root, &self.matcher),
                None => Vec::new(),
            };
            paths.extend(self.active.snapshot());
            debug!(count = paths.len(), "computed bootstrap search paths");
            paths
        })
    }

    pub fn enter(&self) -> LoadResult<BootstrapGuard<'_>> {
        let me = std::thread::current().id();
        {
            let mut owner = self.owner.lock().unwrap_or_else(|e| e.into_inner());
            if *owner == Some(me) {
                return Err(LoadError::NestedBootstrap);
            }
            while owner.is_some() {
                owner = self
                    .released
                    .wait(owner)
                    .unwrap_or_else(|e| e.into_inner());
            }
            *owner = Some(me);
        }

        let paths = self.bootstrap_paths().to_vec();
        let saved = self.active.replace(paths);
        debug!("entered bootstrap scope");
        Ok(BootstrapGuard {
            manager: self,
            saved: Some(saved),
        })
    }

    pub fn is_active(&self) -> bool {
        self.owner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn release(&self, saved: Vec<PathBuf>) {
        self.active.replace(saved);
        let mut owner = self.owner.lock().unwrap_or_else(|e| e.into_inner());
        *owner = None;
        self.released.notify_all();
        debug!("left bootstrap scope");
    }
}

/// Restores the saved search paths when dropped, on every exit path.
pub struct BootstrapGuard<'a> {
    manager: &'a BootstrapPathManager,
    saved: Option<Vec<PathBuf>>,
}

impl BootstrapGuard<'_> {
    pub fn exit(mut self) {
        if let Some(saved) = self.saved.take() {
            self.manager.release(saved);
        }
    }
}

impl Drop for BootstrapGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.manager.release(saved);
        }
    }
}

fn discover_library_dirs(root: &Path, matcher: &GlobMatcher) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut it = walkdir::WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = it.next() {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        if matcher.is_match(rel) {
            out.push(entry.path().to_path_buf());
            it.skip_current_dir();
        }
    }
    out
}

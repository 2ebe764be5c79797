use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use loadstone_contracts::ARTIFACT_SIGNATURE_VERSION;
use tracing::{debug, info, warn};

use crate::artifact::CompiledArtifact;
use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};
use crate::facade::Compiler;
use crate::locks::NameLocks;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Outcome of inspecting a persisted artifact, before any recompilation.
#[derive(Debug)]
pub enum ArtifactProbe {
    Fresh(CompiledArtifact),
    Missing,
    Stale,
    Corrupt(String),
    Incompatible(String),
    /// Nothing can be loaded or rebuilt, e.g. the source is unreadable.
    Fatal(LoadError),
}

impl ArtifactProbe {
    pub fn label(&self) -> &'static str {
        match self {
            ArtifactProbe::Fresh(_) => "fresh",
            ArtifactProbe::Missing => "missing",
            ArtifactProbe::Stale => "stale",
            ArtifactProbe::Corrupt(_) => "corrupt",
            ArtifactProbe::Incompatible(_) => "incompatible",
            ArtifactProbe::Fatal(_) => "fatal",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            ArtifactProbe::Corrupt(reason) | ArtifactProbe::Incompatible(reason) => {
                Some(reason.clone())
            }
            ArtifactProbe::Fatal(err) => Some(err.to_string()),
            _ => None,
        }
    }
}

/// Decides between a cached artifact and a fresh compile.
///
/// Any doubt about a cached copy becomes a recompile; only failures to
/// produce code at all are returned as errors.
pub struct ArtifactCache {
    compiler: Arc<dyn Compiler>,
    signature_version: u32,
    runtime_version: String,
    persist: bool,
    write_locks: NameLocks,
}

impl ArtifactCache {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        runtime_version: impl Into<String>,
        persist: bool,
    ) -> Self {
        Self {
            compiler,
            signature_version: ARTIFACT_SIGNATURE_VERSION,
            runtime_version: runtime_version.into(),
            persist,
            write_locks: NameLocks::new(),
        }
    }

    pub fn from_config(compiler: Arc<dyn Compiler>, config: &LoaderConfig) -> Self {
        Self::new(
            compiler,
            config.runtime_version.clone(),
            config.persist_compiled_artifacts,
        )
    }

    pub fn signature_version(&self) -> u32 {
        self.signature_version
    }

    pub fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    /// Inspects `compiled` without compiling anything.
    ///
    /// With `verify` off, any decodable artifact is `Fresh`: staleness and
    /// version checks are skipped entirely.
    pub fn probe(&self, source: Option<&Path>, compiled: &Path, verify: bool) -> ArtifactProbe {
        let compiled_meta = match std::fs::metadata(compiled) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return ArtifactProbe::Missing
            }
            Err(err) => return ArtifactProbe::Corrupt(format!("stat: {err}")),
        };

        let source_mtime = match (verify, source) {
            (true, Some(source)) => match source_mtime(source) {
                Ok(t) => Some(t),
                Err(err) => return ArtifactProbe::Fatal(err),
            },
            _ => None,
        };

        if let Some(source_mtime) = source_mtime {
            let compiled_mtime = match compiled_meta.modified() {
                Ok(t) => t,
                Err(err) => return ArtifactProbe::Corrupt(format!("compiled mtime: {err}")),
            };
            if source_mtime >= compiled_mtime {
                return ArtifactProbe::Stale;
            }
        }

        let artifact = match read_compiled(compiled) {
            Ok(artifact) => artifact,
            Err(outcome) => return outcome,
        };

        if verify {
            if artifact.signature_version != self.signature_version {
                return ArtifactProbe::Incompatible(format!(
                    "signature version {} (expected {})",
                    artifact.signature_version, self.signature_version
                ));
            }
            if artifact.runtime_version != self.runtime_version {
                return ArtifactProbe::Incompatible(format!(
                    "runtime version {:?} (expected {:?})",
                    artifact.runtime_version, self.runtime_version
                ));
            }
            if let Some(source_mtime) = source_mtime {
                if artifact.source_mtime_at_compile != source_mtime {
                    return ArtifactProbe::Stale;
                }
            }
        }

        ArtifactProbe::Fresh(artifact)
    }

    /// Returns a trustworthy artifact for `source`, recompiling when the copy
    /// at `compiled` is missing, stale, corrupt or incompatible.
    ///
    /// With no `source`, a compiled artifact that does not validate is
    /// [`LoadError::UnusableArtifact`].
    pub fn resolve_artifact(
        &self,
        source: Option<&Path>,
        compiled: &Path,
        verify: bool,
    ) -> LoadResult<CompiledArtifact> {
        let probe = self.probe(source, compiled, verify);
        let reason = match probe {
            ArtifactProbe::Fresh(artifact) => {
                debug!(compiled = %compiled.display(), "using cached artifact");
                return Ok(artifact);
            }
            ArtifactProbe::Fatal(err) => return Err(err),
            other => other,
        };

        let Some(source) = source else {
            return Err(LoadError::UnusableArtifact {
                path: compiled.to_path_buf(),
                reason: reason
                    .detail()
                    .unwrap_or_else(|| reason.label().to_string()),
            });
        };
        debug!(
            compiled = %compiled.display(),
            outcome = reason.label(),
            detail = reason.detail().as_deref().unwrap_or(""),
            "cached artifact rejected; recompiling"
        );

        if !self.persist {
            return self.compile_in_memory(source);
        }

        self.write_locks.with_lock(&compiled.to_string_lossy(), || {
            // Another loader may have rebuilt it while we waited.
            if let ArtifactProbe::Fresh(artifact) = self.probe(Some(source), compiled, verify) {
                debug!(compiled = %compiled.display(), "artifact rebuilt concurrently");
                return Ok(artifact);
            }
            self.compile_locked(source, compiled)
        })
    }

    /// Compiles `source` and persists the result at `dest`.
    ///
    /// A failed write is logged and the in-memory artifact is still returned.
    pub fn compile(&self, source: &Path, dest: &Path) -> LoadResult<CompiledArtifact> {
        self.write_locks
            .with_lock(&dest.to_string_lossy(), || self.compile_locked(source, dest))
    }

    pub fn compile_in_memory(&self, source: &Path) -> LoadResult<CompiledArtifact> {
        let mtime = source_mtime(source)?;
        info!(source = %source.display(), "compiling (in memory)");
        let payload = self.compiler.compile(source)?;
        Ok(self.stamp(mtime, payload))
    }

    fn compile_locked(&self, source: &Path, dest: &Path) -> LoadResult<CompiledArtifact> {
        let mtime = source_mtime(source)?;
        info!(source = %source.display(), dest = %dest.display(), "compiling");
        let payload = self.compiler.compile(source)?;
        let artifact = self.stamp(mtime, payload);
        if let Err(err) = write_atomic(dest, &artifact.encode()) {
            warn!(
                dest = %dest.display(),
                error = %err,
                "could not persist compiled artifact"
            );
        }
        Ok(artifact)
    }

    fn stamp(&self, source_mtime: SystemTime, payload: Vec<u8>) -> CompiledArtifact {
        CompiledArtifact::new(
            self.signature_version,
            self.runtime_version.clone(),
            source_mtime,
            payload,
        )
    }
}

/// Reads and decodes an artifact whose metadata was already seen.
fn read_compiled(compiled: &Path) -> Result<CompiledArtifact, ArtifactProbe> {
    let bytes = match std::fs::read(compiled) {
        Ok(bytes) => bytes,
        // Removed between the stat and the read.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArtifactProbe::Missing)
        }
        Err(err) => return Err(ArtifactProbe::Corrupt(format!("read: {err}"))),
    };
    CompiledArtifact::decode(&bytes).map_err(|err| ArtifactProbe::Corrupt(err.to_string()))
}

fn source_mtime(path: &Path) -> LoadResult<SystemTime> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|err| LoadError::io(path, err))
}

fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = temp_path_next_to(path);
    if let Err(err) = std::fs::write(&tmp, contents) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(_) => {
            let _ = std::fs::remove_file(path);
            let out = std::fs::rename(&tmp, path);
            if out.is_err() {
                let _ = std::fs::remove_file(&tmp);
            }
            out
        }
    }
}

fn temp_path_next_to(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let pid = std::process::id();
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{file_name}.{pid}.{n}.tmp"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::error::{CompileError, CompileErrorKind};

    #[derive(Default)]
    struct CountingCompiler {
        calls: AtomicUsize,
    }

    impl Compiler for CountingCompiler {
        fn compile(&self, source_path: &Path) -> Result<Vec<u8>, CompileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::read(source_path).map_err(|e| {
                CompileError::new(CompileErrorKind::Io, source_path, e.to_string())
            })
        }
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    fn cache(persist: bool) -> (Arc<CountingCompiler>, ArtifactCache) {
        let compiler = Arc::new(CountingCompiler::default());
        let cache = ArtifactCache::new(compiler.clone(), "9.9.9", persist);
        (compiler, cache)
    }

    #[test]
    fn missing_artifact_is_compiled_and_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.ls");
        let cmp = tmp.path().join("a.lsc");
        std::fs::write(&src, b"print 1").unwrap();
        set_mtime(&src, 100);

        let (compiler, cache) = cache(true);
        let artifact = cache.resolve_artifact(Some(&src), &cmp, true).unwrap();
        assert_eq!(artifact.payload, b"print 1");
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(cache.probe(Some(&src), &cmp, true), ArtifactProbe::Fresh(_)));

        let again = cache.resolve_artifact(Some(&src), &cmp, true).unwrap();
        assert_eq!(again, artifact);
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_temp_files_are_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.ls");
        std::fs::write(&src, b"x").unwrap();
        set_mtime(&src, 100);
        let (_, cache) = cache(true);
        cache
            .resolve_artifact(Some(&src), &tmp.path().join("a.lsc"), true)
            .unwrap();
        let mut names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.ls".to_string(), "a.lsc".to_string()]);
    }

    #[test]
    fn recorded_source_mtime_mismatch_is_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.ls");
        let cmp = tmp.path().join("a.lsc");
        std::fs::write(&src, b"x").unwrap();
        set_mtime(&src, 100);
        let artifact = CompiledArtifact::new(
            ARTIFACT_SIGNATURE_VERSION,
            "9.9.9",
            UNIX_EPOCH + Duration::from_secs(90),
            b"old".to_vec(),
        );
        std::fs::write(&cmp, artifact.encode()).unwrap();
        set_mtime(&cmp, 500);

        let (_, cache) = cache(true);
        assert!(matches!(cache.probe(Some(&src), &cmp, true), ArtifactProbe::Stale));
        assert!(matches!(
            cache.probe(Some(&src), &cmp, false),
            ArtifactProbe::Fresh(_)
        ));
    }

    #[test]
    fn runtime_version_mismatch_is_incompatible() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.ls");
        let cmp = tmp.path().join("a.lsc");
        std::fs::write(&src, b"x").unwrap();
        set_mtime(&src, 100);
        let artifact = CompiledArtifact::new(
            ARTIFACT_SIGNATURE_VERSION,
            "0.0.1",
            UNIX_EPOCH + Duration::from_secs(100),
            b"old".to_vec(),
        );
        std::fs::write(&cmp, artifact.encode()).unwrap();
        set_mtime(&cmp, 500);

        let (compiler, cache) = cache(true);
        assert!(matches!(
            cache.probe(Some(&src), &cmp, true),
            ArtifactProbe::Incompatible(_)
        ));
        let rebuilt = cache.resolve_artifact(Some(&src), &cmp, true).unwrap();
        assert_eq!(rebuilt.runtime_version, "9.9.9");
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persistence_disabled_never_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.ls");
        let cmp = tmp.path().join("a.lsc");
        std::fs::write(&src, b"x").unwrap();

        let (compiler, cache) = cache(false);
        cache.resolve_artifact(Some(&src), &cmp, true).unwrap();
        cache.resolve_artifact(Some(&src), &cmp, true).unwrap();
        assert!(!cmp.exists());
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unusable_compiled_only_artifact_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cmp = tmp.path().join("a.lsc");
        std::fs::write(&cmp, b"garbage").unwrap();

        let (compiler, cache) = cache(true);
        let err = cache.resolve_artifact(None, &cmp, true).unwrap_err();
        assert!(matches!(err, LoadError::UnusableArtifact { .. }), "{err:?}");
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unreadable_source_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let cmp = tmp.path().join("a.lsc");
        std::fs::write(&cmp, b"garbage").unwrap();
        let (_, cache) = cache(true);
        let probe = cache.probe(Some(&tmp.path().join("gone.ls")), &cmp, true);
        assert!(matches!(probe, ArtifactProbe::Fatal(LoadError::Io { .. })));
    }

    #[test]
    fn artifact_vanishing_after_stat_is_recompiled() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.ls");
        let cmp = tmp.path().join("a.lsc");
        std::fs::write(&src, b"fresh").unwrap();
        set_mtime(&src, 100);
        let stale = CompiledArtifact::new(
            ARTIFACT_SIGNATURE_VERSION,
            "9.9.9",
            UNIX_EPOCH + Duration::from_secs(100),
            b"cached".to_vec(),
        );
        std::fs::write(&cmp, stale.encode()).unwrap();

        assert!(std::fs::metadata(&cmp).is_ok());
        std::fs::remove_file(&cmp).unwrap();
        assert!(matches!(read_compiled(&cmp), Err(ArtifactProbe::Missing)));

        let (compiler, cache) = cache(true);
        let artifact = cache.resolve_artifact(Some(&src), &cmp, true).unwrap();
        assert_eq!(artifact.payload, b"fresh");
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
        assert!(cmp.is_file());
    }

    #[test]
    fn unreadable_artifact_after_stat_is_recompiled() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.ls");
        let cmp = tmp.path().join("a.lsc");
        std::fs::write(&src, b"fresh").unwrap();
        set_mtime(&src, 100);
        // Stat succeeds on a directory but reading it fails.
        std::fs::create_dir(&cmp).unwrap();

        let (compiler, cache) = cache(true);
        assert!(matches!(
            cache.probe(Some(&src), &cmp, false),
            ArtifactProbe::Corrupt(_)
        ));
        let artifact = cache.resolve_artifact(Some(&src), &cmp, false).unwrap();
        assert_eq!(artifact.payload, b"fresh");
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persist_failure_still_returns_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.ls");
        std::fs::write(&src, b"x").unwrap();
        let dest = tmp.path().join("no-such-dir").join("a.lsc");

        let (_, cache) = cache(true);
        let artifact = cache.compile(&src, &dest).unwrap();
        assert_eq!(artifact.payload, b"x");
        assert!(!dest.exists());
    }
}

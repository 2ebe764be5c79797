use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::artifact::CompiledArtifact;
use crate::bootstrap::{ActivePaths, BootstrapGuard, BootstrapPathManager};
use crate::cache::ArtifactCache;
use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};
use crate::facade::{Compiler, Executor, NativeLoader, NativeModule, TopLevelContext};
use crate::locks::{Claim, InFlight};
use crate::native;
use crate::registry::{FeatureNormalizer, FeatureRegistry};
use crate::resolve::{Candidate, CandidateKind, LoadStrategy, PathResolver};

/// Per-call state; dropped when the call returns.
#[derive(Debug)]
struct LoadContext {
    feature: String,
    candidate: Candidate,
    strategy: LoadStrategy,
    direct: bool,
}

#[derive(Debug)]
enum Loaded {
    Artifact(CompiledArtifact),
    Native(NativeModule),
}

/// Orchestrates require/load calls over the registry, resolver, artifact
/// cache and the external collaborators.
pub struct LoadCoordinator {
    config: LoaderConfig,
    resolver: PathResolver,
    cache: ArtifactCache,
    features: Arc<FeatureRegistry>,
    active: Arc<ActivePaths>,
    bootstrap: BootstrapPathManager,
    executor: Arc<dyn Executor>,
    native: Arc<dyn NativeLoader>,
    inflight: InFlight,
}

impl LoadCoordinator {
    pub fn new(
        config: LoaderConfig,
        compiler: Arc<dyn Compiler>,
        executor: Arc<dyn Executor>,
        native: Arc<dyn NativeLoader>,
    ) -> Result<Self> {
        let normalizer = FeatureNormalizer::new(
            config.source_file_extension.clone(),
            config.compiled_file_extension.clone(),
            config.native_file_extension.clone(),
        );
        let features = Arc::new(FeatureRegistry::new(normalizer));
        Self::with_feature_registry(config, compiler, executor, native, features)
    }

    /// Like [`LoadCoordinator::new`], sharing an existing registry.
    pub fn with_feature_registry(
        config: LoaderConfig,
        compiler: Arc<dyn Compiler>,
        executor: Arc<dyn Executor>,
        native: Arc<dyn NativeLoader>,
        features: Arc<FeatureRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let active = Arc::new(ActivePaths::new(config.search_paths.clone()));
        let bootstrap = BootstrapPathManager::new(&config.bootstrap, active.clone())?;
        Ok(Self {
            resolver: PathResolver::from_config(&config),
            cache: ArtifactCache::from_config(compiler, &config),
            features,
            active,
            bootstrap,
            executor,
            native,
            inflight: InFlight::new(),
            config,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn feature_registry(&self) -> &Arc<FeatureRegistry> {
        &self.features
    }

    /// Canonical feature names in load order.
    pub fn features(&self) -> Vec<String> {
        self.features.snapshot()
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.active.snapshot()
    }

    pub fn set_search_paths(&self, paths: Vec<PathBuf>) {
        self.active.replace(paths);
    }

    pub fn prepend_search_path(&self, dir: PathBuf) {
        self.active.prepend(dir);
    }

    pub fn resolve(&self, name: &str, strategy: LoadStrategy) -> LoadResult<Candidate> {
        self.resolver
            .resolve(name, &self.active.snapshot(), strategy)
    }

    /// Loads `name` once per process. Returns `false` if it was already loaded.
    pub fn require(&self, name: &str) -> LoadResult<bool> {
        self.require_with(name, self.config.strategy)
    }

    /// [`LoadCoordinator::require`] preferring compiled artifacts, for
    /// components loaded before a compiler is usable.
    pub fn require_compiled(&self, name: &str) -> LoadResult<bool> {
        self.require_with(name, LoadStrategy::CompiledFirst)
    }

    pub fn require_with(&self, name: &str, strategy: LoadStrategy) -> LoadResult<bool> {
        if self.features.provides(name) {
            debug!(module = %name, "already loaded");
            return Ok(false);
        }

        let normalizer = self.features.normalizer();
        let _claim = match self.inflight.claim(normalizer.stem(name)) {
            Claim::Acquired(guard) => guard,
            Claim::Reentrant => {
                warn!(module = %name, "circular require; treating as loaded");
                return Ok(false);
            }
        };
        // Another thread may have finished it while we waited for the claim.
        if self.features.provides(name) {
            return Ok(false);
        }

        let candidate = self
            .resolver
            .resolve(name, &self.active.snapshot(), strategy)?;
        let feature = match candidate.kind {
            CandidateKind::Native => normalizer.native(name),
            CandidateKind::Source | CandidateKind::Compiled => normalizer.canonical(name),
        };
        let ctx = LoadContext {
            feature,
            candidate,
            strategy,
            direct: false,
        };
        self.run(&ctx)?;
        self.features.add(&ctx.feature);
        Ok(true)
    }

    /// Executes `path` unconditionally, without consulting or updating the
    /// feature registry. Repeated calls execute repeatedly.
    pub fn load(&self, path: &str) -> LoadResult<bool> {
        let strategy = self.config.strategy;
        let candidate = self
            .resolver
            .resolve_path(path, &self.active.snapshot(), strategy)?;
        let ctx = LoadContext {
            feature: path.to_string(),
            candidate,
            strategy,
            direct: true,
        };
        self.run(&ctx)?;
        Ok(true)
    }

    /// [`LoadCoordinator::require`], retrying once from the matching
    /// standard-library package directory when nothing is found.
    pub fn require_with_stdlib_fallback(&self, name: &str) -> LoadResult<bool> {
        match self.require(name) {
            Err(err) if err.is_not_found() => {}
            other => return other,
        }

        let package = self.stdlib_package_for(name);
        let stdlib = &self.config.stdlib;
        if let Some(root) = &stdlib.install_root {
            let lib_dir = root.join(&package).join("lib");
            if lib_dir.is_dir() {
                debug!(
                    package = %package,
                    dir = %lib_dir.display(),
                    "retrying from stdlib package"
                );
                self.active.prepend(lib_dir);
                match self.require(name) {
                    Err(err) if err.is_not_found() => {}
                    other => return other,
                }
            }
        }

        Err(LoadError::PackageResolution {
            name: name.to_string(),
            remediation: format!(
                "standard library package {package:?} ({req}) is not installed \
                 (hint: run `{hint} {package} --version '{req}'`)",
                req = stdlib.version_req,
                hint = stdlib.install_hint,
            ),
            package,
            version_req: stdlib.version_req.clone(),
        })
    }

    /// `net/http.ls` -> `<prefix>-net-http`.
    pub fn stdlib_package_for(&self, name: &str) -> String {
        let config = &self.config;
        let mut stem = name;
        for ext in [
            &config.compiled_file_extension,
            &config.source_file_extension,
            &config.native_file_extension,
        ] {
            if let Some(s) = stem.strip_suffix(ext.as_str()) {
                stem = s;
                break;
            }
        }
        let join = config.stdlib.join_char.to_string();
        let joined = stem
            .split(['/', '\\'])
            .filter(|seg| !seg.is_empty())
            .collect::<Vec<_>>()
            .join(&join);
        format!("{}{join}{joined}", config.stdlib.package_prefix)
    }

    /// Enters the bootstrap scope over this coordinator's search paths.
    pub fn bootstrap(&self) -> LoadResult<BootstrapGuard<'_>> {
        self.bootstrap.enter()
    }

    pub fn bootstrap_paths(&self) -> &[PathBuf] {
        self.bootstrap.bootstrap_paths()
    }

    /// Requires `names` in order, compiled-first, inside one bootstrap scope.
    pub fn require_in_bootstrap(&self, names: &[&str]) -> LoadResult<Vec<bool>> {
        let scope = self.bootstrap()?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.require_compiled(name)?);
        }
        scope.exit();
        Ok(out)
    }

    fn run(&self, ctx: &LoadContext) -> LoadResult<()> {
        let candidate = &ctx.candidate;
        debug!(
            feature = %ctx.feature,
            path = %candidate.path.display(),
            kind = ?candidate.kind,
            strategy = ctx.strategy.as_str(),
            "loading"
        );
        let loaded = match candidate.kind {
            CandidateKind::Source | CandidateKind::Compiled => {
                let compiled = self.compiled_path(candidate);
                let artifact = self.cache.resolve_artifact(
                    candidate.source_path.as_deref(),
                    &compiled,
                    self.config.verify_version_signature,
                )?;
                Loaded::Artifact(artifact)
            }
            CandidateKind::Native => {
                let symbolic = native::symbolic_name_for(&candidate.path);
                Loaded::Native(self.native.load_shared_library(&candidate.path, &symbolic)?)
            }
        };

        match loaded {
            Loaded::Artifact(artifact) => {
                let top = TopLevelContext {
                    feature: ctx.feature.clone(),
                    path: candidate.path.clone(),
                    direct: ctx.direct,
                };
                self.executor
                    .execute(&artifact, &top)
                    .map_err(|source| LoadError::Runtime {
                        feature: ctx.feature.clone(),
                        source,
                    })
            }
            Loaded::Native(module) => {
                debug!(symbol = %module.symbolic_name, "native extension initialized");
                Ok(())
            }
        }
    }

    fn compiled_path(&self, candidate: &Candidate) -> PathBuf {
        match (&candidate.compiled_path, &candidate.source_path) {
            (Some(path), _) => path.clone(),
            (None, Some(source)) => self.resolver.compiled_path_for(source),
            (None, None) => self.resolver.compiled_path_for(&candidate.path),
        }
    }
}

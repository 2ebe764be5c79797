//! Module loading with a compiled-artifact cache.
//!
//! A [`LoadCoordinator`] resolves logical module names against an ordered
//! search-path list, reuses persisted compiled artifacts when they are still
//! valid, recompiles when they are not, and falls back to native extensions
//! when no source exists. Compiling, executing and dynamic loading are
//! delegated to the [`Compiler`], [`Executor`] and [`NativeLoader`] seams.

pub mod artifact;
pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod facade;
pub mod locks;
pub mod native;
pub mod registry;
pub mod resolve;

pub use artifact::CompiledArtifact;
pub use bootstrap::{ActivePaths, BootstrapGuard, BootstrapPathManager};
pub use cache::{ArtifactCache, ArtifactProbe};
pub use config::LoaderConfig;
pub use coordinator::LoadCoordinator;
pub use error::{
    CompileError, CompileErrorKind, LoadError, LoadResult, NativeLoadError, RuntimeError,
};
pub use facade::{Compiler, Executor, NativeLoader, NativeModule, TopLevelContext};
pub use native::DylibLoader;
pub use registry::{FeatureNormalizer, FeatureRegistry};
pub use resolve::{Candidate, CandidateKind, LoadStrategy, PathResolver};

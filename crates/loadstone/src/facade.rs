//! Seams to the collaborators that sit outside the loader: the compiler front
//! end, the execution engine and the OS dynamic loader.

use std::path::{Path, PathBuf};

use crate::artifact::CompiledArtifact;
use crate::error::{CompileError, NativeLoadError, RuntimeError};

/// Turns a source file into an opaque payload.
///
/// Header stamping and persistence belong to [`crate::cache::ArtifactCache`];
/// a compiler only produces the bytes the executor understands.
pub trait Compiler: Send + Sync {
    fn compile(&self, source_path: &Path) -> Result<Vec<u8>, CompileError>;
}

/// What the executor is told about the unit it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopLevelContext {
    /// Canonical feature name, or the requested path for direct loads.
    pub feature: String,
    pub path: PathBuf,
    /// True for `load`-style direct execution.
    pub direct: bool,
}

pub trait Executor: Send + Sync {
    fn execute(
        &self,
        artifact: &CompiledArtifact,
        ctx: &TopLevelContext,
    ) -> Result<(), RuntimeError>;
}

/// Handle to an initialized native extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeModule {
    pub path: PathBuf,
    pub symbolic_name: String,
}

pub trait NativeLoader: Send + Sync {
    fn load_shared_library(
        &self,
        path: &Path,
        symbolic_name: &str,
    ) -> Result<NativeModule, NativeLoadError>;
}

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    Parse,
    Semantic,
    Unsupported,
    Io,
    Internal,
}

/// Error reported by a [`crate::facade::Compiler`]. Surfaced to callers verbatim.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub path: PathBuf,
    pub message: String,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, path: impl Into<PathBuf>, message: String) -> Self {
        Self {
            kind,
            path: path.into(),
            message,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "compile {} ({:?}): {}",
            self.path.display(),
            self.kind,
            self.message
        )
    }
}

impl std::error::Error for CompileError {}

/// Error raised by the execution engine while running a loaded unit.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RuntimeError {}

#[derive(Debug, Clone)]
pub struct NativeLoadError {
    pub path: PathBuf,
    pub message: String,
}

impl NativeLoadError {
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "load native extension {}: {}",
            self.path.display(),
            self.message
        )
    }
}

impl std::error::Error for NativeLoadError {}

/// Everything a load can fail with.
///
/// Conditions meaning "the cached copy cannot be trusted" never reach this
/// type: the artifact cache turns them into a recompile.
#[derive(Debug)]
pub enum LoadError {
    NotFound {
        name: String,
        searched_dirs: Vec<PathBuf>,
        searched_paths: Vec<PathBuf>,
    },
    InvalidName {
        name: String,
        reason: String,
    },
    Compile(CompileError),
    Runtime {
        feature: String,
        source: RuntimeError,
    },
    NativeLoad(NativeLoadError),
    /// A compiled artifact with no source beside it failed validation.
    UnusableArtifact {
        path: PathBuf,
        reason: String,
    },
    PackageResolution {
        name: String,
        package: String,
        version_req: String,
        remediation: String,
    },
    NestedBootstrap,
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl LoadError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LoadError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LoadError::NotFound { .. })
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotFound {
                name,
                searched_dirs,
                ..
            } => {
                write!(f, "cannot load such file: {name:?} (searched: ")?;
                if searched_dirs.is_empty() {
                    f.write_str("<no search paths>")?;
                } else {
                    for (i, dir) in searched_dirs.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{}", dir.display())?;
                    }
                }
                f.write_str(")")
            }
            LoadError::InvalidName { name, reason } => {
                write!(f, "invalid module name {name:?}: {reason}")
            }
            LoadError::Compile(err) => write!(f, "{err}"),
            LoadError::Runtime { feature, source } => {
                write!(f, "execute {feature:?}: {source}")
            }
            LoadError::NativeLoad(err) => write!(f, "{err}"),
            LoadError::UnusableArtifact { path, reason } => write!(
                f,
                "compiled artifact {} is unusable and has no source to rebuild from: {reason}",
                path.display()
            ),
            LoadError::PackageResolution {
                name, remediation, ..
            } => write!(f, "cannot load {name:?}: {remediation}"),
            LoadError::NestedBootstrap => {
                f.write_str("bootstrap scope is already active on this thread")
            }
            LoadError::Io { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Compile(err) => Some(err),
            LoadError::Runtime { source, .. } => Some(source),
            LoadError::NativeLoad(err) => Some(err),
            LoadError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<CompileError> for LoadError {
    fn from(err: CompileError) -> Self {
        LoadError::Compile(err)
    }
}

impl From<NativeLoadError> for LoadError {
    fn from(err: NativeLoadError) -> Self {
        LoadError::NativeLoad(err)
    }
}

pub type LoadResult<T> = Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_lists_dirs_in_order() {
        let err = LoadError::NotFound {
            name: "delta".to_string(),
            searched_dirs: vec![PathBuf::from("/a"), PathBuf::from("/b")],
            searched_paths: Vec::new(),
        };
        assert_eq!(
            err.to_string(),
            "cannot load such file: \"delta\" (searched: /a, /b)"
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn compile_error_is_surfaced_verbatim() {
        let inner = CompileError::new(
            CompileErrorKind::Parse,
            "/lib/a.ls",
            "unexpected end of input".to_string(),
        );
        let err = LoadError::from(inner.clone());
        assert_eq!(err.to_string(), inner.to_string());
        assert!(std::error::Error::source(&err).is_some());
    }
}

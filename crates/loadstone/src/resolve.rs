use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};

/// Which representation of a module a directory is probed for first.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum LoadStrategy {
    #[default]
    SourceFirst,
    CompiledFirst,
}

impl LoadStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadStrategy::SourceFirst => "source-first",
            LoadStrategy::CompiledFirst => "compiled-first",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateKind {
    Source,
    Compiled,
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub kind: CandidateKind,
    /// The file that matched.
    pub path: PathBuf,
    /// Source file to (re)compile from, if one exists.
    pub source_path: Option<PathBuf>,
    /// Where the compiled artifact for this module lives or would be written.
    pub compiled_path: Option<PathBuf>,
    /// Search directory the match came from; `None` for path-qualified names.
    pub dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NameForm {
    Bare,
    Source,
    Compiled,
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    source_ext: String,
    compiled_ext: String,
    native_ext: String,
}

impl PathResolver {
    pub fn new(
        source_ext: impl Into<String>,
        compiled_ext: impl Into<String>,
        native_ext: impl Into<String>,
    ) -> Self {
        Self {
            source_ext: source_ext.into(),
            compiled_ext: compiled_ext.into(),
            native_ext: native_ext.into(),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(
            config.source_file_extension.clone(),
            config.compiled_file_extension.clone(),
            config.native_file_extension.clone(),
        )
    }

    pub fn source_ext(&self) -> &str {
        &self.source_ext
    }

    /// Sibling compiled path of a source file: `dir/a.ls` -> `dir/a.lsc`.
    pub fn compiled_path_for(&self, source: &Path) -> PathBuf {
        replace_suffix(source, &self.source_ext, &self.compiled_ext)
    }

    /// Finds the first existing file for `name`, directory-major.
    ///
    /// Within one directory the order is source/compiled (per `strategy`)
    /// then native. A match in an earlier directory always wins.
    pub fn resolve(
        &self,
        name: &str,
        search_paths: &[PathBuf],
        strategy: LoadStrategy,
    ) -> LoadResult<Candidate> {
        validate_name(name)?;
        let (stem, form) = self.split_name(name);

        let mut searched_paths = Vec::new();
        if is_path_qualified(name) {
            if let Some(found) =
                self.probe(Path::new(stem), None, form, strategy, &mut searched_paths)
            {
                return Ok(found);
            }
            return Err(LoadError::NotFound {
                name: name.to_string(),
                searched_dirs: Vec::new(),
                searched_paths,
            });
        }

        for dir in search_paths {
            let base = dir.join(stem);
            if let Some(found) = self.probe(&base, Some(dir), form, strategy, &mut searched_paths) {
                return Ok(found);
            }
        }
        Err(LoadError::NotFound {
            name: name.to_string(),
            searched_dirs: search_paths.to_vec(),
            searched_paths,
        })
    }

    /// Like [`PathResolver::resolve`], but an existing file named exactly
    /// `path` is taken as-is; files with an unknown extension are treated as
    /// source.
    pub fn resolve_path(
        &self,
        path: &str,
        search_paths: &[PathBuf],
        strategy: LoadStrategy,
    ) -> LoadResult<Candidate> {
        validate_name(path)?;
        let direct = Path::new(path);
        if direct.is_file() {
            return Ok(self.classify_file(direct));
        }
        self.resolve(path, search_paths, strategy)
    }

    fn classify_file(&self, path: &Path) -> Candidate {
        let raw = path.to_string_lossy();
        let (_, form) = self.split_name(&raw);
        match form {
            NameForm::Compiled => self.compiled_candidate(path.to_path_buf(), None),
            NameForm::Native => Candidate {
                kind: CandidateKind::Native,
                path: path.to_path_buf(),
                source_path: None,
                compiled_path: None,
                dir: None,
            },
            NameForm::Source | NameForm::Bare => self.source_candidate(path.to_path_buf(), None),
        }
    }

    fn split_name<'a>(&self, name: &'a str) -> (&'a str, NameForm) {
        if let Some(stem) = name.strip_suffix(self.compiled_ext.as_str()) {
            return (stem, NameForm::Compiled);
        }
        if let Some(stem) = name.strip_suffix(self.source_ext.as_str()) {
            return (stem, NameForm::Source);
        }
        if name.ends_with(self.native_ext.as_str()) {
            return (name, NameForm::Native);
        }
        (name, NameForm::Bare)
    }

    fn probe(
        &self,
        base: &Path,
        dir: Option<&PathBuf>,
        form: NameForm,
        strategy: LoadStrategy,
        searched: &mut Vec<PathBuf>,
    ) -> Option<Candidate> {
        let source = with_suffix(base, &self.source_ext);
        let compiled = with_suffix(base, &self.compiled_ext);

        let mut order: Vec<CandidateKind> = Vec::with_capacity(3);
        match form {
            NameForm::Bare | NameForm::Source => {
                match strategy {
                    LoadStrategy::SourceFirst => {
                        order.extend([CandidateKind::Source, CandidateKind::Compiled])
                    }
                    LoadStrategy::CompiledFirst => {
                        order.extend([CandidateKind::Compiled, CandidateKind::Source])
                    }
                }
                if form == NameForm::Bare {
                    order.push(CandidateKind::Native);
                }
            }
            NameForm::Compiled => order.push(CandidateKind::Compiled),
            NameForm::Native => order.push(CandidateKind::Native),
        }

        for kind in order {
            let path = match kind {
                CandidateKind::Source => source.clone(),
                CandidateKind::Compiled => compiled.clone(),
                CandidateKind::Native => match form {
                    NameForm::Native => base.to_path_buf(),
                    _ => with_suffix(base, &self.native_ext),
                },
            };
            let hit = path.is_file();
            searched.push(path.clone());
            if !hit {
                continue;
            }
            let mut candidate = match kind {
                CandidateKind::Source => self.source_candidate(path, None),
                CandidateKind::Compiled => self.compiled_candidate(path, Some(source.clone())),
                CandidateKind::Native => Candidate {
                    kind,
                    path,
                    source_path: None,
                    compiled_path: None,
                    dir: None,
                },
            };
            candidate.dir = dir.cloned();
            return Some(candidate);
        }
        None
    }

    fn source_candidate(&self, path: PathBuf, dir: Option<PathBuf>) -> Candidate {
        Candidate {
            kind: CandidateKind::Source,
            compiled_path: Some(self.compiled_path_for(&path)),
            source_path: Some(path.clone()),
            path,
            dir,
        }
    }

    fn compiled_candidate(&self, path: PathBuf, source_hint: Option<PathBuf>) -> Candidate {
        let source = source_hint
            .unwrap_or_else(|| replace_suffix(&path, &self.compiled_ext, &self.source_ext));
        Candidate {
            kind: CandidateKind::Compiled,
            compiled_path: Some(path.clone()),
            source_path: source.is_file().then_some(source),
            path,
            dir: None,
        }
    }
}

/// Appends `suffix` to the raw path, leaving non-UTF-8 components intact.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(suffix);
    PathBuf::from(raw)
}

/// `dir/a<from>` -> `dir/a<to>`; appends `to` when the file name lacks `from`.
fn replace_suffix(path: &Path, from: &str, to: &str) -> PathBuf {
    match path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(from))
    {
        Some(stem) => path.with_file_name(format!("{stem}{to}")),
        None => with_suffix(path, to),
    }
}

fn is_path_qualified(name: &str) -> bool {
    let path = Path::new(name);
    path.is_absolute()
        || matches!(
            path.components().next(),
            Some(Component::CurDir | Component::ParentDir)
        )
}

fn validate_name(name: &str) -> LoadResult<()> {
    let invalid = |reason: &str| LoadError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.trim().is_empty() {
        return Err(invalid("module name must be non-empty"));
    }
    if name.as_bytes().contains(&0) {
        return Err(invalid("module name must not contain NUL"));
    }
    if name.ends_with('/') || name.ends_with('\\') {
        return Err(invalid("module name must not end with a path separator"));
    }
    if !is_path_qualified(name)
        && Path::new(name)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(invalid("module name must not contain `..` segments"));
    }
    Ok(())
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use loadstone_contracts::{
    DEFAULT_COMPILED_EXTENSION, DEFAULT_SOURCE_EXTENSION, ENV_PERSIST_ARTIFACTS,
    ENV_RUNTIME_ROOT, ENV_SEARCH_PATH, ENV_VERIFY_SIGNATURE, LOADER_CONFIG_SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};

use crate::resolve::LoadStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub schema_version: String,
    pub search_paths: Vec<PathBuf>,
    pub strategy: LoadStrategy,
    pub persist_compiled_artifacts: bool,
    pub verify_version_signature: bool,
    pub source_file_extension: String,
    pub compiled_file_extension: String,
    pub native_file_extension: String,
    /// Version string stamped into, and required of, compiled artifacts.
    pub runtime_version: String,
    pub bootstrap: BootstrapConfig,
    pub stdlib: StdlibConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Runtime install root scanned for library directories.
    pub runtime_root: Option<PathBuf>,
    /// Glob, relative to `runtime_root`, selecting library directories.
    pub library_dir_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StdlibConfig {
    /// Directory holding installed standard-library packages, one per subdir.
    pub install_root: Option<PathBuf>,
    pub package_prefix: String,
    pub join_char: char,
    pub version_req: String,
    pub install_hint: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            schema_version: LOADER_CONFIG_SCHEMA_VERSION.to_string(),
            search_paths: Vec::new(),
            strategy: LoadStrategy::SourceFirst,
            persist_compiled_artifacts: true,
            verify_version_signature: true,
            source_file_extension: DEFAULT_SOURCE_EXTENSION.to_string(),
            compiled_file_extension: DEFAULT_COMPILED_EXTENSION.to_string(),
            native_file_extension: format!(".{}", std::env::consts::DLL_EXTENSION),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            bootstrap: BootstrapConfig::default(),
            stdlib: StdlibConfig::default(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            runtime_root: None,
            library_dir_pattern: "**/lib".to_string(),
        }
    }
}

impl Default for StdlibConfig {
    fn default() -> Self {
        Self {
            install_root: None,
            package_prefix: "lsstd".to_string(),
            join_char: '-',
            version_req: "~> 1.0".to_string(),
            install_hint: "loadstone-pkg install".to_string(),
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version.trim() != LOADER_CONFIG_SCHEMA_VERSION {
            anyhow::bail!(
                "config schema_version mismatch: expected {:?} got {:?}",
                LOADER_CONFIG_SCHEMA_VERSION,
                self.schema_version
            );
        }
        validate_extension("source_file_extension", &self.source_file_extension)?;
        validate_extension("compiled_file_extension", &self.compiled_file_extension)?;
        validate_extension("native_file_extension", &self.native_file_extension)?;
        if self.compiled_file_extension == self.source_file_extension {
            anyhow::bail!(
                "compiled_file_extension must differ from source_file_extension: both {:?}",
                self.source_file_extension
            );
        }
        if self.native_file_extension == self.source_file_extension
            || self.native_file_extension == self.compiled_file_extension
        {
            anyhow::bail!(
                "native_file_extension must differ from source and compiled extensions: {:?}",
                self.native_file_extension
            );
        }
        if self.runtime_version.trim().is_empty() {
            anyhow::bail!("runtime_version must be non-empty");
        }
        if self.runtime_version.len() > u16::MAX as usize {
            anyhow::bail!("runtime_version is too long");
        }
        if self.bootstrap.library_dir_pattern.trim().is_empty() {
            anyhow::bail!("bootstrap.library_dir_pattern must be non-empty");
        }
        if self.stdlib.package_prefix.trim().is_empty() {
            anyhow::bail!("stdlib.package_prefix must be non-empty");
        }
        if matches!(self.stdlib.join_char, '/' | '\\' | '\0') {
            anyhow::bail!(
                "stdlib.join_char must not be a path separator or NUL: {:?}",
                self.stdlib.join_char
            );
        }
        Ok(())
    }

    fn normalize(&mut self) {
        normalize_string_in_place(&mut self.schema_version);
        normalize_string_in_place(&mut self.source_file_extension);
        normalize_string_in_place(&mut self.compiled_file_extension);
        normalize_string_in_place(&mut self.native_file_extension);
        normalize_string_in_place(&mut self.runtime_version);
        normalize_string_in_place(&mut self.bootstrap.library_dir_pattern);
        normalize_string_in_place(&mut self.stdlib.package_prefix);
        normalize_string_in_place(&mut self.stdlib.version_req);
        self.search_paths.retain(|p| !p.as_os_str().is_empty());
    }

    /// Applies `LOADSTONE_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(raw) = std::env::var_os(ENV_SEARCH_PATH) {
            self.search_paths = std::env::split_paths(&raw)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        if let Some(v) = env_flag(ENV_PERSIST_ARTIFACTS)? {
            self.persist_compiled_artifacts = v;
        }
        if let Some(v) = env_flag(ENV_VERIFY_SIGNATURE)? {
            self.verify_version_signature = v;
        }
        if let Some(root) = std::env::var_os(ENV_RUNTIME_ROOT) {
            if !root.is_empty() {
                self.bootstrap.runtime_root = Some(PathBuf::from(root));
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<LoaderConfig> {
    let bytes = std::fs::read(path).with_context(|| format!("read config: {}", path.display()))?;
    parse_config_bytes(&bytes, path)
}

pub fn parse_config_bytes(bytes: &[u8], path: &Path) -> Result<LoaderConfig> {
    let mut config: LoaderConfig = serde_json::from_slice(bytes)
        .with_context(|| format!("parse config JSON: {}", path.display()))?;
    config.normalize();
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for dir in &mut config.search_paths {
        if dir.is_relative() {
            *dir = base.join(&*dir);
        }
    }
    if let Some(root) = &mut config.bootstrap.runtime_root {
        if root.is_relative() {
            *root = base.join(&*root);
        }
    }
    if let Some(root) = &mut config.stdlib.install_root {
        if root.is_relative() {
            *root = base.join(&*root);
        }
    }
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

fn validate_extension(field: &str, raw: &str) -> Result<()> {
    if raw.len() < 2 || !raw.starts_with('.') {
        anyhow::bail!("{field} must start with '.' and be non-empty, got {:?}", raw);
    }
    if raw[1..]
        .bytes()
        .any(|b| b == 0 || b == b'/' || b == b'\\' || b.is_ascii_whitespace())
    {
        anyhow::bail!(
            "{field} must not contain whitespace, '/', '\\\\', or NUL: {:?}",
            raw
        );
    }
    Ok(())
}

fn normalize_string_in_place(s: &mut String) {
    if s.trim() != s {
        *s = s.trim().to_string();
    }
}

fn env_flag(name: &str) -> Result<Option<bool>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    parse_flag(&raw)
        .map(Some)
        .with_context(|| format!("{name}={raw:?}"))
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => {
            anyhow::bail!("expected a boolean (1/0, true/false, yes/no, on/off): {other:?}")
        }
    }
}

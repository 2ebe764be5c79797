//! Native extensions backed by the OS dynamic loader.
//!
//! An extension is a shared library exporting
//! `loadstone_init_<symbolic name>`, an `extern "C" fn() -> i32` that returns
//! zero on success.

use std::path::Path;

use loadstone_contracts::NATIVE_INIT_SYMBOL_PREFIX;
use tracing::info;

use crate::error::NativeLoadError;
use crate::facade::{NativeLoader, NativeModule};

pub type NativeInitFn = unsafe extern "C" fn() -> i32;

/// Derives the symbolic name from an extension path: `net/http-parser.so`
/// becomes `http_parser`.
pub fn symbolic_name_for(path: &Path) -> String {
    let stem = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = stem.split('.').next().unwrap_or_default();
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// [`NativeLoader`] over `libloading`.
///
/// Library handles are leaked on success; extensions are never unloaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl NativeLoader for DylibLoader {
    fn load_shared_library(
        &self,
        path: &Path,
        symbolic_name: &str,
    ) -> Result<NativeModule, NativeLoadError> {
        if symbolic_name.is_empty() {
            return Err(NativeLoadError::new(path, "empty symbolic name"));
        }
        let symbol = format!("{NATIVE_INIT_SYMBOL_PREFIX}{symbolic_name}");

        let lib = unsafe { libloading::Library::new(path) }
            .map_err(|e| NativeLoadError::new(path, format!("dlopen failed: {e}")))?;
        let status = {
            let init: libloading::Symbol<NativeInitFn> = unsafe { lib.get(symbol.as_bytes()) }
                .map_err(|e| NativeLoadError::new(path, format!("missing {symbol}: {e}")))?;
            unsafe { init() }
        };
        if status != 0 {
            return Err(NativeLoadError::new(
                path,
                format!("{symbol} returned {status}"),
            ));
        }

        std::mem::forget(lib);
        info!(path = %path.display(), symbol = %symbol, "loaded native extension");
        Ok(NativeModule {
            path: path.to_path_buf(),
            symbolic_name: symbolic_name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_name_strips_dirs_and_suffixes() {
        assert_eq!(symbolic_name_for(Path::new("/x/net/http-parser.so")), "http_parser");
        assert_eq!(symbolic_name_for(Path::new("zlib.so.1")), "zlib");
        assert_eq!(symbolic_name_for(Path::new("digest.dylib")), "digest");
    }

    #[test]
    fn missing_library_is_a_load_error() {
        let err = DylibLoader
            .load_shared_library(Path::new("/nonexistent/ext.so"), "ext")
            .unwrap_err();
        assert_eq!(err.path, Path::new("/nonexistent/ext.so"));
        assert!(err.message.contains("dlopen failed"), "{}", err.message);
    }

    #[test]
    fn non_library_file_is_a_load_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fake.so");
        std::fs::write(&path, b"not an ELF").unwrap();
        assert!(DylibLoader.load_shared_library(&path, "fake").is_err());
    }
}

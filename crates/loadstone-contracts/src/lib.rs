//! Shared, version-pinned identifiers.
//!
//! These constants are the single source of truth for the compiled-artifact
//! format revision, default file extensions, and the schema strings that
//! appear in machine-readable I/O.

/// Leading bytes of every persisted compiled artifact.
pub const ARTIFACT_MAGIC: [u8; 4] = *b"LSTA";

/// Format revision embedded in each artifact header. Bump on any change to
/// the artifact layout or to the payload contract with the compiler.
pub const ARTIFACT_SIGNATURE_VERSION: u32 = 3;

pub const DEFAULT_SOURCE_EXTENSION: &str = ".ls";
pub const DEFAULT_COMPILED_EXTENSION: &str = ".lsc";

/// Prefix of the init symbol a native extension must export:
/// `loadstone_init_<symbolic name>`.
pub const NATIVE_INIT_SYMBOL_PREFIX: &str = "loadstone_init_";

pub const LOADER_CONFIG_SCHEMA_VERSION: &str = "loadstone.config@0.1.0";
pub const RESOLVE_REPORT_SCHEMA_VERSION: &str = "loadstone.resolve.report@0.1.0";
pub const CHECK_REPORT_SCHEMA_VERSION: &str = "loadstone.check.report@0.1.0";
pub const INSPECT_REPORT_SCHEMA_VERSION: &str = "loadstone.inspect.report@0.1.0";
pub const BOOTSTRAP_REPORT_SCHEMA_VERSION: &str = "loadstone.bootstrap.report@0.1.0";

pub const ENV_SEARCH_PATH: &str = "LOADSTONE_PATH";
pub const ENV_PERSIST_ARTIFACTS: &str = "LOADSTONE_PERSIST_ARTIFACTS";
pub const ENV_VERIFY_SIGNATURE: &str = "LOADSTONE_VERIFY_SIGNATURE";
pub const ENV_RUNTIME_ROOT: &str = "LOADSTONE_RUNTIME_ROOT";
pub const ENV_LOG: &str = "LOADSTONE_LOG";

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use loadstone::artifact::mtime_parts;
use loadstone::config::{self, LoaderConfig};
use loadstone::{
    ActivePaths, ArtifactCache, ArtifactProbe, BootstrapPathManager, Candidate, CompileError,
    CompileErrorKind, CompiledArtifact, Compiler, LoadError, LoadStrategy, PathResolver,
};
use loadstone_contracts::{
    BOOTSTRAP_REPORT_SCHEMA_VERSION, CHECK_REPORT_SCHEMA_VERSION, ENV_LOG,
    INSPECT_REPORT_SCHEMA_VERSION, RESOLVE_REPORT_SCHEMA_VERSION,
};

#[derive(Parser)]
#[command(name = "loadstone")]
#[command(about = "Inspect module resolution and the compiled-artifact cache.", long_about = None)]
struct Cli {
    /// Loader config JSON; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show which file a module name resolves to.
    Resolve {
        #[arg(long)]
        name: String,
        /// Search directory; repeatable. Replaces the configured list.
        #[arg(long = "path")]
        paths: Vec<PathBuf>,
        #[arg(long, value_enum)]
        strategy: Option<LoadStrategy>,
    },
    /// Report whether a compiled artifact would be reused, without compiling.
    Check {
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        compiled: Option<PathBuf>,
    },
    /// Decode an artifact header.
    Inspect {
        #[arg(long)]
        artifact: PathBuf,
    },
    /// Print the bootstrap search-path list.
    BootstrapPaths,
}

#[derive(Debug, Serialize)]
struct ResolveReport {
    schema_version: &'static str,
    name: String,
    strategy: &'static str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate: Option<Candidate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    searched_dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    searched_paths: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    schema_version: &'static str,
    compiled: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    verify: bool,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    schema_version: &'static str,
    artifact: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    header: Option<ArtifactHeader>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ArtifactHeader {
    signature_version: u32,
    runtime_version: String,
    source_mtime_secs: u64,
    source_mtime_nanos: u32,
    payload_len: usize,
    payload_sha256: String,
}

#[derive(Debug, Serialize)]
struct BootstrapReport {
    schema_version: &'static str,
    paths: Vec<String>,
}

/// `check` only probes; any attempt to compile is a bug.
struct ProbeOnly;

impl Compiler for ProbeOnly {
    fn compile(&self, source_path: &Path) -> Result<Vec<u8>, CompileError> {
        Err(CompileError::new(
            CompileErrorKind::Unsupported,
            source_path,
            "the loadstone CLI does not compile".to_string(),
        ))
    }
}

fn main() -> std::process::ExitCode {
    init_logging();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(ENV_LOG)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    let config = load_effective_config(cli.config.as_deref())?;

    match cli.cmd {
        Cmd::Resolve {
            name,
            paths,
            strategy,
        } => {
            let strategy = strategy.unwrap_or(config.strategy);
            let search_paths = if paths.is_empty() {
                config.search_paths.clone()
            } else {
                paths
            };
            let resolver = PathResolver::from_config(&config);
            let mut report = ResolveReport {
                schema_version: RESOLVE_REPORT_SCHEMA_VERSION,
                name: name.clone(),
                strategy: strategy.as_str(),
                ok: false,
                candidate: None,
                searched_dirs: Vec::new(),
                searched_paths: Vec::new(),
            };
            match resolver.resolve(&name, &search_paths, strategy) {
                Ok(candidate) => {
                    report.ok = true;
                    report.candidate = Some(candidate);
                }
                Err(LoadError::NotFound {
                    searched_dirs,
                    searched_paths,
                    ..
                }) => {
                    report.searched_dirs = display_all(&searched_dirs);
                    report.searched_paths = display_all(&searched_paths);
                }
                Err(err) => return Err(err.into()),
            }
            print_json(&report)?;
            Ok(exit_code(report.ok))
        }
        Cmd::Check { source, compiled } => {
            let compiled = match (compiled, &source) {
                (Some(c), _) => c,
                (None, Some(s)) => PathResolver::from_config(&config).compiled_path_for(s),
                (None, None) => anyhow::bail!("set --compiled, --source, or both"),
            };
            let cache = ArtifactCache::from_config(Arc::new(ProbeOnly), &config);
            let probe = cache.probe(
                source.as_deref(),
                &compiled,
                config.verify_version_signature,
            );
            let report = CheckReport {
                schema_version: CHECK_REPORT_SCHEMA_VERSION,
                compiled: compiled.display().to_string(),
                source: source.as_ref().map(|s| s.display().to_string()),
                verify: config.verify_version_signature,
                outcome: probe.label(),
                detail: probe.detail(),
            };
            print_json(&report)?;
            Ok(exit_code(matches!(probe, ArtifactProbe::Fresh(_))))
        }
        Cmd::Inspect { artifact } => {
            let bytes = std::fs::read(&artifact)
                .with_context(|| format!("read artifact: {}", artifact.display()))?;
            let mut report = InspectReport {
                schema_version: INSPECT_REPORT_SCHEMA_VERSION,
                artifact: artifact.display().to_string(),
                ok: false,
                header: None,
                error: None,
            };
            match CompiledArtifact::decode(&bytes) {
                Ok(decoded) => {
                    let (secs, nanos) = mtime_parts(decoded.source_mtime_at_compile);
                    report.ok = true;
                    report.header = Some(ArtifactHeader {
                        signature_version: decoded.signature_version,
                        payload_sha256: decoded.payload_sha256_hex(),
                        runtime_version: decoded.runtime_version,
                        source_mtime_secs: secs,
                        source_mtime_nanos: nanos,
                        payload_len: decoded.payload.len(),
                    });
                }
                Err(err) => report.error = Some(err.to_string()),
            }
            print_json(&report)?;
            Ok(exit_code(report.ok))
        }
        Cmd::BootstrapPaths => {
            let active = Arc::new(ActivePaths::new(config.search_paths.clone()));
            let manager = BootstrapPathManager::new(&config.bootstrap, active)?;
            let report = BootstrapReport {
                schema_version: BOOTSTRAP_REPORT_SCHEMA_VERSION,
                paths: display_all(manager.bootstrap_paths()),
            };
            print_json(&report)?;
            Ok(std::process::ExitCode::SUCCESS)
        }
    }
}

fn load_effective_config(path: Option<&Path>) -> Result<LoaderConfig> {
    let mut config = match path {
        Some(path) => config::load_config(path)?,
        None => LoaderConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("apply environment overrides")?;
    config.validate()?;
    Ok(config)
}

fn display_all(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

fn exit_code(ok: bool) -> std::process::ExitCode {
    if ok {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::from(1)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

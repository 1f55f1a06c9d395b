//! Patch Verifier CLI
//!
//! Runs the verification loop until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use patch_verifier::{
    GerritClient, Manifest, Orchestrator, Result, StateStore, SystemRunner, Validate,
    VerifierConfig,
};

#[derive(Parser, Debug)]
#[command(name = "patch-verifier", version, about = "Continuous patch verification bot")]
struct Cli {
    /// Test manifest, one `name:command` scenario per line
    manifest: PathBuf,

    /// Working directory holding the source trees, state record and
    /// optional verifier.toml
    work_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut orchestrator = match startup(&cli.manifest, &cli.work_dir) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!(error = %e, fatal = e.is_fatal(), "startup failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = orchestrator.run_forever() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }
}

/// Loads configuration, manifest and state, and wires the pipeline.
fn startup(manifest_path: &Path, work_dir: &Path) -> Result<Orchestrator> {
    std::fs::create_dir_all(work_dir)?;
    // Build tools run with a unit's tree as cwd, so paths must not be relative.
    let work_dir = work_dir.canonicalize()?;
    let work_dir = work_dir.as_path();

    let config = VerifierConfig::load(work_dir)?;
    for warning in config.validate().into_result()? {
        tracing::warn!("{}", warning);
    }

    let manifest = Manifest::load(manifest_path)?;
    let state = StateStore::load_from_dir(work_dir)?;
    let service = Arc::new(GerritClient::new(&config.gerrit)?);

    tracing::info!(
        work_dir = ?work_dir,
        gerrit = %config.gerrit.url,
        project = %config.gerrit.project,
        state_file = ?state.path(),
        remembered = state.len(),
        "verifier initialized"
    );

    Orchestrator::from_config(
        &config,
        work_dir,
        manifest,
        state,
        service,
        Arc::new(SystemRunner::new()),
    )
}

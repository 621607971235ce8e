//! vetree command line interface
//!
//! Offline operator tool for decision-tree artifacts: migrate legacy files,
//! score a report, inspect or export the serving artifact.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vetree_core::{
    export_canonical_json, load_artifact, migrate, Artifact, FeatureEncoder, TypeResolution,
    VetreeConfig,
};

#[derive(Parser, Debug)]
#[command(name = "vetree")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Livestock health decision-tree artifact tool", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert a legacy artifact to the current format
    Migrate {
        /// Legacy artifact (binary v1 or JSON object graph)
        legacy: PathBuf,
        /// Destination for the current-format artifact
        new: PathBuf,
        /// Coerce objects whose type tag is not recognised
        #[arg(long)]
        permissive: bool,
    },
    /// Score a health report
    Predict {
        /// Artifact to load instead of the configured one
        #[arg(short, long, value_name = "PATH")]
        artifact: Option<PathBuf>,
        /// Report JSON file, or `-` for stdin
        report: PathBuf,
    },
    /// Print a summary of an artifact
    Inspect {
        #[arg(short, long, value_name = "PATH")]
        artifact: Option<PathBuf>,
    },
    /// Write the artifact as canonical JSON
    Export {
        #[arg(short, long, value_name = "PATH")]
        artifact: Option<PathBuf>,
        /// Output file; stdout when omitted
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(env::var("RUST_LOG").ok().as_deref(), cli.verbose))
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = match &cli.config {
        Some(path) => VetreeConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => VetreeConfig::default(),
    };
    debug!(?config, "configuration");

    match cli.command {
        Commands::Migrate {
            legacy,
            new,
            permissive,
        } => handle_migrate(&config, &legacy, &new, permissive),
        Commands::Predict { artifact, report } => {
            handle_predict(&config, artifact.as_deref(), &report)
        }
        Commands::Inspect { artifact } => handle_inspect(&config, artifact.as_deref()),
        Commands::Export { artifact, output } => {
            handle_export(&config, artifact.as_deref(), output.as_deref())
        }
    }
}

fn handle_migrate(config: &VetreeConfig, legacy: &Path, new: &Path, permissive: bool) -> Result<()> {
    let mut migration = config.migration.clone();
    if permissive {
        migration.type_resolution = TypeResolution::Permissive;
    }

    let artifact = migrate(legacy, new, &migration)
        .with_context(|| format!("Failed to migrate {}", legacy.display()))?;
    info!("Migrated artifact written to {}", new.display());
    println!("{}", serde_json::to_string_pretty(&artifact.summary()?)?);
    Ok(())
}

fn handle_predict(config: &VetreeConfig, artifact: Option<&Path>, report: &Path) -> Result<()> {
    let artifact = open_artifact(config, artifact)?;
    let report = read_report(report)?;

    let encoder = FeatureEncoder::new(config.encoder.clone());
    let prediction = artifact
        .predict_with(&encoder, &report)
        .context("Prediction failed")?;

    let out = json!({
        "diagnosis": prediction.label,
        "label_index": prediction.label_index,
        "confidence": round3(prediction.confidence),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn handle_inspect(config: &VetreeConfig, artifact: Option<&Path>) -> Result<()> {
    let artifact = open_artifact(config, artifact)?;
    let summary = artifact.summary()?;
    let mut out = serde_json::to_value(&summary)?;
    out["features"] = json!(artifact.schema().names());
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn handle_export(config: &VetreeConfig, artifact: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let artifact = open_artifact(config, artifact)?;
    let exported = export_canonical_json(&artifact)?;
    match output {
        Some(path) => {
            fs::write(path, &exported)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Exported {} bytes to {}", exported.len(), path.display());
        }
        None => println!("{exported}"),
    }
    Ok(())
}

fn open_artifact(config: &VetreeConfig, explicit: Option<&Path>) -> Result<Artifact> {
    let path = explicit.unwrap_or(config.artifact.path.as_path());
    load_artifact(path).with_context(|| format!("Failed to load artifact {}", path.display()))
}

fn read_report(source: &Path) -> Result<Value> {
    let raw = if source == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read report from stdin")?;
        buf
    } else {
        fs::read_to_string(source)
            .with_context(|| format!("Failed to read report {}", source.display()))?
    };
    serde_json::from_str(&raw).context("Report is not valid JSON")
}

/// `RUST_LOG` when set and valid, otherwise `debug` with `--verbose` and `info` without.
fn log_filter(rust_log: Option<&str>, verbose: bool) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_migrate_flags() {
        let cli = Cli::try_parse_from(["vetree", "migrate", "old.json", "new.vtra", "--permissive"])
            .unwrap();
        match cli.command {
            Commands::Migrate {
                legacy,
                new,
                permissive,
            } => {
                assert_eq!(legacy, PathBuf::from("old.json"));
                assert_eq!(new, PathBuf::from("new.vtra"));
                assert!(permissive);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_read_report_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        fs::write(&path, r#"{"animal_type": "goat", "symptoms": ["cough"]}"#).unwrap();
        let report = read_report(&path).unwrap();
        assert_eq!(report["animal_type"], "goat");

        fs::write(&path, "not json").unwrap();
        assert!(read_report(&path).is_err());
    }

    #[test]
    fn test_log_filter_prefers_rust_log() {
        assert_eq!(log_filter(None, false).to_string(), "info");
        assert_eq!(log_filter(None, true).to_string(), "debug");
        assert_eq!(
            log_filter(Some("vetree_core=trace"), false).to_string(),
            "vetree_core=trace"
        );
        assert_eq!(log_filter(Some("vetree_core=loud"), true).to_string(), "debug");
    }

    #[test]
    fn test_round3() {
        assert_eq!(round3(0.77777), 0.778);
        assert_eq!(round3(1.0), 1.0);
    }
}

//! warpcheck CLI
//!
//! Loads a JSON-encoded GPU module, runs the divergence and coalescing
//! analyses, and prints the findings.

use clap::{Parser, ValueEnum};
use miette::{IntoDiagnostic, Result};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warpcheck::ir::Module;
use warpcheck::{Analyzer, AnalyzerConfig, OutputFormat, Reporter};

#[derive(Parser)]
#[command(name = "warpcheck")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Static performance linter for GPU compute kernels")]
struct Cli {
    /// JSON-encoded GPU module to analyze
    #[arg(value_name = "MODULE")]
    module: PathBuf,

    /// Output format for findings
    #[arg(long, value_enum, default_value_t = Format::Human)]
    format: Format,

    /// Print findings without debug locations as raw instruction text
    #[arg(short, long)]
    verbose: bool,

    /// Divergence score above which a branch is reported
    #[arg(long)]
    diverge_threshold: Option<f64>,

    /// Memory requests per warp above which an access is reported
    #[arg(long)]
    coalesce_threshold: Option<f64>,

    /// Enable stride-based severity classification of coalesce findings
    #[arg(long)]
    classify_stride: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Human,
    Machine,
}

impl From<Format> for OutputFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Human => OutputFormat::Human,
            Format::Machine => OutputFormat::MachineReadable,
        }
    }
}

/// Failures while loading a module file
#[derive(Debug, Error)]
enum LoadError {
    #[error("reading {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {} as a GPU module", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn load_module(path: &Path) -> std::result::Result<Module, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let module = load_module(&cli.module).into_diagnostic()?;

    let mut config = AnalyzerConfig {
        format: cli.format.into(),
        verbose: cli.verbose,
        classify_stride: cli.classify_stride,
        ..AnalyzerConfig::default()
    };
    if let Some(t) = cli.diverge_threshold {
        config.diverge_threshold = t;
    }
    if let Some(t) = cli.coalesce_threshold {
        config.coalesce_threshold = t;
    }

    let findings = Analyzer::new(&module, config.clone()).run();

    let stdout = std::io::stdout().lock();
    let mut reporter = Reporter::new(config.format, config.verbose, stdout);
    reporter.emit_all(&module, &findings).into_diagnostic()?;

    if matches!(config.format, OutputFormat::Human) {
        eprintln!("{}: {} finding(s)", module.name, findings.len());
    }
    Ok(())
}

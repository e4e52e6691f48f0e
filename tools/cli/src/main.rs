//! TwinSync CLI - Command line interface for the reconciliation core.
//!
//! This tool runs reconciliation passes over scenario files and exposes the
//! platform naming rules.

mod scenario;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use twinsync_common::SyncPath;
use twinsync_sync::{
    FixedClock, NameGenerator, Platform, Reconciler, SuffixType, SystemClock,
};

use crate::scenario::{planned_ops, Scenario};

#[derive(Parser)]
#[command(name = "twinsync")]
#[command(about = "TwinSync - Two-way folder reconciliation")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass over a scenario file and print the plan.
    Plan {
        /// Scenario JSON file.
        scenario: PathBuf,

        /// Output format.
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Check a name against a platform's naming rules.
    CheckName {
        /// Name to check.
        name: String,

        /// Platform rules to apply (default: this machine).
        #[arg(short, long, value_enum)]
        platform: Option<PlatformArg>,
    },

    /// Generate a valid replacement name for a path.
    GenName {
        /// Relative path, e.g. "/docs/report.txt".
        path: String,

        /// Suffix tag.
        #[arg(short, long, value_enum, default_value = "conflict")]
        suffix: SuffixArg,

        /// Seed for the random part of the suffix.
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum PlatformArg {
    Windows,
    Macos,
    Linux,
}

impl From<PlatformArg> for Platform {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Windows => Platform::Windows,
            PlatformArg::Macos => Platform::MacOs,
            PlatformArg::Linux => Platform::Linux,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SuffixArg {
    Conflict,
    Orphan,
    Blacklisted,
}

impl From<SuffixArg> for SuffixType {
    fn from(arg: SuffixArg) -> Self {
        match arg {
            SuffixArg::Conflict => SuffixType::Conflict,
            SuffixArg::Orphan => SuffixType::Orphan,
            SuffixArg::Blacklisted => SuffixType::Blacklisted,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Plan { scenario, format } => cmd_plan(&scenario, format),

        Commands::CheckName { name, platform } => {
            cmd_check_name(&name, platform.map(Platform::from).unwrap_or_default())
        }

        Commands::GenName { path, suffix, seed } => cmd_gen_name(&path, suffix.into(), seed),
    }
}

/// Run a reconciliation pass over a scenario.
fn cmd_plan(path: &PathBuf, format: OutputFormat) -> Result<()> {
    info!("Loading scenario: {}", path.display());

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let scenario = Scenario::from_json(&json)?;
    let mut workload = scenario.build()?;

    let mut reconciler = match scenario.now {
        Some(now) => Reconciler::with_clock(&scenario.config, FixedClock(now)),
        None => Reconciler::with_clock(&scenario.config, SystemClock),
    };
    let report = reconciler.run_pass(&mut workload.trees, &mut workload.conflicts, &mut workload.ops);
    let plan = planned_ops(&workload.trees, &workload.ops);

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "report": report,
                "operations": plan,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Pass {:?}", report.outcome);
            for record in &report.blacklisted {
                println!("  [BLACKLISTED] {} {}: {}", record.side, record.path, record.kind);
            }
            for issue in &report.issues {
                println!("  [CONFLICT] {}: {}", issue.conflict_type, issue.message);
            }
            if !report.broken_cycle_ops.is_empty() {
                println!("  Broke {} reordering cycle(s)", report.broken_cycle_ops.len());
            }

            if plan.is_empty() {
                println!("Nothing to do.");
            } else {
                println!("Operations:");
                for (i, op) in plan.iter().enumerate() {
                    let path = op
                        .path
                        .as_ref()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "?".to_string());
                    let mut line = format!(
                        "  {}. {} {} {} -> {}",
                        i + 1,
                        op.op_type,
                        op.affected_side,
                        path,
                        op.target
                    );
                    if let Some(parent) = &op.new_parent {
                        line.push_str(&format!(" under {}", parent));
                    }
                    if let Some(name) = &op.new_name {
                        line.push_str(&format!(" as '{}'", name));
                    }
                    if op.omit {
                        line.push_str(" (bookkeeping only)");
                    }
                    if op.breaking_cycle {
                        line.push_str(" (breaks cycle)");
                    }
                    println!("{}", line);
                }
            }
        }
    }

    Ok(())
}

/// Check a name against the naming rules.
fn cmd_check_name(name: &str, platform: Platform) -> Result<()> {
    match platform.check_name(name) {
        None => println!("'{}' is valid on {:?}", name, platform),
        Some(kind) => println!("'{}' is invalid on {:?}: {}", name, platform, kind),
    }
    Ok(())
}

/// Generate a replacement name.
fn cmd_gen_name(path: &str, suffix: SuffixType, seed: Option<u64>) -> Result<()> {
    let path = SyncPath::parse(path).context("Invalid path")?;
    let mut names = NameGenerator::new(Box::new(SystemClock), seed);
    println!("{}", names.generate_new_valid_name(&path, suffix));
    Ok(())
}

//! policygate-run: drive a stream of order intents through the policy
//! engine with a broker, producing an audit log, an execution event log,
//! and a run summary.
//!
//! Exit codes: 0 on success, 2 for any error (including a broker failure
//! mid-run; the partial audit log is left intact).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;

use policygate_capital::audit::JsonlWriter;
use policygate_capital::broker::BrokerKind;
use policygate_capital::engine::PolicyEngine;
use policygate_capital::intent::OrderIntent;
use policygate_capital::logging::{json_log, obj, v_str};
use policygate_capital::runner::run_stream;
use policygate_capital::state::{ExecutionState, MarketSnapshot, PortfolioState};

#[derive(Parser)]
#[command(name = "policygate-run")]
#[command(about = "Run an order intent stream through the policy engine with a broker")]
struct Args {
    /// Path to the policy YAML file
    #[arg(long)]
    policy: PathBuf,

    /// Path to a JSONL file of order intents, one per line
    #[arg(long)]
    intents: PathBuf,

    /// Path to the initial portfolio state JSON file
    #[arg(long)]
    portfolio: PathBuf,

    /// Path to the market snapshot JSON file
    #[arg(long)]
    market: PathBuf,

    /// Path to the initial execution state JSON file (defaults to empty)
    #[arg(long)]
    execution: Option<PathBuf>,

    /// Audit event JSONL output (recreated each run)
    #[arg(long = "audit-log")]
    audit_log: Option<PathBuf>,

    /// Execution event JSONL output (recreated each run)
    #[arg(long = "exec-log")]
    exec_log: Option<PathBuf>,

    /// Broker adapter: sim, alpaca, or tradier
    #[arg(long, default_value = "sim")]
    broker: String,

    /// Write the run summary JSON here as well as stdout
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Pretty-print the summary JSON
    #[arg(long)]
    pretty: bool,
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))
}

fn load_intents(path: &Path) -> Result<Vec<OrderIntent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let mut intents = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let intent: OrderIntent = serde_json::from_str(line)
            .with_context(|| format!("bad intent on line {} of {}", idx + 1, path.display()))?;
        intents.push(intent);
    }
    Ok(intents)
}

/// Each run starts a fresh log; append-only applies within a run.
fn fresh_writer(path: &Path) -> Result<JsonlWriter> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("cannot reset log {}", path.display()))?;
    }
    Ok(JsonlWriter::open(path)?)
}

async fn run(args: &Args) -> Result<()> {
    let engine = PolicyEngine::from_path(&args.policy)?;
    let intents = load_intents(&args.intents)?;
    let mut portfolio: PortfolioState = load_json(&args.portfolio)?;
    let market: MarketSnapshot = load_json(&args.market)?;
    let mut execution: ExecutionState = match &args.execution {
        Some(path) => load_json(path)?,
        None => ExecutionState::default(),
    };

    let mut audit_log = match &args.audit_log {
        Some(path) => Some(fresh_writer(path)?),
        None => None,
    };
    let mut exec_log = match &args.exec_log {
        Some(path) => Some(fresh_writer(path)?),
        None => None,
    };

    let kind = BrokerKind::from_name(&args.broker)?;
    json_log("broker", obj(&[("type", v_str(&args.broker)), ("status", v_str("selected"))]));
    let mut broker = kind.build()?;

    let summary = run_stream(
        &engine,
        &intents,
        &mut portfolio,
        &market,
        &mut execution,
        broker.as_mut(),
        audit_log.as_mut(),
        exec_log.as_mut(),
    )
    .await?;

    let summary_json = summary.to_json(&portfolio, &execution);
    let rendered = if args.pretty {
        serde_json::to_string_pretty(&summary_json)?
    } else {
        serde_json::to_string(&summary_json)?
    };
    println!("{}", rendered);

    if let Some(path) = &args.summary {
        std::fs::write(path, format!("{}\n", rendered))
            .with_context(|| format!("cannot write summary to {}", path.display()))?;
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args).await {
        eprintln!("error: {:#}", e);
        std::process::exit(2);
    }
}

//! policygate-eval: evaluate one order intent against a capital policy.
//!
//! Exit codes: 0 for ALLOW/MODIFY, 1 for DENY, 2 for any error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;

use policygate_capital::audit::{build_audit_event, JsonlWriter};
use policygate_capital::decision::Verdict;
use policygate_capital::engine::PolicyEngine;
use policygate_capital::intent::OrderIntent;
use policygate_capital::state::{ExecutionState, MarketSnapshot, PortfolioState};

#[derive(Parser)]
#[command(name = "policygate-eval")]
#[command(about = "Evaluate an order intent against a capital policy")]
struct Args {
    /// Path to the policy YAML file
    #[arg(long)]
    policy: PathBuf,

    /// Path to the order intent JSON file
    #[arg(long)]
    intent: PathBuf,

    /// Path to the portfolio state JSON file
    #[arg(long)]
    portfolio: PathBuf,

    /// Path to the market snapshot JSON file
    #[arg(long)]
    market: PathBuf,

    /// Path to the execution state JSON file (defaults to an empty state)
    #[arg(long)]
    execution: Option<PathBuf>,

    /// Append an audit event to this JSONL file
    #[arg(long = "audit-log")]
    audit_log: Option<PathBuf>,

    /// Pretty-print the decision JSON
    #[arg(long)]
    pretty: bool,
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))
}

fn run(args: &Args) -> Result<i32> {
    let engine = PolicyEngine::from_path(&args.policy)?;
    let intent: OrderIntent = load_json(&args.intent)?;
    let portfolio: PortfolioState = load_json(&args.portfolio)?;
    let market: MarketSnapshot = load_json(&args.market)?;
    let execution: ExecutionState = match &args.execution {
        Some(path) => load_json(path)?,
        None => ExecutionState::default(),
    };

    let decision = engine.evaluate(&intent, &portfolio, &market, &execution)?;

    // Through a Value so keys come out sorted.
    let output = serde_json::to_value(&decision)?;
    if args.pretty {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", serde_json::to_string(&output)?);
    }

    if let Some(path) = &args.audit_log {
        let event = build_audit_event(
            &decision,
            &intent,
            &portfolio,
            &market,
            &execution,
            engine.policy_hash(),
            None,
        )?;
        let mut writer = JsonlWriter::open(path)?;
        writer.append_json(&event).context("audit write failed")?;
    }

    Ok(match decision.decision {
        Verdict::Allow | Verdict::Modify => 0,
        Verdict::Deny => 1,
    })
}

fn main() {
    let args = Args::parse();
    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(2);
        }
    }
}

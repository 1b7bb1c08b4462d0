//! Append-only JSONL audit log.
//!
//! Every evaluation is recorded as one self-contained line: the decision
//! plus the exact inputs that produced it, so any line can be replayed on
//! its own. Serialization is byte-stable: events are assembled as
//! `serde_json::Value` objects (BTreeMap-backed, so keys come out sorted)
//! and written compact, one line, trailing newline.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::decision::Decision;
use crate::engine::ENGINE_VERSION;
use crate::intent::OrderIntent;
use crate::state::{now_rfc3339, ExecutionState, MarketSnapshot, PortfolioState};

/// Append-only line writer shared by the audit and exec logs. Flushes per
/// line so a crash loses at most one truncated trailing line.
#[derive(Debug)]
pub struct JsonlWriter {
    file: File,
    path: PathBuf,
}

impl JsonlWriter {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_json(&mut self, value: &Value) -> std::io::Result<()> {
        let line = serde_json::to_string(value)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()
    }
}

/// Assemble one audit event. UUID and timestamp are the only
/// non-deterministic fields.
pub fn build_audit_event(
    decision: &Decision,
    intent: &OrderIntent,
    portfolio: &PortfolioState,
    market: &MarketSnapshot,
    execution: &ExecutionState,
    policy_hash: &str,
    run_id: Option<&str>,
) -> Result<Value> {
    let mut event = Map::new();
    event.insert("event_id".to_string(), Value::String(Uuid::new_v4().to_string()));
    event.insert("timestamp".to_string(), Value::String(now_rfc3339()));
    event.insert("engine_version".to_string(), Value::String(ENGINE_VERSION.to_string()));
    event.insert("policy_hash".to_string(), Value::String(policy_hash.to_string()));
    if let Some(run_id) = run_id {
        event.insert("run_id".to_string(), Value::String(run_id.to_string()));
    }
    event.insert("intent".to_string(), serde_json::to_value(intent)?);
    event.insert("portfolio_state".to_string(), serde_json::to_value(portfolio)?);
    event.insert("market_snapshot".to_string(), serde_json::to_value(market)?);
    event.insert("execution_state".to_string(), serde_json::to_value(execution)?);
    event.insert("decision".to_string(), serde_json::to_value(decision)?);
    Ok(Value::Object(event))
}

/// Read all events in file order. Blank lines are skipped; a truncated
/// trailing line (crash mid-write) is tolerated and dropped. Garbage
/// anywhere else is an error.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<Value>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("cannot open audit log {}", path.display()))?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("cannot read audit log {}", path.display()))?;

    let mut events = Vec::new();
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    for (idx, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(v) => events.push(v),
            Err(_) if Some(idx) == last => break,
            Err(e) => bail!("corrupt audit line {} in {}: {}", idx + 1, path.display(), e),
        }
    }
    Ok(events)
}

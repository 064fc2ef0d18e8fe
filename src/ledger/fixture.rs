//! In-memory ledger
//!
//! Canned RPC answers plus recorded per-contract event logs. Used by the
//! replay binary and the tests; supports injected failures so retry and
//! resubscription paths can be exercised deterministically.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EventSource, EventStream, LedgerRpc, RawEvent};
use crate::models::normalize_address;

const ANY_ARGS: &str = "*";

/// One canned answer, as stored in a `--calls` fixture file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CannedCall {
    pub to: String,
    pub method: String,
    /// Omitted args match any argument list
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    pub result: Value,
}

/// A transaction accepted by the fixture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentCommand {
    pub to: String,
    pub method: String,
    pub args: Vec<Value>,
    pub tx_hash: String,
}

#[derive(Default)]
pub struct FixtureLedger {
    responses: RwLock<HashMap<(String, String, String), Value>>,
    /// Remaining injected failures per (to, method)
    failures: Mutex<HashMap<(String, String), u32>>,
    call_log: Mutex<Vec<(String, String)>>,
    sent: Mutex<Vec<SentCommand>>,
    rejection: RwLock<Option<String>>,
    events: RwLock<HashMap<String, Vec<RawEvent>>>,
    /// Contract -> number of events delivered before the first subscription drops
    drop_after: Mutex<HashMap<String, usize>>,
    subscriptions: Mutex<Vec<(String, Option<u64>)>>,
}

impl FixtureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads canned answers from a JSON array of [`CannedCall`].
    pub fn load_calls(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read call fixtures at {}", path.display()))?;
        let calls: Vec<CannedCall> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse call fixtures at {}", path.display()))?;

        let ledger = Self::new();
        for call in calls {
            match call.args {
                Some(args) => ledger.respond(&call.to, &call.method, &args, call.result),
                None => ledger.respond_any(&call.to, &call.method, call.result),
            }
        }
        Ok(ledger)
    }

    /// Loads recorded events from a JSON-lines file (one [`RawEvent`] per line).
    pub fn load_events(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read events at {}", path.display()))?;

        let mut count = 0;
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let raw: RawEvent = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid event", path.display(), line_no + 1))?;
            self.push_event(raw);
            count += 1;
        }
        Ok(count)
    }

    pub fn respond(&self, to: &str, method: &str, args: &[Value], result: impl Into<Value>) {
        let args = Value::Array(args.to_vec()).to_string();
        self.responses
            .write()
            .insert((normalize_address(to), method.to_string(), args), result.into());
    }

    pub fn respond_any(&self, to: &str, method: &str, result: impl Into<Value>) {
        self.responses.write().insert(
            (normalize_address(to), method.to_string(), ANY_ARGS.to_string()),
            result.into(),
        );
    }

    /// The next `times` calls to `to.method` fail.
    pub fn fail_next(&self, to: &str, method: &str, times: u32) {
        self.failures
            .lock()
            .insert((normalize_address(to), method.to_string()), times);
    }

    /// Every subsequent `send` is refused with `reason`.
    pub fn reject_commands(&self, reason: &str) {
        *self.rejection.write() = Some(reason.to_string());
    }

    pub fn accept_commands(&self) {
        *self.rejection.write() = None;
    }

    pub fn call_count(&self, to: &str, method: &str) -> usize {
        let to = normalize_address(to);
        self.call_log
            .lock()
            .iter()
            .filter(|(t, m)| *t == to && m == method)
            .count()
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().clone()
    }

    pub fn push_event(&self, mut raw: RawEvent) {
        raw.address = normalize_address(&raw.address);
        self.events
            .write()
            .entry(raw.address.clone())
            .or_default()
            .push(raw);
    }

    /// The first subscription to `contract` errors out after `delivered` events.
    pub fn drop_connection_after(&self, contract: &str, delivered: usize) {
        self.drop_after
            .lock()
            .insert(normalize_address(contract), delivered);
    }

    /// Every `(contract, from_block)` subscription made so far.
    pub fn subscriptions(&self) -> Vec<(String, Option<u64>)> {
        self.subscriptions.lock().clone()
    }

    fn take_failure(&self, to: &str, method: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(&(to.to_string(), method.to_string())) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl LedgerRpc for FixtureLedger {
    async fn call(&self, to: &str, method: &str, args: &[Value]) -> Result<Value> {
        let to = normalize_address(to);
        self.call_log.lock().push((to.clone(), method.to_string()));

        if self.take_failure(&to, method) {
            return Err(anyhow!("injected failure for {}.{}()", to, method));
        }

        let responses = self.responses.read();
        let exact = (to.clone(), method.to_string(), Value::Array(args.to_vec()).to_string());
        let wildcard = (to.clone(), method.to_string(), ANY_ARGS.to_string());
        responses
            .get(&exact)
            .or_else(|| responses.get(&wildcard))
            .cloned()
            .ok_or_else(|| anyhow!("{}.{}() is not supported by this contract", to, method))
    }

    async fn send(&self, to: &str, method: &str, args: &[Value]) -> Result<String> {
        if let Some(reason) = self.rejection.read().clone() {
            return Err(anyhow!("transaction reverted: {}", reason));
        }

        let mut sent = self.sent.lock();
        let tx_hash = format!("0x{:064x}", sent.len() + 1);
        sent.push(SentCommand {
            to: normalize_address(to),
            method: method.to_string(),
            args: args.to_vec(),
            tx_hash: tx_hash.clone(),
        });
        Ok(tx_hash)
    }
}

#[async_trait]
impl EventSource for FixtureLedger {
    async fn subscribe(&self, contract: &str, from_block: Option<u64>) -> Result<EventStream> {
        let contract = normalize_address(contract);
        self.subscriptions.lock().push((contract.clone(), from_block));

        let events: Vec<RawEvent> = self
            .events
            .read()
            .get(&contract)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| from_block.map_or(true, |from| e.block_number >= from))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let cut = self.drop_after.lock().remove(&contract);
        let items: Vec<Result<RawEvent>> = match cut {
            Some(delivered) => events
                .into_iter()
                .take(delivered)
                .map(Ok)
                .chain(std::iter::once(Err(anyhow!(
                    "subscription to {} dropped",
                    contract
                ))))
                .collect(),
            None => events.into_iter().map(Ok).collect(),
        };

        Ok(stream::iter(items).boxed())
    }
}

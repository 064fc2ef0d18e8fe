//! Token Metadata Cache
//!
//! Resolves symbol/name/decimals for token addresses and memoizes them.
//!
//! Lookup order for each field:
//! 1. Memoized value for the token's handle
//! 2. On-ledger read (`decimals()`, `name()`, `symbol()`)
//! 3. Static fallback table keyed by (network, address)
//! 4. Empty value; never fatal, retried on the next cold miss
//!
//! Values are keyed by a [`TokenHandle`] rather than the raw address.
//! Evicting an address drops its handle and every value under it in one
//! write-locked step, and a lookup that completes after the eviction cannot
//! write back, so a re-added address always resolves afresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::MetadataError;
use crate::ledger::{parse_u64, LedgerRpc};
use crate::models::{normalize_address, Address, TokenMetadata, ETHER_TOKEN_FAKE_ADDRESS};

/// Identity of a resolved token contract inside one cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Decimals,
    Name,
    Symbol,
}

impl Field {
    fn method(self) -> &'static str {
        match self {
            Field::Decimals => "decimals",
            Field::Name => "name",
            Field::Symbol => "symbol",
        }
    }
}

// =============================================================================
// FALLBACK TABLE
// =============================================================================

/// Known tokens that do not conform to the ERC-20 metadata interface.
#[derive(Debug, Clone)]
pub struct FallbackTable {
    entries: HashMap<(String, Address), TokenMetadata>,
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self::empty().with_entry(
            "main",
            "0x89d24a6b4ccb1b6faa2625fe562bdd9a23260359",
            TokenMetadata {
                symbol: Some("DAI".into()),
                name: Some("Dai Stablecoin v1.0".into()),
                decimals: Some(18),
            },
        )
    }
}

impl FallbackTable {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, network: &str, address: &str, metadata: TokenMetadata) -> Self {
        self.entries
            .insert((network.to_string(), normalize_address(address)), metadata);
        self
    }

    pub fn get(&self, network: &str, address: &str) -> Option<&TokenMetadata> {
        self.entries
            .get(&(network.to_string(), normalize_address(address)))
    }
}

// =============================================================================
// CACHE
// =============================================================================

#[derive(Default)]
struct CacheInner {
    handles: HashMap<Address, TokenHandle>,
    next_handle: u64,
    decimals: HashMap<TokenHandle, u8>,
    names: HashMap<TokenHandle, String>,
    symbols: HashMap<TokenHandle, String>,
}

impl CacheInner {
    fn handle(&mut self, address: &str) -> TokenHandle {
        if let Some(handle) = self.handles.get(address) {
            return *handle;
        }
        self.next_handle += 1;
        let handle = TokenHandle(self.next_handle);
        self.handles.insert(address.to_string(), handle);

        if address == ETHER_TOKEN_FAKE_ADDRESS {
            self.decimals.insert(handle, 18);
            self.names.insert(handle, "Ether".into());
            self.symbols.insert(handle, "ETH".into());
        }
        handle
    }

    fn get(&self, handle: TokenHandle, field: Field) -> Option<String> {
        match field {
            Field::Decimals => self.decimals.get(&handle).map(|d| d.to_string()),
            Field::Name => self.names.get(&handle).cloned(),
            Field::Symbol => self.symbols.get(&handle).cloned(),
        }
    }

    fn insert(&mut self, handle: TokenHandle, field: Field, value: &str) {
        match field {
            Field::Decimals => {
                if let Ok(decimals) = value.parse() {
                    self.decimals.insert(handle, decimals);
                }
            }
            Field::Name => {
                self.names.insert(handle, value.to_string());
            }
            Field::Symbol => {
                self.symbols.insert(handle, value.to_string());
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetadataCacheStats {
    pub cached_tokens: usize,
    pub cache_hits: u64,
    pub ledger_reads: u64,
    pub failed_reads: u64,
}

/// Instance-scoped metadata cache; share it via `Arc`.
pub struct TokenMetadataCache {
    ledger: Arc<dyn LedgerRpc>,
    network: String,
    fallback: FallbackTable,
    inner: RwLock<CacheInner>,
    cache_hits: AtomicU64,
    ledger_reads: AtomicU64,
    failed_reads: AtomicU64,
}

impl TokenMetadataCache {
    pub fn new(ledger: Arc<dyn LedgerRpc>, network: impl Into<String>) -> Self {
        Self {
            ledger,
            network: network.into(),
            fallback: FallbackTable::default(),
            inner: RwLock::new(CacheInner::default()),
            cache_hits: AtomicU64::new(0),
            ledger_reads: AtomicU64::new(0),
            failed_reads: AtomicU64::new(0),
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackTable) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub async fn decimals(&self, address: &str) -> Option<u8> {
        self.lookup(address, Field::Decimals)
            .await
            .and_then(|d| d.parse().ok())
    }

    pub async fn name(&self, address: &str) -> Option<String> {
        self.lookup(address, Field::Name).await
    }

    pub async fn symbol(&self, address: &str) -> Option<String> {
        self.lookup(address, Field::Symbol).await
    }

    /// Resolves all three fields concurrently.
    pub async fn metadata(&self, address: &str) -> TokenMetadata {
        let (symbol, name, decimals) = tokio::join!(
            self.symbol(address),
            self.name(address),
            self.decimals(address)
        );
        TokenMetadata {
            symbol,
            name,
            decimals,
        }
    }

    /// Drops the handle and every cached field for `address` atomically.
    pub fn evict(&self, address: &str) -> bool {
        let address = normalize_address(address);
        let mut inner = self.inner.write();
        let Some(handle) = inner.handles.remove(&address) else {
            return false;
        };
        inner.decimals.remove(&handle);
        inner.names.remove(&handle);
        inner.symbols.remove(&handle);
        debug!("Evicted token metadata for {}", address);
        true
    }

    /// Current handle for `address`, allocating one if it has none.
    pub fn handle(&self, address: &str) -> TokenHandle {
        self.inner.write().handle(&normalize_address(address))
    }

    /// Handle `address` is cached under right now; `None` after eviction.
    pub fn current_handle(&self, address: &str) -> Option<TokenHandle> {
        self.inner.read().handles.get(&normalize_address(address)).copied()
    }

    /// True if anything is cached for `address`.
    pub fn contains(&self, address: &str) -> bool {
        let address = normalize_address(address);
        let inner = self.inner.read();
        match inner.handles.get(&address) {
            Some(handle) => {
                inner.decimals.contains_key(handle)
                    || inner.names.contains_key(handle)
                    || inner.symbols.contains_key(handle)
            }
            None => false,
        }
    }

    pub fn stats(&self) -> MetadataCacheStats {
        MetadataCacheStats {
            cached_tokens: self.inner.read().handles.len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            ledger_reads: self.ledger_reads.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
        }
    }

    async fn lookup(&self, address: &str, field: Field) -> Option<String> {
        let address = normalize_address(address);
        let handle = {
            let mut inner = self.inner.write();
            let handle = inner.handle(&address);
            if let Some(value) = inner.get(handle, field) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
            handle
        };

        let resolved = match self.read_from_ledger(&address, field).await {
            Ok(Some(value)) => Some(value),
            Ok(None) => self.fallback_value(&address, field),
            Err(e) => {
                self.failed_reads.fetch_add(1, Ordering::Relaxed);
                debug!("{}", e);
                self.fallback_value(&address, field)
            }
        };

        match &resolved {
            Some(value) => {
                let mut inner = self.inner.write();
                // Evicted (or evicted and re-added) while we were reading
                if inner.handles.get(&address) == Some(&handle) {
                    inner.insert(handle, field, value);
                }
            }
            None => warn!(
                "No {} available for token {} on {}",
                field.method(),
                address,
                self.network
            ),
        }
        resolved
    }

    async fn read_from_ledger(
        &self,
        address: &str,
        field: Field,
    ) -> Result<Option<String>, MetadataError> {
        self.ledger_reads.fetch_add(1, Ordering::Relaxed);
        let method = field.method();
        let value = self
            .ledger
            .call(address, method, &[])
            .await
            .map_err(|cause| MetadataError::Read {
                token: address.to_string(),
                method,
                cause,
            })?;

        match field {
            Field::Decimals => match parse_u64(&value) {
                Some(d) if d <= u8::MAX as u64 => Ok(Some(d.to_string())),
                _ => Err(MetadataError::Malformed {
                    token: address.to_string(),
                    method,
                    value: value.to_string(),
                }),
            },
            Field::Name | Field::Symbol => Ok(decode_text(&value)),
        }
    }

    fn fallback_value(&self, address: &str, field: Field) -> Option<String> {
        let entry = self.fallback.get(&self.network, address)?;
        match field {
            Field::Decimals => entry.decimals.map(|d| d.to_string()),
            Field::Name => entry.name.clone(),
            Field::Symbol => entry.symbol.clone(),
        }
    }
}

/// Plain strings pass through; `bytes32` hex (DS-Token style) is decoded to UTF-8.
fn decode_text(value: &Value) -> Option<String> {
    let text = value.as_str()?.trim();
    let decoded = match text.strip_prefix("0x") {
        Some(digits) if digits.len() == 64 => hex::decode(digits)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(|s| s.trim_end_matches('\0').to_string()),
        _ => Some(text.to_string()),
    };
    decoded.filter(|s| !s.is_empty())
}

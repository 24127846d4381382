#![forbid(unsafe_code)]

//! Trace cache: reuse of a traced graph across calls with the same callable
//! identity and abstract input signature.
//!
//! Keys hash the callable's identity (not its structure), the input tree
//! definition, every input leaf's abstract value including its weak-type
//! flag, and any caller-supplied discriminators (for example the static
//! options of a construct). The cache is an ordinary value: callers inject
//! it where tracing happens and may clear it at any time.

use fj_core::{AbstractValue, TreeDef};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyInput<'a> {
    pub callable_id: u64,
    pub in_tree: &'a TreeDef,
    pub in_avals: &'a [AbstractValue],
    pub extra: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub digest_hex: String,
}

impl CacheKey {
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.namespace, self.digest_hex)
    }
}

#[must_use]
pub fn build_cache_key(input: &CacheKeyInput<'_>) -> CacheKey {
    let payload = canonical_payload(input);
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();

    CacheKey {
        namespace: "fjt",
        digest_hex: bytes_to_hex(&digest),
    }
}

fn canonical_payload(input: &CacheKeyInput<'_>) -> String {
    let avals = input
        .in_avals
        .iter()
        .map(|aval| {
            if aval.weak_type {
                format!("{aval}~weak")
            } else {
                aval.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "callable={}|tree={}|avals={}|extra={}",
        input.callable_id,
        input.in_tree,
        avals,
        input.extra.join(";"),
    )
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{:02x}", byte));
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Clearable map from trace signature to traced artifact.
#[derive(Debug)]
pub struct TraceCache<T> {
    entries: HashMap<CacheKey, T>,
    hits: u64,
    misses: u64,
}

impl<T> Default for TraceCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TraceCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up `key`, counting the probe as a hit or a miss.
    pub fn get(&mut self, key: &CacheKey) -> Option<&T> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                trace!(key = %key, "trace cache hit");
                Some(entry)
            }
            None => {
                self.misses += 1;
                trace!(key = %key, "trace cache miss");
                None
            }
        }
    }

    pub fn insert(&mut self, key: CacheKey, value: T) {
        self.entries.insert(key, value);
    }

    /// Drop a single entry, e.g. one whose captured values went stale.
    pub fn remove(&mut self, key: &CacheKey) -> Option<T> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        debug!(entries = self.entries.len(), "clearing trace cache");
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}

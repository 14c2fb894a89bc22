//! Table-access observability
//!
//! An optional per-State filter on the table get/set path. Each access
//! renders to a structured entry `(timestamp, op, key type, key repr,
//! value type, value repr)`; predicates decide whether it is kept:
//! include/exclude glob patterns over keys, values, ops, and types, an
//! integer range for keys or values, and a dedup mode that hashes the
//! rendered entry and suppresses repeats through a bounded set with
//! oldest-first eviction.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use glob::Pattern;
use rustc_hash::{FxHashSet, FxHasher};

/// Bounded dedup-set capacity
pub const DEDUP_CAPACITY: usize = 1024;

/// Which table operation produced an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    Get,
    Set,
}

impl AccessOp {
    /// Name used by glob predicates
    pub fn name(self) -> &'static str {
        match self {
            AccessOp::Get => "get",
            AccessOp::Set => "set",
        }
    }
}

/// One logged access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    /// Monotonic entry counter standing in for wall time
    pub timestamp: u64,
    pub op: AccessOp,
    pub key_type: String,
    pub key_repr: String,
    pub value_type: String,
    pub value_repr: String,
}

impl AccessEntry {
    fn dedup_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.op.name().hash(&mut hasher);
        self.key_type.hash(&mut hasher);
        self.key_repr.hash(&mut hasher);
        self.value_type.hash(&mut hasher);
        self.value_repr.hash(&mut hasher);
        hasher.finish()
    }
}

/// Inclusive integer range predicate
#[derive(Debug, Clone, Copy)]
pub struct IntRange {
    pub min: i64,
    pub max: i64,
}

impl IntRange {
    fn contains(&self, v: i64) -> bool {
        (self.min..=self.max).contains(&v)
    }
}

/// Filter predicates; empty include lists accept everything
#[derive(Debug, Default)]
pub struct FilterConfig {
    pub include_keys: Vec<Pattern>,
    pub exclude_keys: Vec<Pattern>,
    pub include_values: Vec<Pattern>,
    pub exclude_values: Vec<Pattern>,
    pub include_ops: Vec<Pattern>,
    pub exclude_ops: Vec<Pattern>,
    pub include_key_types: Vec<Pattern>,
    pub exclude_key_types: Vec<Pattern>,
    pub include_value_types: Vec<Pattern>,
    pub exclude_value_types: Vec<Pattern>,
    /// Keep only accesses whose integer key falls in the range
    pub key_range: Option<IntRange>,
    /// Keep only accesses whose integer value falls in the range
    pub value_range: Option<IntRange>,
    /// Suppress repeated identical entries
    pub dedup: bool,
}

fn passes(text: &str, include: &[Pattern], exclude: &[Pattern]) -> bool {
    if !include.is_empty() && !include.iter().any(|p| p.matches(text)) {
        return false;
    }
    !exclude.iter().any(|p| p.matches(text))
}

/// Per-State access filter and log sink
#[derive(Debug, Default)]
pub struct TableAccessFilter {
    pub config: FilterConfig,
    entries: Vec<AccessEntry>,
    next_timestamp: u64,
    dedup_set: FxHashSet<u64>,
    dedup_order: VecDeque<u64>,
}

impl TableAccessFilter {
    pub fn new(config: FilterConfig) -> Self {
        TableAccessFilter {
            config,
            ..TableAccessFilter::default()
        }
    }

    /// Record one access. Returns whether the entry survived the
    /// predicates and was logged.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        op: AccessOp,
        key_type: &str,
        key_repr: &str,
        value_type: &str,
        value_repr: &str,
        key_int: Option<i64>,
        value_int: Option<i64>,
    ) -> bool {
        if !passes(op.name(), &self.config.include_ops, &self.config.exclude_ops)
            || !passes(key_repr, &self.config.include_keys, &self.config.exclude_keys)
            || !passes(
                value_repr,
                &self.config.include_values,
                &self.config.exclude_values,
            )
            || !passes(
                key_type,
                &self.config.include_key_types,
                &self.config.exclude_key_types,
            )
            || !passes(
                value_type,
                &self.config.include_value_types,
                &self.config.exclude_value_types,
            )
        {
            return false;
        }
        if let Some(range) = self.config.key_range {
            match key_int {
                Some(k) if range.contains(k) => {}
                _ => return false,
            }
        }
        if let Some(range) = self.config.value_range {
            match value_int {
                Some(v) if range.contains(v) => {}
                _ => return false,
            }
        }

        let entry = AccessEntry {
            timestamp: self.next_timestamp,
            op,
            key_type: key_type.to_string(),
            key_repr: key_repr.to_string(),
            value_type: value_type.to_string(),
            value_repr: value_repr.to_string(),
        };
        self.next_timestamp += 1;

        if self.config.dedup {
            let hash = entry.dedup_hash();
            if self.dedup_set.contains(&hash) {
                return false;
            }
            if self.dedup_order.len() >= DEDUP_CAPACITY {
                // oldest-first eviction keeps the set bounded
                if let Some(evicted) = self.dedup_order.pop_front() {
                    self.dedup_set.remove(&evicted);
                }
            }
            self.dedup_set.insert(hash);
            self.dedup_order.push_back(hash);
        }

        self.entries.push(entry);
        true
    }

    /// Logged entries in arrival order
    pub fn entries(&self) -> &[AccessEntry] {
        &self.entries
    }

    /// Drop the log but keep the predicates and dedup memory
    pub fn clear_entries(&mut self) {
        self.entries.clear();
    }
}

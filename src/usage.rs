//! Usage ledger and cost estimation
//!
//! Every live completion appends one [`UsageRecord`]; records are never
//! mutated. Cost is estimated from per-1K-token prices.

use crate::types::{Usage, UsageRecord};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::RwLock;

/// Per-1K-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        // gpt-4o-mini list price
        Self {
            prompt_per_1k: 0.000_15,
            completion_per_1k: 0.000_6,
        }
    }
}

impl Pricing {
    /// Prices in currency units per 1,000 tokens
    pub fn new(prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        Self {
            prompt_per_1k,
            completion_per_1k,
        }
    }

    pub fn free() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn estimate_cost(&self, usage: &Usage) -> f64 {
        (usage.prompt_tokens as f64 / 1000.0) * self.prompt_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * self.completion_per_1k
    }

    pub fn record(&self, usage: &Usage, timestamp: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            timestamp,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            estimated_cost_usd: self.estimate_cost(usage),
        }
    }
}

/// Append-only sink for usage records.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<()>;

    async fn records(&self) -> Result<Vec<UsageRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryUsageLedger {
    records: RwLock<Vec<UsageRecord>>,
}

impl MemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_cost(&self) -> f64 {
        self.records
            .read()
            .map(|r| r.iter().map(|rec| rec.estimated_cost_usd).sum())
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        self.records
            .write()
            .map_err(|_| Error::other("usage ledger lock poisoned"))?
            .push(record);
        Ok(())
    }

    async fn records(&self) -> Result<Vec<UsageRecord>> {
        Ok(self
            .records
            .read()
            .map_err(|_| Error::other("usage ledger lock poisoned"))?
            .clone())
    }
}

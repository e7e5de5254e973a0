//! Seams for the three external collaborators.
//!
//! The engine consumes these; it never implements market mechanics itself.
//! `sim` provides an in-process implementation for paper trading and tests.

use anyhow::Result;
use async_trait::async_trait;

/// Account-reported holdings for one instrument, both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionSnapshot {
    pub long_shares: u64,
    pub long_avg_cost: f64,
    pub short_shares: u64,
    pub short_avg_cost: f64,
}

impl PositionSnapshot {
    pub fn is_flat(&self) -> bool {
        self.long_shares == 0 && self.short_shares == 0
    }

    /// Both sides nonzero at once is a reportable anomaly, never silently fixed.
    pub fn dual_exposure(&self) -> bool {
        self.long_shares > 0 && self.short_shares > 0
    }
}

#[async_trait]
pub trait MarketData {
    async fn symbols(&self) -> Result<Vec<String>>;
    async fn ask_price(&self, symbol: &str) -> Result<f64>;
    async fn bid_price(&self, symbol: &str) -> Result<f64>;
    async fn has_authoritative_access(&self) -> Result<bool>;
    /// Authoritative volatility; only meaningful once access is granted.
    async fn volatility(&self, symbol: &str) -> Result<f64>;
    /// Authoritative trend-up probability; only meaningful once access is granted.
    async fn forecast(&self, symbol: &str) -> Result<f64>;
}

#[async_trait]
pub trait Account {
    async fn cash(&self) -> Result<f64>;
    async fn position(&self, symbol: &str) -> Result<PositionSnapshot>;
    /// Capacity cap; fetched once per instrument, immutable for its lifetime.
    async fn max_shares(&self, symbol: &str) -> Result<u64>;
}

/// Order execution. Each call returns the realized price per share, or `0.0`
/// as a failure sentinel meaning the order did not execute at all.
#[async_trait]
pub trait OrderExecutor {
    async fn buy(&self, symbol: &str, shares: u64) -> Result<f64>;
    async fn buy_short(&self, symbol: &str, shares: u64) -> Result<f64>;
    async fn sell(&self, symbol: &str, shares: u64) -> Result<f64>;
    /// Cover an existing short.
    async fn sell_short(&self, symbol: &str, shares: u64) -> Result<f64>;
}

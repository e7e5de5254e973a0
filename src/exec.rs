//! Order submission and realized-profit bookkeeping.
//!
//! The external executor returns the realized price per share, or 0.0 as a
//! failure sentinel. A failed order is a no-op for this tick; the policy
//! re-evaluates from scratch next tick rather than retrying. When the
//! realized price disagrees with the decision-time price, the discrepancy is
//! logged but the *expected* price is booked — the provider has a known
//! off-by-one quoting quirk around short positions.

use std::sync::Arc;

use anyhow::Result;

use crate::logging::{json_log, obj, v_num, v_str, warn_log};
use crate::policy::{OrderIntent, Side};
use crate::provider::OrderExecutor;

pub struct ExecutionAdapter {
    executor: Arc<dyn OrderExecutor + Send + Sync>,
    commission: f64,
    total_realized_profit: f64,
}

impl ExecutionAdapter {
    pub fn new(executor: Arc<dyn OrderExecutor + Send + Sync>, commission: f64) -> Self {
        Self {
            executor,
            commission,
            total_realized_profit: 0.0,
        }
    }

    /// Running profit across all closes, net of commission on every open and
    /// close.
    pub fn total_realized_profit(&self) -> f64 {
        self.total_realized_profit
    }

    fn booked_price(&self, intent: &OrderIntent, realized: f64) -> f64 {
        if (realized - intent.expected_price).abs() > 1e-9 {
            warn_log(
                "exec",
                obj(&[
                    ("anomaly", v_str("fill_price_mismatch")),
                    ("symbol", v_str(&intent.symbol)),
                    ("side", v_str(intent.side.as_str())),
                    ("expected", v_num(intent.expected_price)),
                    ("realized", v_num(realized)),
                ]),
            );
        }
        intent.expected_price
    }

    /// Open a position (buy long / open short). Returns the booked price, or
    /// `None` when the order did not execute.
    pub async fn open(&mut self, intent: &OrderIntent) -> Result<Option<f64>> {
        let realized = match intent.side {
            Side::Long => self.executor.buy(&intent.symbol, intent.shares).await?,
            Side::Short => self.executor.buy_short(&intent.symbol, intent.shares).await?,
        };
        if realized == 0.0 {
            json_log(
                "exec",
                obj(&[
                    ("status", v_str("rejected")),
                    ("op", v_str("open")),
                    ("symbol", v_str(&intent.symbol)),
                    ("side", v_str(intent.side.as_str())),
                    ("shares", v_num(intent.shares as f64)),
                ]),
            );
            return Ok(None);
        }
        let booked = self.booked_price(intent, realized);
        self.total_realized_profit -= self.commission;
        json_log(
            "exec",
            obj(&[
                ("status", v_str("filled")),
                ("op", v_str("open")),
                ("symbol", v_str(&intent.symbol)),
                ("side", v_str(intent.side.as_str())),
                ("shares", v_num(intent.shares as f64)),
                ("price", v_num(booked)),
            ]),
        );
        Ok(Some(booked))
    }

    /// Close a position (sell long / cover short). `avg_cost` comes from the
    /// account snapshot taken this tick. Returns the booked price, or `None`
    /// when the order did not execute.
    pub async fn close(&mut self, intent: &OrderIntent, avg_cost: f64) -> Result<Option<f64>> {
        let realized = match intent.side {
            Side::Long => self.executor.sell(&intent.symbol, intent.shares).await?,
            Side::Short => self.executor.sell_short(&intent.symbol, intent.shares).await?,
        };
        if realized == 0.0 {
            json_log(
                "exec",
                obj(&[
                    ("status", v_str("rejected")),
                    ("op", v_str("close")),
                    ("symbol", v_str(&intent.symbol)),
                    ("side", v_str(intent.side.as_str())),
                    ("shares", v_num(intent.shares as f64)),
                ]),
            );
            return Ok(None);
        }
        let booked = self.booked_price(intent, realized);
        let profit = match intent.side {
            Side::Long => (booked - avg_cost) * intent.shares as f64,
            Side::Short => (avg_cost - booked) * intent.shares as f64,
        };
        self.total_realized_profit += profit - self.commission;
        json_log(
            "exec",
            obj(&[
                ("status", v_str("filled")),
                ("op", v_str("close")),
                ("symbol", v_str(&intent.symbol)),
                ("side", v_str(intent.side.as_str())),
                ("shares", v_num(intent.shares as f64)),
                ("price", v_num(booked)),
                ("profit", v_num(profit)),
                ("total_realized", v_num(self.total_realized_profit)),
            ]),
        );
        Ok(Some(booked))
    }
}

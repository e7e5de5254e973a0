//! In-process simulated market.
//!
//! Implements all three provider seams against a hidden true state: each
//! instrument carries a true trend probability and volatility, and the whole
//! market shares a fixed-length cycle at whose boundary every probability has
//! a 45% chance of inverting. The engine under test never sees any of this
//! directly; it only gets quotes and fills.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::provider::{Account, MarketData, OrderExecutor, PositionSnapshot};

const INVERSION_CHANCE: f64 = 0.45;

#[derive(Debug, Clone)]
struct SimInstrument {
    symbol: String,
    /// Hidden true trend-up probability.
    prob: f64,
    /// Hidden true per-tick move magnitude cap.
    vol: f64,
    mid: f64,
    spread: f64,
    max_shares: u64,
    long: u64,
    long_avg: f64,
    short: u64,
    short_avg: f64,
}

impl SimInstrument {
    fn ask(&self) -> f64 {
        self.mid * (1.0 + self.spread / 2.0)
    }

    fn bid(&self) -> f64 {
        self.mid * (1.0 - self.spread / 2.0)
    }
}

/// Fill counters for test assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillCounts {
    pub buys: u64,
    pub shorts: u64,
    pub sells: u64,
    pub covers: u64,
}

struct SimState {
    rng: StdRng,
    cash: f64,
    commission: f64,
    cycle_length: u64,
    cycle_tick: u64,
    authoritative: bool,
    instruments: Vec<SimInstrument>,
    fills: FillCounts,
}

impl SimState {
    fn find(&self, symbol: &str) -> Option<&SimInstrument> {
        self.instruments.iter().find(|i| i.symbol == symbol)
    }

    fn find_mut(&mut self, symbol: &str) -> Option<&mut SimInstrument> {
        self.instruments.iter_mut().find(|i| i.symbol == symbol)
    }
}

pub struct SimMarket {
    inner: Mutex<SimState>,
}

impl SimMarket {
    pub fn new(cfg: &Config) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.sim_seed);
        let instruments = (0..cfg.sim_symbols)
            .map(|i| {
                let mid = rng.gen_range(20.0..2_000.0);
                SimInstrument {
                    symbol: format!("SIM{:02}", i),
                    prob: rng.gen_range(0.35..0.65),
                    vol: rng.gen_range(0.004..0.02),
                    mid,
                    spread: rng.gen_range(0.002..0.02),
                    max_shares: rng.gen_range(1_000_000..50_000_000),
                    long: 0,
                    long_avg: 0.0,
                    short: 0,
                    short_avg: 0.0,
                }
            })
            .collect();
        Self {
            inner: Mutex::new(SimState {
                rng,
                cash: cfg.sim_cash,
                commission: cfg.commission,
                cycle_length: cfg.cycle_length,
                cycle_tick: 0,
                authoritative: cfg.sim_authoritative,
                instruments,
                fills: FillCounts::default(),
            }),
        }
    }

    /// Advance the hidden market by one tick.
    pub fn step(&self) {
        let mut state = self.inner.lock().unwrap();
        state.cycle_tick = (state.cycle_tick + 1) % state.cycle_length;
        let at_boundary = state.cycle_tick == 0;
        let SimState { rng, instruments, .. } = &mut *state;
        for inst in instruments.iter_mut() {
            if at_boundary && rng.gen::<f64>() < INVERSION_CHANCE {
                inst.prob = 1.0 - inst.prob;
            }
            let up = rng.gen::<f64>() < inst.prob;
            let mag = inst.vol * rng.gen::<f64>();
            if up {
                inst.mid *= 1.0 + mag;
            } else {
                inst.mid /= 1.0 + mag;
            }
        }
    }

    pub fn fill_counts(&self) -> FillCounts {
        self.inner.lock().unwrap().fills
    }

    pub fn grant_authoritative(&self) {
        self.inner.lock().unwrap().authoritative = true;
    }

    /// Place a position directly, bypassing execution (test setup).
    pub fn set_position(&self, symbol: &str, long: u64, long_avg: f64, short: u64, short_avg: f64) {
        let mut state = self.inner.lock().unwrap();
        if let Some(inst) = state.find_mut(symbol) {
            inst.long = long;
            inst.long_avg = long_avg;
            inst.short = short;
            inst.short_avg = short_avg;
        }
    }

    pub fn quote(&self, symbol: &str) -> Option<(f64, f64)> {
        let state = self.inner.lock().unwrap();
        state.find(symbol).map(|i| (i.bid(), i.ask()))
    }
}

#[async_trait]
impl MarketData for SimMarket {
    async fn symbols(&self) -> Result<Vec<String>> {
        let state = self.inner.lock().unwrap();
        Ok(state.instruments.iter().map(|i| i.symbol.clone()).collect())
    }

    async fn ask_price(&self, symbol: &str) -> Result<f64> {
        let state = self.inner.lock().unwrap();
        Ok(state.find(symbol).map(|i| i.ask()).unwrap_or(0.0))
    }

    async fn bid_price(&self, symbol: &str) -> Result<f64> {
        let state = self.inner.lock().unwrap();
        Ok(state.find(symbol).map(|i| i.bid()).unwrap_or(0.0))
    }

    async fn has_authoritative_access(&self) -> Result<bool> {
        Ok(self.inner.lock().unwrap().authoritative)
    }

    async fn volatility(&self, symbol: &str) -> Result<f64> {
        let state = self.inner.lock().unwrap();
        Ok(state.find(symbol).map(|i| i.vol).unwrap_or(0.0))
    }

    async fn forecast(&self, symbol: &str) -> Result<f64> {
        let state = self.inner.lock().unwrap();
        Ok(state.find(symbol).map(|i| i.prob).unwrap_or(0.5))
    }
}

#[async_trait]
impl Account for SimMarket {
    async fn cash(&self) -> Result<f64> {
        Ok(self.inner.lock().unwrap().cash)
    }

    async fn position(&self, symbol: &str) -> Result<PositionSnapshot> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .find(symbol)
            .map(|i| PositionSnapshot {
                long_shares: i.long,
                long_avg_cost: i.long_avg,
                short_shares: i.short,
                short_avg_cost: i.short_avg,
            })
            .unwrap_or_default())
    }

    async fn max_shares(&self, symbol: &str) -> Result<u64> {
        let state = self.inner.lock().unwrap();
        Ok(state.find(symbol).map(|i| i.max_shares).unwrap_or(0))
    }
}

#[async_trait]
impl OrderExecutor for SimMarket {
    async fn buy(&self, symbol: &str, shares: u64) -> Result<f64> {
        let mut state = self.inner.lock().unwrap();
        let commission = state.commission;
        let cash = state.cash;
        let Some(inst) = state.find_mut(symbol) else { return Ok(0.0) };
        let price = inst.ask();
        let cost = shares as f64 * price + commission;
        if shares == 0 || cost > cash || inst.long + shares > inst.max_shares {
            return Ok(0.0);
        }
        let total = inst.long + shares;
        inst.long_avg =
            (inst.long_avg * inst.long as f64 + price * shares as f64) / total as f64;
        inst.long = total;
        state.cash -= cost;
        state.fills.buys += 1;
        Ok(price)
    }

    async fn buy_short(&self, symbol: &str, shares: u64) -> Result<f64> {
        let mut state = self.inner.lock().unwrap();
        let commission = state.commission;
        let cash = state.cash;
        let Some(inst) = state.find_mut(symbol) else { return Ok(0.0) };
        let price = inst.bid();
        let cost = shares as f64 * price + commission;
        if shares == 0 || cost > cash || inst.short + shares > inst.max_shares {
            return Ok(0.0);
        }
        let total = inst.short + shares;
        inst.short_avg =
            (inst.short_avg * inst.short as f64 + price * shares as f64) / total as f64;
        inst.short = total;
        state.cash -= cost;
        state.fills.shorts += 1;
        Ok(price)
    }

    async fn sell(&self, symbol: &str, shares: u64) -> Result<f64> {
        let mut state = self.inner.lock().unwrap();
        let commission = state.commission;
        let Some(inst) = state.find_mut(symbol) else { return Ok(0.0) };
        if shares == 0 || shares > inst.long {
            return Ok(0.0);
        }
        let price = inst.bid();
        inst.long -= shares;
        if inst.long == 0 {
            inst.long_avg = 0.0;
        }
        state.cash += shares as f64 * price - commission;
        state.fills.sells += 1;
        Ok(price)
    }

    async fn sell_short(&self, symbol: &str, shares: u64) -> Result<f64> {
        let mut state = self.inner.lock().unwrap();
        let commission = state.commission;
        let Some(inst) = state.find_mut(symbol) else { return Ok(0.0) };
        if shares == 0 || shares > inst.short {
            return Ok(0.0);
        }
        let price = inst.ask();
        let avg = inst.short_avg;
        inst.short -= shares;
        if inst.short == 0 {
            inst.short_avg = 0.0;
        }
        // Short cover returns the posted margin plus the short's profit.
        state.cash += shares as f64 * (2.0 * avg - price) - commission;
        state.fills.covers += 1;
        Ok(price)
    }
}

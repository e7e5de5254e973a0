//! Per-instrument rolling price history and derived rolling statistics.

use std::collections::{HashMap, VecDeque};

use crate::logging::{obj, v_num, v_str, warn_log};

/// One priced instrument. History is newest-first and capped at `h_max`.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub symbol: String,
    pub ask_price: f64,
    pub bid_price: f64,
    /// Capacity cap, fetched once at session start.
    pub max_shares: u64,
    history: VecDeque<f64>,
    h_max: usize,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, max_shares: u64, h_max: usize) -> Self {
        Self {
            symbol: symbol.into(),
            ask_price: 0.0,
            bid_price: 0.0,
            max_shares,
            history: VecDeque::with_capacity(h_max),
            h_max,
        }
    }

    /// Record the latest quote. A crossed quote (bid above ask) violates the
    /// data model and is reported, not repaired.
    pub fn set_quote(&mut self, bid: f64, ask: f64) {
        if bid > ask {
            warn_log(
                "ledger",
                obj(&[
                    ("anomaly", v_str("crossed_quote")),
                    ("symbol", v_str(&self.symbol)),
                    ("bid", v_num(bid)),
                    ("ask", v_num(ask)),
                ]),
            );
        }
        self.bid_price = bid;
        self.ask_price = ask;
    }

    /// Append a mid price to the front of the history, splicing off anything
    /// beyond the retention cap.
    pub fn observe(&mut self, mid: f64) {
        self.history.push_front(mid);
        self.history.truncate(self.h_max);
    }

    pub fn mid_price(&self) -> f64 {
        (self.ask_price + self.bid_price) / 2.0
    }

    /// Spread as a fraction of the bid.
    pub fn spread_pct(&self) -> f64 {
        if self.bid_price > 0.0 {
            (self.ask_price - self.bid_price) / self.bid_price
        } else {
            0.0
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Price `ticks_back` observations ago (0 = most recent).
    pub fn price_at(&self, ticks_back: usize) -> Option<f64> {
        self.history.get(ticks_back).copied()
    }

    /// Worst single-tick relative move over the entire retained history.
    ///
    /// Deliberately a max, not a variance: it serves as a conservative cap on
    /// position sizing when no authoritative volatility exists.
    pub fn derived_volatility(&self) -> f64 {
        let mut worst = 0.0_f64;
        for i in 0..self.history.len().saturating_sub(1) {
            let newer = self.history[i];
            let older = self.history[i + 1];
            if older > 0.0 {
                let chg = ((newer - older) / older).abs();
                if chg > worst {
                    worst = chg;
                }
            }
        }
        worst
    }

    /// Up-tick ratio over the most recent `window` observations:
    /// (consecutive-pair increases) / (consecutive pairs). Returns 0.5 when
    /// there are no pairs to count.
    pub fn uptick_ratio(&self, window: usize) -> f64 {
        let n = window.min(self.history.len());
        if n < 2 {
            return 0.5;
        }
        let pairs = n - 1;
        let mut ups = 0usize;
        for i in 0..pairs {
            if self.history[i] > self.history[i + 1] {
                ups += 1;
            }
        }
        ups as f64 / pairs as f64
    }

    /// Number of consecutive pairs available within `window` observations.
    pub fn pairs_in_window(&self, window: usize) -> usize {
        window.min(self.history.len()).saturating_sub(1)
    }
}

/// The instrument table, keyed by symbol, iterated in provider order.
pub struct Ledger {
    order: Vec<String>,
    instruments: HashMap<String, Instrument>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            instruments: HashMap::new(),
        }
    }

    pub fn insert(&mut self, instrument: Instrument) {
        if !self.instruments.contains_key(&instrument.symbol) {
            self.order.push(instrument.symbol.clone());
        }
        self.instruments.insert(instrument.symbol.clone(), instrument);
    }

    pub fn get(&self, symbol: &str) -> Option<&Instrument> {
        self.instruments.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Instrument> {
        self.instruments.get_mut(symbol)
    }

    pub fn symbols(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.order.iter().filter_map(|s| self.instruments.get(s))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument_with_history(prices_oldest_first: &[f64]) -> Instrument {
        let mut inst = Instrument::new("TST", 1_000, 151);
        for &p in prices_oldest_first {
            inst.observe(p);
        }
        inst
    }

    #[test]
    fn history_is_newest_first_and_capped() {
        let mut inst = Instrument::new("TST", 1_000, 3);
        for p in [1.0, 2.0, 3.0, 4.0] {
            inst.observe(p);
        }
        assert_eq!(inst.history_len(), 3);
        assert_eq!(inst.price_at(0), Some(4.0));
        assert_eq!(inst.price_at(1), Some(3.0));
        assert_eq!(inst.price_at(2), Some(2.0));
        assert_eq!(inst.price_at(3), None);
    }

    #[test]
    fn uptick_ratio_matches_hand_count() {
        // 10 -> 10.5 -> 11 -> 10.8 -> 11.2: three of four pairs rise.
        let inst = instrument_with_history(&[10.0, 10.5, 11.0, 10.8, 11.2]);
        assert!((inst.uptick_ratio(151) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn uptick_ratio_respects_window() {
        // Only the newest 3 observations: 11 -> 10.8 -> 11.2, one rise of two.
        let inst = instrument_with_history(&[10.0, 10.5, 11.0, 10.8, 11.2]);
        assert!((inst.uptick_ratio(3) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn uptick_ratio_neutral_without_pairs() {
        let inst = instrument_with_history(&[10.0]);
        assert_eq!(inst.uptick_ratio(151), 0.5);
        let empty = Instrument::new("TST", 1, 151);
        assert_eq!(empty.uptick_ratio(151), 0.5);
    }

    #[test]
    fn volatility_is_worst_single_tick_move() {
        // Moves: +5%, then -10%, then +2.2...%; worst is 10%.
        let inst = instrument_with_history(&[100.0, 105.0, 94.5, 96.6]);
        assert!((inst.derived_volatility() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn volatility_zero_with_short_history() {
        let inst = instrument_with_history(&[100.0]);
        assert_eq!(inst.derived_volatility(), 0.0);
    }

    #[test]
    fn spread_pct_from_quotes() {
        let mut inst = Instrument::new("TST", 1, 151);
        inst.set_quote(100.0, 102.0);
        assert!((inst.spread_pct() - 0.02).abs() < 1e-12);
        assert!((inst.mid_price() - 101.0).abs() < 1e-12);
    }

    #[test]
    fn ledger_preserves_insertion_order() {
        let mut ledger = Ledger::new();
        for sym in ["C", "A", "B"] {
            ledger.insert(Instrument::new(sym, 1, 151));
        }
        let order: Vec<_> = ledger.iter().map(|i| i.symbol.as_str()).collect();
        assert_eq!(order, vec!["C", "A", "B"]);
        assert_eq!(ledger.len(), 3);
    }
}

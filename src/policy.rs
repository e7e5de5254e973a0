//! Buy/sell/position-sizing policy.
//!
//! Per tick the engine runs the sell pass first, then the buy pass, and a
//! tick that produced any sale skips buying entirely so cash and holdings
//! refresh before new capital is committed. Positions move only
//! FLAT -> LONG, FLAT -> SHORT, LONG -> FLAT, SHORT -> FLAT; a reversal
//! always liquidates first.

use std::collections::HashMap;

use crate::config::Config;
use crate::estimator::Estimate;
use crate::ledger::Instrument;
use crate::logging::{json_log, obj, v_num, v_str, warn_log};
use crate::provider::PositionSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

/// Ephemeral order decision, consumed by the execution adapter.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub shares: u64,
    pub expected_price: f64,
}

/// Everything the policy needs to know about one instrument this tick.
pub struct InstrumentView<'a> {
    pub instrument: &'a Instrument,
    pub estimate: Estimate,
    pub position: PositionSnapshot,
    pub ticks_since_inversion: u64,
}

/// Estimated ticks until the position's expected return has compounded past
/// the bid/ask spread.
pub fn time_to_cover_spread(ask: f64, bid: f64, abs_return: f64) -> f64 {
    if bid <= 0.0 || ask < bid || abs_return <= 0.0 {
        return f64::INFINITY;
    }
    (ask / bid).ln() / (1.0 + abs_return).ln()
}

struct Candidate<'a, 'b> {
    view: &'b InstrumentView<'a>,
    side: Side,
    abs_return: f64,
    ttcs: f64,
}

pub struct PolicyEngine {
    cfg: Config,
    ticks_held: HashMap<String, u64>,
    last_sign: HashMap<String, i8>,
}

impl PolicyEngine {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            ticks_held: HashMap::new(),
            last_sign: HashMap::new(),
        }
    }

    pub fn ticks_held(&self, symbol: &str) -> u64 {
        self.ticks_held.get(symbol).copied().unwrap_or(0)
    }

    /// Refresh path-dependent per-position state from the account snapshots.
    /// Ticks held reset whenever the signed exposure flips or closes. Also
    /// reports the dual-exposure anomaly without repairing it.
    pub fn note_tick(&mut self, views: &[InstrumentView<'_>]) {
        for view in views {
            let sym = &view.instrument.symbol;
            if view.position.dual_exposure() {
                warn_log(
                    "policy",
                    obj(&[
                        ("anomaly", v_str("dual_exposure")),
                        ("symbol", v_str(sym)),
                        ("long_shares", v_num(view.position.long_shares as f64)),
                        ("short_shares", v_num(view.position.short_shares as f64)),
                    ]),
                );
            }
            let sign: i8 = if view.position.long_shares > 0 {
                1
            } else if view.position.short_shares > 0 {
                -1
            } else {
                0
            };
            let last = self.last_sign.get(sym.as_str()).copied().unwrap_or(0);
            let held = self.ticks_held.entry(sym.clone()).or_insert(0);
            if sign == 0 {
                *held = 0;
            } else if sign != last {
                *held = 1;
            } else {
                *held += 1;
            }
            self.last_sign.insert(sym.clone(), sign);
        }
    }

    fn actionable(&self, view: &InstrumentView<'_>, has_authoritative: bool) -> bool {
        has_authoritative || view.instrument.history_len() >= self.cfg.min_tick_history
    }

    /// Sell pass: liquidate underperforming or direction-reversed positions.
    pub fn evaluate_sells(
        &self,
        views: &[InstrumentView<'_>],
        has_authoritative: bool,
    ) -> Vec<OrderIntent> {
        let sell_threshold = if has_authoritative {
            self.cfg.sell_threshold_post
        } else {
            self.cfg.sell_threshold_pre
        };
        let mut intents = Vec::new();
        for view in views {
            if !self.actionable(view, has_authoritative) {
                continue;
            }
            let est = view.estimate;
            let sides = [
                (Side::Long, view.position.long_shares),
                (Side::Short, view.position.short_shares),
            ];
            for (side, shares) in sides {
                if shares == 0 {
                    continue;
                }
                let bias_flip = (est.bullish() && side == Side::Short)
                    || (est.bearish() && side == Side::Long);
                let underperforming = est.abs_return() <= sell_threshold;
                if !bias_flip && !underperforming {
                    continue;
                }
                if !has_authoritative && self.ticks_held(&view.instrument.symbol) < self.cfg.min_hold_ticks {
                    // Noisy pre-authoritative signals caused the buy; give the
                    // position time before unwinding on the same noise.
                    warn_log(
                        "policy",
                        obj(&[
                            ("guard", v_str("min_hold")),
                            ("symbol", v_str(&view.instrument.symbol)),
                            ("side", v_str(side.as_str())),
                            ("ticks_held", v_num(self.ticks_held(&view.instrument.symbol) as f64)),
                            ("min_hold_ticks", v_num(self.cfg.min_hold_ticks as f64)),
                        ]),
                    );
                    continue;
                }
                let expected_price = match side {
                    Side::Long => view.instrument.bid_price,
                    Side::Short => view.instrument.ask_price,
                };
                json_log(
                    "policy",
                    obj(&[
                        ("decision", v_str("close")),
                        ("symbol", v_str(&view.instrument.symbol)),
                        ("side", v_str(side.as_str())),
                        ("shares", v_num(shares as f64)),
                        (
                            "reason",
                            v_str(if bias_flip { "bias_flip" } else { "return_below_threshold" }),
                        ),
                        ("abs_return", v_num(est.abs_return())),
                    ]),
                );
                intents.push(OrderIntent {
                    symbol: view.instrument.symbol.clone(),
                    side,
                    shares,
                    expected_price,
                });
            }
        }
        intents
    }

    /// Buy pass: open positions in spread-recovery order until cash runs out.
    pub fn evaluate_buys(
        &self,
        views: &[InstrumentView<'_>],
        has_authoritative: bool,
        cash: f64,
        portfolio_value: f64,
        remaining_ticks: u64,
    ) -> Vec<OrderIntent> {
        let buy_threshold = if has_authoritative {
            self.cfg.buy_threshold_post
        } else {
            self.cfg.buy_threshold_pre
        };

        let mut candidates: Vec<Candidate<'_, '_>> = Vec::new();
        for view in views {
            if !self.actionable(view, has_authoritative) {
                continue;
            }
            let est = view.estimate;
            let abs_return = est.abs_return();
            if abs_return <= buy_threshold {
                continue;
            }
            let side = if est.bullish() {
                Side::Long
            } else if est.bearish() {
                Side::Short
            } else {
                continue;
            };
            if side == Side::Short && !self.cfg.can_short {
                continue;
            }
            // No direct reversal: the opposite side must fully close first.
            let opposite = match side {
                Side::Long => view.position.short_shares,
                Side::Short => view.position.long_shares,
            };
            if opposite > 0 {
                continue;
            }
            if !has_authoritative {
                if view.ticks_since_inversion < self.cfg.min_ticks_since_inversion {
                    continue;
                }
                if (est.probability - 0.5).abs() < self.cfg.min_probability_distance {
                    continue;
                }
            }
            let owned = match side {
                Side::Long => view.position.long_shares,
                Side::Short => view.position.short_shares,
            };
            if owned >= view.instrument.max_shares {
                continue;
            }
            let ttcs = time_to_cover_spread(
                view.instrument.ask_price,
                view.instrument.bid_price,
                abs_return,
            );
            if !ttcs.is_finite() {
                continue;
            }
            candidates.push(Candidate { view, side, abs_return, ttcs });
        }

        // Fastest spread recovery first; higher return breaks ties.
        candidates.sort_by(|a, b| {
            a.ttcs
                .partial_cmp(&b.ttcs)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.abs_return
                        .partial_cmp(&a.abs_return)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        let mut intents = Vec::new();
        let mut remaining_cash = cash;
        for cand in candidates {
            if remaining_cash - self.cfg.reserve_cash <= self.cfg.commission {
                break;
            }
            let inst = cand.view.instrument;
            let blackout = cand.ttcs.ceil() as u64;
            if blackout > remaining_ticks {
                json_log(
                    "policy",
                    obj(&[
                        ("skip", v_str("blackout_window")),
                        ("symbol", v_str(&inst.symbol)),
                        ("blackout", v_num(blackout as f64)),
                        ("remaining_ticks", v_num(remaining_ticks as f64)),
                    ]),
                );
                continue;
            }
            let price = match cand.side {
                Side::Long => inst.ask_price,
                Side::Short => inst.bid_price,
            };
            if price <= 0.0 {
                continue;
            }
            let (owned, avg_cost) = match cand.side {
                Side::Long => (cand.view.position.long_shares, cand.view.position.long_avg_cost),
                Side::Short => (cand.view.position.short_shares, cand.view.position.short_avg_cost),
            };
            // Diversification cap, inflated by the spread so a filled position
            // does not chase the boundary with repeated micro purchases.
            let cap = portfolio_value * self.cfg.diversification_pct * (1.0 + inst.spread_pct());
            let position_value = owned as f64 * avg_cost;
            let budget = (remaining_cash - self.cfg.reserve_cash).min(cap - position_value);
            if budget <= self.cfg.commission {
                continue;
            }
            let affordable = ((budget - self.cfg.commission) / price).floor() as u64;
            let shares = affordable.min(inst.max_shares - owned);
            if shares == 0 {
                continue;
            }
            let spend = shares as f64 * price;
            // A position only has the non-blackout remainder of the cycle to
            // outrun its own transaction costs.
            let growth_ticks = (remaining_ticks - blackout) as i32;
            let projected = spend * ((1.0 + cand.abs_return).powi(growth_ticks) - 1.0);
            if projected <= 2.0 * self.cfg.commission {
                json_log(
                    "policy",
                    obj(&[
                        ("skip", v_str("commission_hurdle")),
                        ("symbol", v_str(&inst.symbol)),
                        ("projected", v_num(projected)),
                        ("hurdle", v_num(2.0 * self.cfg.commission)),
                    ]),
                );
                continue;
            }
            json_log(
                "policy",
                obj(&[
                    ("decision", v_str("open")),
                    ("symbol", v_str(&inst.symbol)),
                    ("side", v_str(cand.side.as_str())),
                    ("shares", v_num(shares as f64)),
                    ("expected_price", v_num(price)),
                    ("time_to_cover_spread", v_num(cand.ttcs)),
                ]),
            );
            intents.push(OrderIntent {
                symbol: inst.symbol.clone(),
                side: cand.side,
                shares,
                expected_price: price,
            });
            remaining_cash -= self.cfg.commission + spend;
        }
        intents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::estimate_authoritative;

    fn config() -> Config {
        Config::default()
    }

    fn instrument(bid: f64, ask: f64, max_shares: u64, history: &[f64]) -> Instrument {
        let mut inst = Instrument::new("TST", max_shares, 151);
        inst.set_quote(bid, ask);
        for &p in history {
            inst.observe(p);
        }
        inst
    }

    fn flat_view<'a>(inst: &'a Instrument, est: Estimate) -> InstrumentView<'a> {
        InstrumentView {
            instrument: inst,
            estimate: est,
            position: PositionSnapshot::default(),
            ticks_since_inversion: 100,
        }
    }

    #[test]
    fn ttcs_matches_closed_form() {
        // 4% spread at 0.1% per-tick return takes ~40 ticks to recover.
        let t = time_to_cover_spread(104.08, 100.0, 0.001);
        assert!((t - 40.0).abs() < 0.05, "ttcs={}", t);
        assert!(time_to_cover_spread(100.0, 0.0, 0.001).is_infinite());
        assert!(time_to_cover_spread(100.0, 100.0, 0.0).is_infinite());
    }

    #[test]
    fn blackout_window_skips_late_cycle_entry() {
        let policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 104.08, u64::MAX, &[]);
        let view = flat_view(&inst, estimate_authoritative(0.6, 0.01)); // abs_return 0.001
        // 20 ticks left, blackout 40: no entry.
        let none = policy.evaluate_buys(&[view], true, 100_000_000.0, 300_000_000.0, 20);
        assert!(none.is_empty());
        // 60 ticks left: entry allowed.
        let view = flat_view(&inst, estimate_authoritative(0.6, 0.01));
        let some = policy.evaluate_buys(&[view], true, 100_000_000.0, 300_000_000.0, 60);
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].side, Side::Long);
    }

    #[test]
    fn buy_ranked_by_spread_recovery() {
        let policy = PolicyEngine::new(config());
        let mut slow = instrument(100.0, 102.0, u64::MAX, &[]);
        slow.symbol = "SLOW".to_string();
        let mut fast = instrument(100.0, 100.5, u64::MAX, &[]);
        fast.symbol = "FAST".to_string();
        let views = vec![
            flat_view(&slow, estimate_authoritative(0.6, 0.02)),
            flat_view(&fast, estimate_authoritative(0.6, 0.02)),
        ];
        // Portfolio equal to cash so the diversification cap leaves room for
        // both candidates.
        let intents = policy.evaluate_buys(&views, true, 1_000_000_000.0, 1_000_000_000.0, 70);
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].symbol, "FAST");
        assert_eq!(intents[1].symbol, "SLOW");
    }

    #[test]
    fn bearish_candidate_opens_short_at_bid() {
        let policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 100.5, u64::MAX, &[]);
        let view = flat_view(&inst, estimate_authoritative(0.4, 0.02));
        let intents = policy.evaluate_buys(&[view], true, 1_000_000_000.0, 3_000_000_000.0, 70);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Short);
        assert_eq!(intents[0].expected_price, 100.0);
    }

    #[test]
    fn shorting_disabled_skips_bearish() {
        let mut cfg = config();
        cfg.can_short = false;
        let policy = PolicyEngine::new(cfg);
        let inst = instrument(100.0, 100.5, u64::MAX, &[]);
        let view = flat_view(&inst, estimate_authoritative(0.4, 0.02));
        let intents = policy.evaluate_buys(&[view], true, 1_000_000_000.0, 3_000_000_000.0, 70);
        assert!(intents.is_empty());
    }

    #[test]
    fn no_reversal_while_opposite_side_open() {
        let policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 100.5, u64::MAX, &[]);
        let mut view = flat_view(&inst, estimate_authoritative(0.4, 0.02));
        view.position.long_shares = 10;
        view.position.long_avg_cost = 99.0;
        let intents = policy.evaluate_buys(&[view], true, 1_000_000_000.0, 3_000_000_000.0, 70);
        assert!(intents.is_empty());
    }

    #[test]
    fn capacity_caps_share_count() {
        let mut cfg = config();
        cfg.commission = 1_000.0; // low enough that a 500-share lot clears the hurdle
        let policy = PolicyEngine::new(cfg);
        let inst = instrument(100.0, 100.5, 500, &[]);
        let view = flat_view(&inst, estimate_authoritative(0.6, 0.02));
        let intents = policy.evaluate_buys(&[view], true, 1_000_000_000.0, 3_000_000_000.0, 70);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].shares, 500);
    }

    #[test]
    fn at_capacity_is_skipped() {
        let policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 100.5, 500, &[]);
        let mut view = flat_view(&inst, estimate_authoritative(0.6, 0.02));
        view.position.long_shares = 500;
        view.position.long_avg_cost = 100.0;
        let intents = policy.evaluate_buys(&[view], true, 1_000_000_000.0, 3_000_000_000.0, 70);
        assert!(intents.is_empty());
    }

    #[test]
    fn diversification_cap_bounds_budget() {
        let policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 100.5, u64::MAX, &[]);
        let view = flat_view(&inst, estimate_authoritative(0.6, 0.02));
        // Cash is plentiful; the 34% portfolio cap binds instead.
        let portfolio = 10_000_000.0;
        let intents = policy.evaluate_buys(&[view], true, 1_000_000_000.0, portfolio, 70);
        assert_eq!(intents.len(), 1);
        let spend = intents[0].shares as f64 * intents[0].expected_price;
        let cap = portfolio * 0.34 * (1.0 + 0.005);
        assert!(spend <= cap, "spend={} cap={}", spend, cap);
    }

    #[test]
    fn reserve_floor_respected() {
        let mut cfg = config();
        cfg.reserve_cash = 900_000_000.0;
        cfg.commission = 1_000.0;
        let policy = PolicyEngine::new(cfg);
        let inst = instrument(100.0, 100.5, u64::MAX, &[]);
        let view = flat_view(&inst, estimate_authoritative(0.6, 0.02));
        let intents = policy.evaluate_buys(&[view], true, 900_500_000.0, 3_000_000_000.0, 70);
        // Only the 500k above the reserve is spendable.
        assert_eq!(intents.len(), 1);
        let spend = intents[0].shares as f64 * intents[0].expected_price + 1_000.0;
        assert!(spend <= 500_000.0 + 1e-6, "spend={}", spend);
    }

    #[test]
    fn commission_hurdle_rejects_small_trades() {
        let policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 100.1, u64::MAX, &[]);
        let view = flat_view(&inst, estimate_authoritative(0.6, 0.02));
        // Tiny budget: projected gain cannot exceed 2x commission.
        let intents = policy.evaluate_buys(&[view], true, 400_000.0, 3_000_000_000.0, 70);
        assert!(intents.is_empty());
    }

    #[test]
    fn sell_on_return_below_threshold() {
        let policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 100.5, u64::MAX, &[]);
        let mut view = flat_view(&inst, estimate_authoritative(0.5, 0.02)); // abs_return 0
        view.position.long_shares = 100;
        view.position.long_avg_cost = 99.0;
        let intents = policy.evaluate_sells(&[view], true);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Long);
        assert_eq!(intents[0].shares, 100);
        assert_eq!(intents[0].expected_price, 100.0); // long exits at bid
    }

    #[test]
    fn sell_on_bias_flip_covers_short_at_ask() {
        let policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 100.5, u64::MAX, &[]);
        let mut view = flat_view(&inst, estimate_authoritative(0.7, 0.02)); // bullish
        view.position.short_shares = 50;
        view.position.short_avg_cost = 101.0;
        let intents = policy.evaluate_sells(&[view], true);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Short);
        assert_eq!(intents[0].expected_price, 100.5);
    }

    #[test]
    fn healthy_position_is_held() {
        let policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 100.5, u64::MAX, &[]);
        let mut view = flat_view(&inst, estimate_authoritative(0.7, 0.02));
        view.position.long_shares = 100;
        view.position.long_avg_cost = 99.0;
        let intents = policy.evaluate_sells(&[view], true);
        assert!(intents.is_empty());
    }

    #[test]
    fn min_hold_blocks_early_preauthoritative_exit() {
        let mut policy = PolicyEngine::new(config());
        // 30 observations of flat prices: actionable, neutral estimate.
        let history: Vec<f64> = (0..30).map(|_| 100.0).collect();
        let inst = instrument(100.0, 100.5, u64::MAX, &history);
        let mut view = flat_view(&inst, estimate_authoritative(0.5, 0.0));
        view.position.long_shares = 100;
        view.position.long_avg_cost = 99.0;

        // Two ticks held: guarded.
        for _ in 0..2 {
            policy.note_tick(std::slice::from_ref(&view));
        }
        assert_eq!(policy.ticks_held("TST"), 2);
        assert!(policy.evaluate_sells(std::slice::from_ref(&view), false).is_empty());

        // Past the minimum hold: the close goes through.
        for _ in 0..10 {
            policy.note_tick(std::slice::from_ref(&view));
        }
        let intents = policy.evaluate_sells(std::slice::from_ref(&view), false);
        assert_eq!(intents.len(), 1);
    }

    #[test]
    fn ticks_held_resets_on_flat_and_flip() {
        let mut policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 100.5, u64::MAX, &[]);
        let mut view = flat_view(&inst, estimate_authoritative(0.6, 0.02));
        view.position.long_shares = 10;
        policy.note_tick(std::slice::from_ref(&view));
        policy.note_tick(std::slice::from_ref(&view));
        assert_eq!(policy.ticks_held("TST"), 2);

        view.position.long_shares = 0;
        policy.note_tick(std::slice::from_ref(&view));
        assert_eq!(policy.ticks_held("TST"), 0);

        view.position.short_shares = 10;
        policy.note_tick(std::slice::from_ref(&view));
        assert_eq!(policy.ticks_held("TST"), 1);
    }

    #[test]
    fn insufficient_history_refuses_preauthoritative_trading() {
        let policy = PolicyEngine::new(config());
        let inst = instrument(100.0, 100.5, u64::MAX, &[100.0, 101.0, 102.0]);
        let mut view = flat_view(&inst, estimate_authoritative(0.7, 0.02));
        view.position.long_shares = 100;
        assert!(policy.evaluate_sells(std::slice::from_ref(&view), false).is_empty());
        let view = flat_view(&inst, estimate_authoritative(0.7, 0.02));
        assert!(policy
            .evaluate_buys(&[view], false, 1_000_000_000.0, 3_000_000_000.0, 70)
            .is_empty());
    }

    #[test]
    fn preauthoritative_gates_recent_inversion_and_neutral_prob() {
        let policy = PolicyEngine::new(config());
        let history: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let inst = instrument(100.0, 100.5, u64::MAX, &history);

        // Recent trusted inversion: skip.
        let mut view = flat_view(&inst, estimate_authoritative(0.7, 0.02));
        view.ticks_since_inversion = 3;
        assert!(policy
            .evaluate_buys(&[view], false, 1_000_000_000.0, 3_000_000_000.0, 70)
            .is_empty());

        // Probability too close to neutral: skip even with a usable return.
        let view = flat_view(&inst, estimate_authoritative(0.52, 0.5));
        assert!(policy
            .evaluate_buys(&[view], false, 1_000_000_000.0, 3_000_000_000.0, 70)
            .is_empty());
    }

    #[test]
    fn cash_exhaustion_stops_the_pass() {
        let policy = PolicyEngine::new(config());
        let mut a = instrument(100.0, 100.2, u64::MAX, &[]);
        a.symbol = "A".to_string();
        let mut b = instrument(100.0, 100.2, u64::MAX, &[]);
        b.symbol = "B".to_string();
        let views = vec![
            flat_view(&a, estimate_authoritative(0.6, 0.02)),
            flat_view(&b, estimate_authoritative(0.6, 0.02)),
        ];
        // Enough for one meaningful position only.
        let intents = policy.evaluate_buys(&views, true, 60_000_000.0, 3_000_000_000.0, 70);
        assert_eq!(intents.len(), 1);
    }
}

//! The trading session: poll, detect ticks, decide, execute.
//!
//! One logical loop processes a tick to completion — all sells, then all
//! buys, then bookkeeping — before sleeping. Buy decisions must see the cash
//! balance after same-tick sells, so a tick with any sale skips its buy pass
//! and the next tick re-evaluates with refreshed holdings. Every error inside
//! a tick is caught at the loop boundary, logged, and followed by
//! sleep-and-continue; only liquidate mode runs to completion and exits.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::time::{sleep, Duration};

use crate::config::Config;
use crate::estimator::{estimate_authoritative, estimate_from_history};
use crate::exec::ExecutionAdapter;
use crate::ledger::{Instrument, Ledger};
use crate::logging::{error_log, json_log, obj, v_bool, v_num, v_str};
use crate::policy::{InstrumentView, OrderIntent, PolicyEngine, Side};
use crate::provider::{Account, MarketData, OrderExecutor, PositionSnapshot};
use crate::regime::{Probe, RegimeDetector};

pub struct SessionLoop {
    cfg: Config,
    market: Arc<dyn MarketData + Send + Sync>,
    account: Arc<dyn Account + Send + Sync>,
    exec: ExecutionAdapter,
    ledger: Ledger,
    regime: RegimeDetector,
    policy: PolicyEngine,
    last_asks: HashMap<String, f64>,
    last_tick_at: Option<Instant>,
}

impl SessionLoop {
    pub async fn new(
        cfg: Config,
        market: Arc<dyn MarketData + Send + Sync>,
        account: Arc<dyn Account + Send + Sync>,
        executor: Arc<dyn OrderExecutor + Send + Sync>,
    ) -> Result<Self> {
        cfg.validate()?;
        let mut ledger = Ledger::new();
        for sym in market.symbols().await? {
            let max_shares = account.max_shares(&sym).await?;
            ledger.insert(Instrument::new(sym, max_shares, cfg.max_history));
        }
        json_log(
            "session",
            obj(&[
                ("event", v_str("start")),
                ("instruments", v_num(ledger.len() as f64)),
                ("cycle_length", v_num(cfg.cycle_length as f64)),
            ]),
        );
        Ok(Self {
            exec: ExecutionAdapter::new(executor, cfg.commission),
            regime: RegimeDetector::new(&cfg),
            policy: PolicyEngine::new(cfg.clone()),
            cfg,
            market,
            account,
            ledger,
            last_asks: HashMap::new(),
            last_tick_at: None,
        })
    }

    pub fn regime(&self) -> &RegimeDetector {
        &self.regime
    }

    pub fn execution(&self) -> &ExecutionAdapter {
        &self.exec
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Run until the kill file appears. Per-tick failures are absorbed.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if Path::new(&self.cfg.kill_file).exists() {
                json_log(
                    "session",
                    obj(&[
                        ("event", v_str("kill_file_stop")),
                        ("path", v_str(&self.cfg.kill_file)),
                        ("total_realized_profit", v_num(self.exec.total_realized_profit())),
                    ]),
                );
                return Ok(());
            }
            if let Err(err) = self.poll().await {
                error_log(
                    "session",
                    obj(&[
                        ("event", v_str("tick_error")),
                        ("error", v_str(&format!("{:#}", err))),
                    ]),
                );
            }
            sleep(Duration::from_millis(self.cfg.poll_interval_ms)).await;
        }
    }

    /// One poll of the provider. Returns true when a market tick was
    /// detected (some best ask moved) and processed.
    pub async fn poll(&mut self) -> Result<bool> {
        let symbols: Vec<String> = self.ledger.symbols().to_vec();
        let mut ticked = false;
        for sym in &symbols {
            let ask = self.market.ask_price(sym).await?;
            let bid = self.market.bid_price(sym).await?;
            if self.last_asks.get(sym).map_or(true, |prev| *prev != ask) {
                ticked = true;
            }
            self.last_asks.insert(sym.clone(), ask);
            if let Some(inst) = self.ledger.get_mut(sym) {
                inst.set_quote(bid, ask);
            }
        }
        if !ticked {
            return Ok(false);
        }
        self.check_cadence();
        self.process_tick().await?;
        Ok(true)
    }

    fn check_cadence(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.last_tick_at {
            let dt = now.duration_since(prev).as_secs_f64();
            let expected = self.cfg.expected_tick_secs;
            if expected > 0.0 && (dt > 2.0 * expected || dt < 0.5 * expected) {
                json_log(
                    "session",
                    obj(&[
                        ("diagnostic", v_str("tick_cadence")),
                        ("dt_secs", v_num(dt)),
                        ("expected_secs", v_num(expected)),
                    ]),
                );
            }
        }
        self.last_tick_at = Some(now);
    }

    async fn process_tick(&mut self) -> Result<()> {
        let symbols: Vec<String> = self.ledger.symbols().to_vec();
        for sym in &symbols {
            if let Some(inst) = self.ledger.get_mut(sym) {
                let mid = inst.mid_price();
                inst.observe(mid);
            }
        }

        let has_auth = self.market.has_authoritative_access().await?;
        let mut positions: HashMap<String, PositionSnapshot> = HashMap::new();
        let mut forecasts: HashMap<String, (f64, f64)> = HashMap::new();
        for sym in &symbols {
            positions.insert(sym.clone(), self.account.position(sym).await?);
            if has_auth {
                let prob = self.market.forecast(sym).await?;
                let vol = self.market.volatility(sym).await?;
                forecasts.insert(sym.clone(), (prob, vol));
            }
        }
        let cash = self.account.cash().await?;

        // Regime probes: short vs long window pre-authoritative, current vs
        // prior forecast after.
        let mut probe_data: Vec<(String, f64, f64)> = Vec::new();
        for sym in &symbols {
            if has_auth {
                let (prob, _) = forecasts[sym];
                if let Some(prev) = self.regime.swap_forecast(sym, prob) {
                    probe_data.push((sym.clone(), prob, prev));
                }
            } else if let Some(inst) = self.ledger.get(sym) {
                if inst.history_len() > self.cfg.short_window {
                    let near = inst.uptick_ratio(self.cfg.short_window);
                    let far = inst.uptick_ratio(self.regime.long_window_for(sym));
                    probe_data.push((sym.clone(), near, far));
                }
            }
        }
        let probes: Vec<Probe<'_>> = probe_data
            .iter()
            .map(|(s, near, far)| Probe { symbol: s, near: *near, far: *far })
            .collect();
        let report = self.regime.advance(&probes);
        drop(probes);
        json_log(
            "session",
            obj(&[
                ("event", v_str("tick")),
                ("tick", v_num(report.tick as f64)),
                ("estimated_phase", v_num(report.estimated_phase as f64)),
                ("cycle_detected", v_bool(report.detected)),
                ("inversions_flagged", v_num(report.flagged as f64)),
                ("cash", v_num(cash)),
            ]),
        );

        let sells;
        let buys;
        {
            let mut views: Vec<InstrumentView<'_>> = Vec::new();
            for sym in &symbols {
                let inst = match self.ledger.get(sym) {
                    Some(inst) => inst,
                    None => continue,
                };
                let estimate = if has_auth {
                    let (prob, vol) = forecasts[sym];
                    estimate_authoritative(prob, vol)
                } else {
                    estimate_from_history(inst, self.regime.long_window_for(sym))
                };
                views.push(InstrumentView {
                    instrument: inst,
                    estimate,
                    position: positions[sym],
                    ticks_since_inversion: self.regime.ticks_since_inversion(sym),
                });
            }
            self.policy.note_tick(&views);
            sells = self.policy.evaluate_sells(&views, has_auth);
            if sells.is_empty() {
                // Long exposure marks to the live bid; short exposure carries
                // at cost until covered.
                let portfolio_value = cash
                    + views
                        .iter()
                        .map(|v| {
                            v.position.long_shares as f64 * v.instrument.bid_price
                                + v.position.short_shares as f64 * v.position.short_avg_cost
                        })
                        .sum::<f64>();
                buys = self.policy.evaluate_buys(
                    &views,
                    has_auth,
                    cash,
                    portfolio_value,
                    self.regime.remaining_ticks(),
                );
            } else {
                buys = Vec::new();
            }
        }

        if !sells.is_empty() {
            for intent in &sells {
                let pos = positions.get(&intent.symbol).copied().unwrap_or_default();
                let avg_cost = match intent.side {
                    Side::Long => pos.long_avg_cost,
                    Side::Short => pos.short_avg_cost,
                };
                self.exec.close(intent, avg_cost).await?;
            }
            // Purchases wait for the next tick so they see post-sale cash.
            json_log(
                "session",
                obj(&[
                    ("event", v_str("buys_deferred")),
                    ("sales", v_num(sells.len() as f64)),
                ]),
            );
            return Ok(());
        }
        for intent in &buys {
            self.exec.open(intent).await?;
        }
        Ok(())
    }

    /// Close every nonzero position unconditionally and return total
    /// proceeds. Pre-empts the trading loop; callers must ensure only one
    /// instance owns the account while this runs.
    pub async fn liquidate(&mut self) -> Result<f64> {
        json_log("session", obj(&[("event", v_str("liquidate_start"))]));
        let mut proceeds = 0.0;
        for sym in self.market.symbols().await? {
            let pos = self.account.position(&sym).await?;
            if pos.long_shares > 0 {
                let bid = self.market.bid_price(&sym).await?;
                let intent = OrderIntent {
                    symbol: sym.clone(),
                    side: Side::Long,
                    shares: pos.long_shares,
                    expected_price: bid,
                };
                if let Some(price) = self.exec.close(&intent, pos.long_avg_cost).await? {
                    proceeds += price * pos.long_shares as f64 - self.cfg.commission;
                }
            }
            if pos.short_shares > 0 {
                let ask = self.market.ask_price(&sym).await?;
                let intent = OrderIntent {
                    symbol: sym.clone(),
                    side: Side::Short,
                    shares: pos.short_shares,
                    expected_price: ask,
                };
                if let Some(price) = self.exec.close(&intent, pos.short_avg_cost).await? {
                    // Covering returns the posted margin plus the short's profit.
                    proceeds +=
                        (2.0 * pos.short_avg_cost - price) * pos.short_shares as f64 - self.cfg.commission;
                }
            }
        }
        json_log(
            "session",
            obj(&[
                ("event", v_str("liquidate_done")),
                ("proceeds", v_num(proceeds)),
            ]),
        );
        Ok(proceeds)
    }
}

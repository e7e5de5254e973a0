//! Hidden market-cycle detection.
//!
//! Instrument trend probabilities are known to invert with roughly 45% chance
//! once per fixed-length cycle, and the cycle phase is never observable
//! directly. The detector estimates the phase from cross-instrument agreement
//! on probability inversions: a single instrument flipping is usually noise,
//! many flipping on the same tick is a cycle boundary.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::Config;
use crate::logging::{json_log, obj, v_bool, v_num, v_str};

/// One instrument's probability pair for this tick.
///
/// Pre-authoritative: `near` is the short-window up-tick ratio, `far` the
/// long-window ratio. Post-authoritative: `near` is the current forecast,
/// `far` the prior tick's forecast.
#[derive(Debug, Clone, Copy)]
pub struct Probe<'a> {
    pub symbol: &'a str,
    pub near: f64,
    pub far: f64,
}

/// Detector state after one tick.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegimeSnapshot {
    pub tick: u64,
    pub estimated_phase: u64,
    pub detected: bool,
    pub agreement_threshold: u32,
    pub flagged: u32,
    pub trusted: u32,
    /// True when this tick's agreement crossed the threshold and the phase
    /// was reset.
    pub boundary: bool,
}

#[derive(Debug, Default)]
struct Track {
    last_inversion_tick: u64,
    prev_forecast: Option<f64>,
}

/// Process-wide regime state, owned by the session. No ambient globals, so
/// parallel sessions (backtests) stay independent.
pub struct RegimeDetector {
    cycle_length: u64,
    tolerance: f64,
    lag_tolerance: u64,
    ratchet_floor: u32,
    phase_reset_offset: u64,
    long_window: usize,
    agreement_threshold: u32,
    tick: u64,
    estimated_phase: u64,
    detected: bool,
    tracks: HashMap<String, Track>,
}

/// A possible inversion: both probabilities far enough from neutral, on
/// opposite sides, and consistent with one being ~(1 - other).
pub fn detect_inversion(p1: f64, p2: f64, tolerance: f64) -> bool {
    let tol2 = tolerance / 2.0;
    ((p1 >= 0.5 + tol2) && (p2 <= 0.5 - tol2) && p2 <= (1.0 - p1) + tolerance)
        || ((p1 <= 0.5 - tol2) && (p2 >= 0.5 + tol2) && p2 >= (1.0 - p1) - tolerance)
}

impl RegimeDetector {
    pub fn new(cfg: &Config) -> Self {
        Self {
            cycle_length: cfg.cycle_length,
            tolerance: cfg.inversion_tolerance,
            lag_tolerance: cfg.inversion_lag_tolerance,
            ratchet_floor: cfg.agreement_ratchet_floor,
            phase_reset_offset: cfg.phase_reset_offset,
            long_window: cfg.long_window,
            agreement_threshold: cfg.agreement_threshold,
            tick: 0,
            estimated_phase: 0,
            detected: false,
            tracks: HashMap::new(),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn estimated_phase(&self) -> u64 {
        self.estimated_phase
    }

    pub fn detected(&self) -> bool {
        self.detected
    }

    pub fn agreement_threshold(&self) -> u32 {
        self.agreement_threshold
    }

    /// Ticks estimated to remain before the next cycle boundary.
    pub fn remaining_ticks(&self) -> u64 {
        self.cycle_length - self.estimated_phase
    }

    /// Ticks since the symbol's last trusted inversion.
    pub fn ticks_since_inversion(&self, symbol: &str) -> u64 {
        let last = self.tracks.get(symbol).map(|t| t.last_inversion_tick).unwrap_or(0);
        self.tick.saturating_sub(last)
    }

    /// Long-term probability window: observations since the last trusted
    /// inversion, capped by the configured maximum.
    pub fn long_window_for(&self, symbol: &str) -> usize {
        (self.ticks_since_inversion(symbol) as usize).min(self.long_window)
    }

    /// Record the latest authoritative forecast and return the prior one
    /// (post-authoritative inversion reference).
    pub fn swap_forecast(&mut self, symbol: &str, forecast: f64) -> Option<f64> {
        let track = self.tracks.entry(symbol.to_string()).or_default();
        track.prev_forecast.replace(forecast)
    }

    fn near_boundary(&self) -> bool {
        let dist = self.estimated_phase.min(self.cycle_length - self.estimated_phase);
        dist <= self.lag_tolerance
    }

    /// Advance one market tick and fold in this tick's probability probes.
    pub fn advance(&mut self, probes: &[Probe<'_>]) -> RegimeSnapshot {
        self.tick += 1;
        self.estimated_phase = (self.estimated_phase + 1) % self.cycle_length;

        let flagged: Vec<&str> = probes
            .iter()
            .filter(|p| detect_inversion(p.near, p.far, self.tolerance))
            .map(|p| p.symbol)
            .collect();

        let boundary = flagged.len() as u32 >= self.agreement_threshold;
        if boundary {
            // Strong cross-instrument evidence: a cycle boundary just passed.
            self.detected = true;
            self.agreement_threshold = self
                .agreement_threshold
                .max(self.ratchet_floor.max(flagged.len() as u32));
            self.estimated_phase = self.phase_reset_offset;
            json_log(
                "regime",
                obj(&[
                    ("event", v_str("cycle_boundary")),
                    ("tick", v_num(self.tick as f64)),
                    ("flagged", v_num(flagged.len() as f64)),
                    ("agreement_threshold", v_num(self.agreement_threshold as f64)),
                ]),
            );
        }

        // An individual flag resets its instrument's long window only when it
        // lands near the estimated boundary (or before any boundary estimate
        // exists, or on the agreement tick itself). Untrusted flags are noise
        // until proven otherwise.
        let trust_all = boundary || !self.detected;
        let near = self.near_boundary();
        let mut trusted = 0u32;
        for sym in &flagged {
            if trust_all || near {
                trusted += 1;
                let track = self.tracks.entry(sym.to_string()).or_default();
                track.last_inversion_tick = self.tick;
                json_log(
                    "regime",
                    obj(&[
                        ("event", v_str("inversion_trusted")),
                        ("symbol", v_str(sym)),
                        ("tick", v_num(self.tick as f64)),
                        ("estimated_phase", v_num(self.estimated_phase as f64)),
                    ]),
                );
            } else {
                json_log(
                    "regime",
                    obj(&[
                        ("event", v_str("inversion_untrusted")),
                        ("symbol", v_str(sym)),
                        ("tick", v_num(self.tick as f64)),
                        ("estimated_phase", v_num(self.estimated_phase as f64)),
                    ]),
                );
            }
        }

        let snapshot = RegimeSnapshot {
            tick: self.tick,
            estimated_phase: self.estimated_phase,
            detected: self.detected,
            agreement_threshold: self.agreement_threshold,
            flagged: flagged.len() as u32,
            trusted,
            boundary,
        };
        if boundary {
            json_log(
                "regime",
                obj(&[
                    ("event", v_str("snapshot")),
                    ("estimated_phase", v_num(snapshot.estimated_phase as f64)),
                    ("detected", v_bool(snapshot.detected)),
                ]),
            );
        }
        snapshot
    }
}

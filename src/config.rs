use anyhow::{bail, Result};

/// All engine tunables with documented defaults.
///
/// Every field can be overridden through the environment, one variable per
/// field. Invalid values fail fast in [`Config::validate`] before the session
/// loop starts, never mid-tick.
#[derive(Clone, Debug)]
pub struct Config {
    // -- capital --------------------------------------------------------
    /// Cash floor the buy pass will never dip below.
    pub reserve_cash: f64,
    /// Max fraction of total portfolio value a single instrument may hold.
    pub diversification_pct: f64,
    /// Flat commission charged on every open and every close.
    pub commission: f64,
    /// Whether bearish candidates may be opened as shorts.
    pub can_short: bool,

    // -- decision thresholds --------------------------------------------
    /// Minimum per-tick expected return to open, before authoritative data.
    pub buy_threshold_pre: f64,
    /// Minimum per-tick expected return to open, with authoritative data.
    pub buy_threshold_post: f64,
    /// Expected return at or below which a held position is closed (pre).
    pub sell_threshold_pre: f64,
    /// Expected return at or below which a held position is closed (post).
    pub sell_threshold_post: f64,
    /// Pre-authoritative positions younger than this are never closed on
    /// threshold or bias-flip grounds alone.
    pub min_hold_ticks: u64,
    /// Pre-authoritative: skip candidates whose raw probability is within
    /// this distance of 0.5.
    pub min_probability_distance: f64,
    /// Pre-authoritative: skip candidates whose last trusted inversion is
    /// younger than this many ticks.
    pub min_ticks_since_inversion: u64,

    // -- regime detection ------------------------------------------------
    /// Fixed length of the hidden market cycle, in ticks.
    pub cycle_length: u64,
    /// Cap on the long-term probability window (ticks since last trusted
    /// inversion).
    pub long_window: usize,
    /// Short-term probability window length.
    pub short_window: usize,
    /// Retained price history per instrument.
    pub max_history: usize,
    /// Below this many observations, estimates are not actionable.
    pub min_tick_history: usize,
    /// Inversion consistency tolerance; flags require both probabilities
    /// beyond tolerance/2 from 0.5 and one within tolerance of 1 - other.
    pub inversion_tolerance: f64,
    /// A flag is trusted only within this many ticks of the estimated
    /// cycle boundary.
    pub inversion_lag_tolerance: u64,
    /// Simultaneous flags needed to declare a cycle boundary. Ratchets
    /// upward on detection, never decreases.
    pub agreement_threshold: u32,
    /// Floor the agreement threshold ratchets to on first detection.
    pub agreement_ratchet_floor: u32,
    /// Phase value assigned right after a detected boundary.
    pub phase_reset_offset: u64,

    // -- session loop ----------------------------------------------------
    /// Provider polling interval.
    pub poll_interval_ms: u64,
    /// Expected wall-clock spacing between market ticks; cadence far
    /// outside this emits a diagnostic only.
    pub expected_tick_secs: f64,
    /// Presence of this file stops the trading loop.
    pub kill_file: String,

    // -- simulated market -----------------------------------------------
    pub sim_symbols: usize,
    pub sim_cash: f64,
    pub sim_authoritative: bool,
    pub sim_seed: u64,
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reserve_cash: 0.0,
            diversification_pct: 0.34,
            commission: 100_000.0,
            can_short: true,
            buy_threshold_pre: 0.0015,
            buy_threshold_post: 0.0001,
            sell_threshold_pre: 0.0005,
            sell_threshold_post: 0.0,
            min_hold_ticks: 10,
            min_probability_distance: 0.05,
            min_ticks_since_inversion: 10,
            cycle_length: 75,
            long_window: 51,
            short_window: 10,
            max_history: 151,
            min_tick_history: 21,
            inversion_tolerance: 0.10,
            inversion_lag_tolerance: 5,
            agreement_threshold: 6,
            agreement_ratchet_floor: 14,
            phase_reset_offset: 5,
            poll_interval_ms: 1000,
            expected_tick_secs: 6.0,
            kill_file: "/tmp/STOP".to_string(),
            sim_symbols: 20,
            sim_cash: 1_000_000_000.0,
            sim_authoritative: false,
            sim_seed: 1,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            reserve_cash: env_f64("RESERVE_CASH", d.reserve_cash),
            diversification_pct: env_f64("DIVERSIFICATION_PCT", d.diversification_pct),
            commission: env_f64("COMMISSION", d.commission),
            can_short: env_bool("CAN_SHORT", d.can_short),
            buy_threshold_pre: env_f64("BUY_TH_PRE", d.buy_threshold_pre),
            buy_threshold_post: env_f64("BUY_TH_POST", d.buy_threshold_post),
            sell_threshold_pre: env_f64("SELL_TH_PRE", d.sell_threshold_pre),
            sell_threshold_post: env_f64("SELL_TH_POST", d.sell_threshold_post),
            min_hold_ticks: env_u64("MIN_HOLD_TICKS", d.min_hold_ticks),
            min_probability_distance: env_f64("MIN_PROB_DIST", d.min_probability_distance),
            min_ticks_since_inversion: env_u64("MIN_TICKS_SINCE_INV", d.min_ticks_since_inversion),
            cycle_length: env_u64("CYCLE_LEN", d.cycle_length),
            long_window: env_usize("LONG_WINDOW", d.long_window),
            short_window: env_usize("SHORT_WINDOW", d.short_window),
            max_history: env_usize("MAX_HISTORY", d.max_history),
            min_tick_history: env_usize("MIN_TICK_HISTORY", d.min_tick_history),
            inversion_tolerance: env_f64("INV_TOLERANCE", d.inversion_tolerance),
            inversion_lag_tolerance: env_u64("INV_LAG_TOLERANCE", d.inversion_lag_tolerance),
            agreement_threshold: env_u32("AGREEMENT_TH", d.agreement_threshold),
            agreement_ratchet_floor: env_u32("AGREEMENT_RATCHET_FLOOR", d.agreement_ratchet_floor),
            phase_reset_offset: env_u64("PHASE_RESET_OFFSET", d.phase_reset_offset),
            poll_interval_ms: env_u64("POLL_MS", d.poll_interval_ms),
            expected_tick_secs: env_f64("EXPECTED_TICK_SECS", d.expected_tick_secs),
            kill_file: std::env::var("KILL_FILE").unwrap_or(d.kill_file),
            sim_symbols: env_usize("SIM_SYMBOLS", d.sim_symbols),
            sim_cash: env_f64("SIM_CASH", d.sim_cash),
            sim_authoritative: env_bool("SIM_AUTHORITATIVE", d.sim_authoritative),
            sim_seed: env_u64("SIM_SEED", d.sim_seed),
        }
    }

    /// Fail fast on configurations that would misbehave mid-loop.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("reserve_cash", self.reserve_cash),
            ("commission", self.commission),
            ("buy_threshold_pre", self.buy_threshold_pre),
            ("buy_threshold_post", self.buy_threshold_post),
            ("sell_threshold_pre", self.sell_threshold_pre),
            ("sell_threshold_post", self.sell_threshold_post),
            ("min_probability_distance", self.min_probability_distance),
            ("expected_tick_secs", self.expected_tick_secs),
        ] {
            if !v.is_finite() || v < 0.0 {
                bail!("config: {} must be finite and non-negative, got {}", name, v);
            }
        }
        if !(self.diversification_pct > 0.0 && self.diversification_pct <= 1.0) {
            bail!(
                "config: diversification_pct must be in (0, 1], got {}",
                self.diversification_pct
            );
        }
        if !(self.inversion_tolerance > 0.0 && self.inversion_tolerance < 1.0) {
            bail!(
                "config: inversion_tolerance must be in (0, 1), got {}",
                self.inversion_tolerance
            );
        }
        if self.cycle_length == 0 {
            bail!("config: cycle_length must be positive");
        }
        if self.short_window < 2 || self.long_window <= self.short_window {
            bail!(
                "config: need 2 <= short_window < long_window, got {} / {}",
                self.short_window,
                self.long_window
            );
        }
        if self.max_history <= self.long_window {
            bail!(
                "config: max_history {} must exceed long_window {}",
                self.max_history,
                self.long_window
            );
        }
        if self.min_tick_history < 2 {
            bail!("config: min_tick_history must be at least 2");
        }
        if self.phase_reset_offset >= self.cycle_length {
            bail!(
                "config: phase_reset_offset {} must be below cycle_length {}",
                self.phase_reset_offset,
                self.cycle_length
            );
        }
        if self.poll_interval_ms == 0 {
            bail!("config: poll_interval_ms must be positive");
        }
        if self.sim_symbols == 0 {
            bail!("config: sim_symbols must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_negative_commission() {
        let mut cfg = Config::default();
        cfg.commission = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_nan_threshold() {
        let mut cfg = Config::default();
        cfg.buy_threshold_pre = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_windows() {
        let mut cfg = Config::default();
        cfg.short_window = 51;
        cfg.long_window = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_cycle() {
        let mut cfg = Config::default();
        cfg.cycle_length = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_diversification_over_one() {
        let mut cfg = Config::default();
        cfg.diversification_pct = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_offset_beyond_cycle() {
        let mut cfg = Config::default();
        cfg.phase_reset_offset = 75;
        assert!(cfg.validate().is_err());
    }
}

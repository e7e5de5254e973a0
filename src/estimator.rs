//! Trend probability and expected-return estimation.
//!
//! Two modes: authoritative passthrough once the signal entitlement exists,
//! and windowed inference from raw price history before it does. The
//! pre-authoritative path deliberately shrinks confidence by one standard
//! error so noisy forecasts are never treated as better than the data.

use serde::Serialize;

use crate::ledger::Instrument;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Estimate {
    /// Raw trend-up probability in [0, 1].
    pub probability: f64,
    /// Binomial standard error of `probability`; 0 when authoritative.
    pub std_dev: f64,
    /// Expected per-tick relative return, signed by trend direction.
    pub expected_return: f64,
}

impl Estimate {
    /// Magnitude used to rank long and short candidates uniformly.
    pub fn abs_return(&self) -> f64 {
        self.expected_return.abs()
    }

    pub fn bullish(&self) -> bool {
        self.probability > 0.5
    }

    pub fn bearish(&self) -> bool {
        self.probability < 0.5
    }
}

/// Shrink the deviation from neutral by one standard error, without crossing
/// neutral. Uncertainty reduces confidence, never direction.
pub fn conservative_probability(probability: f64, std_dev: f64) -> f64 {
    if probability > 0.5 {
        (probability - std_dev).max(0.5)
    } else {
        (probability + std_dev).min(0.5)
    }
}

/// Authoritative mode: the provider's forecast and volatility are ground
/// truth, so no uncertainty discount applies.
pub fn estimate_authoritative(probability: f64, volatility: f64) -> Estimate {
    Estimate {
        probability,
        std_dev: 0.0,
        expected_return: volatility * (probability - 0.5),
    }
}

/// Pre-authoritative mode: infer from the instrument's inversion-aware
/// history window (observations since the last trusted inversion, capped).
pub fn estimate_from_history(instrument: &Instrument, window: usize) -> Estimate {
    let pairs = instrument.pairs_in_window(window);
    if pairs == 0 {
        return Estimate {
            probability: 0.5,
            std_dev: 0.5,
            expected_return: 0.0,
        };
    }
    let probability = instrument.uptick_ratio(window);
    let std_dev = (probability * (1.0 - probability) / pairs as f64).sqrt();
    let conservative = conservative_probability(probability, std_dev);
    Estimate {
        probability,
        std_dev,
        expected_return: instrument.derived_volatility() * (conservative - 0.5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(prices_oldest_first: &[f64]) -> Instrument {
        let mut inst = Instrument::new("TST", 1_000, 151);
        for &p in prices_oldest_first {
            inst.observe(p);
        }
        inst
    }

    #[test]
    fn authoritative_passthrough() {
        let est = estimate_authoritative(0.65, 0.02);
        assert_eq!(est.std_dev, 0.0);
        assert!((est.expected_return - 0.02 * 0.15).abs() < 1e-12);
        assert!(est.bullish());
    }

    #[test]
    fn authoritative_bearish_return_is_negative() {
        let est = estimate_authoritative(0.3, 0.01);
        assert!(est.expected_return < 0.0);
        assert!((est.abs_return() - 0.002).abs() < 1e-12);
        assert!(est.bearish());
    }

    #[test]
    fn history_estimate_matches_hand_computation() {
        let inst = instrument(&[10.0, 10.5, 11.0, 10.8, 11.2]);
        let est = estimate_from_history(&inst, 151);
        assert!((est.probability - 0.75).abs() < 1e-12);
        let sd = (0.75_f64 * 0.25 / 4.0).sqrt();
        assert!((est.std_dev - sd).abs() < 1e-12);
        let vol = inst.derived_volatility();
        assert!((est.expected_return - vol * (0.75 - sd - 0.5)).abs() < 1e-12);
    }

    #[test]
    fn conservative_shrink_never_amplifies() {
        for p in [0.0, 0.1, 0.35, 0.5, 0.62, 0.9, 1.0] {
            for sd in [0.0, 0.01, 0.1, 0.4, 0.9] {
                let cp = conservative_probability(p, sd);
                assert!(
                    (cp - 0.5).abs() <= (p - 0.5).abs() + 1e-12,
                    "p={} sd={} cp={}",
                    p,
                    sd,
                    cp
                );
            }
        }
    }

    #[test]
    fn conservative_shrink_never_crosses_neutral() {
        assert_eq!(conservative_probability(0.55, 0.2), 0.5);
        assert_eq!(conservative_probability(0.45, 0.2), 0.5);
    }

    #[test]
    fn no_pairs_yields_neutral_estimate() {
        let inst = instrument(&[10.0]);
        let est = estimate_from_history(&inst, 151);
        assert_eq!(est.probability, 0.5);
        assert_eq!(est.expected_return, 0.0);
        assert!(!est.bullish() && !est.bearish());
    }

    #[test]
    fn window_restriction_changes_estimate() {
        // Downtrend in the recent window of an overall uptrend.
        let inst = instrument(&[10.0, 11.0, 12.0, 13.0, 12.5, 12.0]);
        let full = estimate_from_history(&inst, 151);
        let recent = estimate_from_history(&inst, 3);
        assert!(full.probability > 0.5, "full={}", full.probability);
        assert!(recent.probability < 0.5, "recent={}", recent.probability);
    }
}

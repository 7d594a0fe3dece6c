//! Derived market-wide read model over the latest per-instrument
//! snapshots. Advisory only; recomputed on every summary sweep.

use crate::market::types::{InstrumentSnapshot, MarketSummary};

/// Direction is judged on the day change; instruments flat on the day
/// count as unchanged.
pub fn derive_summary(baselines: &[InstrumentSnapshot]) -> MarketSummary {
    let mut summary = MarketSummary {
        instrument_count: baselines.len(),
        ..MarketSummary::default()
    };

    for s in baselines {
        if s.change > 0.0 {
            summary.advancing += 1;
        } else if s.change < 0.0 {
            summary.declining += 1;
        } else {
            summary.unchanged += 1;
        }
        summary.total_volume += s.volume;

        summary.as_of = match summary.as_of {
            Some(prev) if prev >= s.captured_at => Some(prev),
            _ => Some(s.captured_at),
        };
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snap(symbol: &str, change: f64, volume: u64) -> InstrumentSnapshot {
        InstrumentSnapshot {
            symbol: symbol.to_string(),
            price: 100.0 + change,
            change,
            change_percent: change,
            volume,
            open: 100.0,
            high: 100.0,
            low: 100.0,
            previous_close: 100.0,
            market_cap: None,
            source: "test-feed".to_string(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn empty_market_is_all_zeroes() {
        let s = derive_summary(&[]);
        assert_eq!(s.instrument_count, 0);
        assert!(s.as_of.is_none());
    }

    #[test]
    fn counts_directions_and_volume() {
        let s = derive_summary(&[
            snap("AAA", 1.5, 100),
            snap("BBB", -0.5, 200),
            snap("CCC", 0.0, 50),
            snap("DDD", 2.0, 10),
        ]);

        assert_eq!(s.instrument_count, 4);
        assert_eq!(s.advancing, 2);
        assert_eq!(s.declining, 1);
        assert_eq!(s.unchanged, 1);
        assert_eq!(s.total_volume, 360);
        assert!(s.as_of.is_some());
    }
}

// =============================================================================
// Average True Range — Wilder smoothing
// =============================================================================
//
// True range of a bar against the previous close:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// The first ATR value is the simple average of the first `period` TRs; every
// later bar folds in with ATR = (prev * (period - 1) + TR) / period.
// =============================================================================

use crate::market_data::Candle;

pub const DEFAULT_PERIOD: usize = 14;

/// Latest ATR over `candles` (oldest first). `None` when the period is zero,
/// fewer than `period + 1` bars are available, or the smoothing produces a
/// non-finite value.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut value = 0.0;
    for (index, pair) in candles.windows(2).enumerate() {
        let tr = true_range(&pair[1], pair[0].close);
        value = if index < period {
            // Seeding phase: running sum, averaged once the window fills.
            value + tr
        } else {
            (value * (period as f64 - 1.0) + tr) / period as f64
        };
        if index == period - 1 {
            value /= period as f64;
        }
        if !value.is_finite() {
            return None;
        }
    }
    Some(value)
}

/// ATR relative to the last close, in percent. Lets volatility be compared
/// across symbols with very different price scales.
pub fn atr_pct(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = atr(candles, period)?;
    let close = candles.last()?.close;
    if close == 0.0 {
        return None;
    }
    Some(atr / close * 100.0)
}

fn true_range(bar: &Candle, prev_close: f64) -> f64 {
    let hl = bar.high - bar.low;
    let hc = (bar.high - prev_close).abs();
    let lc = (bar.low - prev_close).abs();
    hl.max(hc).max(lc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            close_time: 0,
            is_final: true,
        }
    }

    #[test]
    fn rejects_zero_period_and_short_input() {
        let candles = vec![bar(105.0, 95.0, 100.0); 20];
        assert!(atr(&candles, 0).is_none());
        assert!(atr(&candles[..10], 14).is_none());
        // Exactly period + 1 bars is the minimum.
        assert!(atr(&candles[..15], 14).is_some());
    }

    #[test]
    fn constant_range_converges_to_that_range() {
        // Every bar spans 10 with the close at the midpoint, so TR is 10
        // throughout and the smoothed value must stay at 10.
        let mut candles = Vec::new();
        for i in 0..40 {
            let mid = 100.0 + i as f64 * 0.1;
            candles.push(bar(mid + 5.0, mid - 5.0, mid));
        }
        let value = atr(&candles, 14).unwrap();
        assert!((value - 10.0).abs() < 0.5, "got {value}");
    }

    #[test]
    fn gap_up_widens_the_true_range() {
        // A bar that opens far above the previous close has TR driven by
        // |H - prevClose| rather than its own H - L span.
        let candles = vec![
            bar(101.0, 99.0, 100.0),
            bar(101.0, 99.0, 100.0),
            bar(101.0, 99.0, 100.0),
            bar(121.0, 119.0, 120.0),
        ];
        let value = atr(&candles, 3).unwrap();
        // TRs: 2, 2, 21 -> seed = 25/3.
        assert!((value - 25.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn seed_is_simple_average_of_first_trs() {
        let candles = vec![
            bar(102.0, 98.0, 100.0),
            bar(103.0, 99.0, 101.0),
            bar(104.0, 100.0, 102.0),
        ];
        // Two TR values of 4 each; period 2 seeds at exactly 4.
        assert!((atr(&candles, 2).unwrap() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn pct_scales_by_last_close() {
        let mut candles = Vec::new();
        for _ in 0..20 {
            candles.push(bar(205.0, 195.0, 200.0));
        }
        let pct = atr_pct(&candles, 14).unwrap();
        // ATR ~= 10 on a 200 close -> ~5%.
        assert!((pct - 5.0).abs() < 0.5, "got {pct}");

        let zeroed = vec![bar(1.0, -1.0, 0.0); 20];
        assert!(atr_pct(&zeroed, 14).is_none());
    }
}

//! Technical indicator math.
//!
//! These formulae are normative: agents decide on these exact numbers, and
//! backtest and live must agree bit-for-bit given identical inputs. Every
//! accumulation runs left to right over the input slice; do not reorder.
//!
//! - EMA: seeded at `values[0]`, multiplier `2/(N+1)`
//! - RSI: Wilder smoothing over 14
//! - MACD: EMA12 - EMA26, signal EMA9 of MACD, histogram = difference
//! - Bollinger: SMA20 +/- 2 * population stddev
//! - ATR: Wilder smoothing of true range over 14

use crate::domain::market::IndicatorSet;
use crate::domain::types::Candle;
use rust_decimal::prelude::ToPrimitive;

pub const EMA_FAST_PERIOD: usize = 9;
pub const EMA_SLOW_PERIOD: usize = 21;
pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_WIDTH: f64 = 2.0;
pub const ATR_PERIOD: usize = 14;
pub const VOLUME_RATIO_PERIOD: usize = 20;

/// Full EMA series, seeded at the first value.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = values[0];
    out.push(prev);
    for v in &values[1..] {
        prev = v * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}

pub fn ema(values: &[f64], period: usize) -> f64 {
    ema_series(values, period).last().copied().unwrap_or(0.0)
}

/// RSI with Wilder smoothing. Returns 50 (neutral) until enough history.
pub fn rsi(values: &[f64], period: usize) -> f64 {
    if values.len() <= period {
        return 50.0;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = values[i] - values[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss += -change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for i in (period + 1)..values.len() {
        let change = values[i] - values[i - 1];
        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// (macd, signal, histogram) at the last bar.
pub fn macd(values: &[f64]) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let fast = ema_series(values, MACD_FAST);
    let slow = ema_series(values, MACD_SLOW);
    let macd_line: Vec<f64> = fast.iter().zip(slow.iter()).map(|(f, s)| f - s).collect();
    let signal_line = ema_series(&macd_line, MACD_SIGNAL);

    let macd_value = *macd_line.last().unwrap_or(&0.0);
    let signal_value = *signal_line.last().unwrap_or(&0.0);
    (macd_value, signal_value, macd_value - signal_value)
}

/// (upper, middle, lower) over the trailing window; population stddev.
pub fn bollinger(values: &[f64], period: usize, width: f64) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let window = if values.len() >= period {
        &values[values.len() - period..]
    } else {
        values
    };
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    (mean + width * stddev, mean, mean - width * stddev)
}

fn true_range(current: &Candle, previous_close: f64) -> f64 {
    let high = current.high.to_f64().unwrap_or(0.0);
    let low = current.low.to_f64().unwrap_or(0.0);
    (high - low)
        .max((high - previous_close).abs())
        .max((low - previous_close).abs())
}

/// ATR with Wilder smoothing over 14 true ranges.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if candles.len() <= period {
        return 0.0;
    }

    let mut sum = 0.0;
    for i in 1..=period {
        let prev_close = candles[i - 1].close.to_f64().unwrap_or(0.0);
        sum += true_range(&candles[i], prev_close);
    }
    let mut atr = sum / period as f64;

    for i in (period + 1)..candles.len() {
        let prev_close = candles[i - 1].close.to_f64().unwrap_or(0.0);
        let tr = true_range(&candles[i], prev_close);
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }
    atr
}

/// Last bar's volume relative to the trailing average.
pub fn volume_ratio(candles: &[Candle], period: usize) -> f64 {
    if candles.is_empty() {
        return 1.0;
    }
    let window = if candles.len() >= period {
        &candles[candles.len() - period..]
    } else {
        candles
    };
    let avg: f64 = window
        .iter()
        .map(|c| c.volume.to_f64().unwrap_or(0.0))
        .sum::<f64>()
        / window.len() as f64;
    if avg <= 0.0 {
        return 1.0;
    }
    candles
        .last()
        .map(|c| c.volume.to_f64().unwrap_or(0.0) / avg)
        .unwrap_or(1.0)
}

/// Standard deviation of simple returns over the last `bars` bars; the
/// system breaker's volatility metric.
pub fn returns_volatility(candles: &[Candle], bars: usize) -> f64 {
    if candles.len() < 2 {
        return 0.0;
    }
    let window = if candles.len() > bars + 1 {
        &candles[candles.len() - bars - 1..]
    } else {
        candles
    };
    let returns: Vec<f64> = window
        .windows(2)
        .filter_map(|pair| {
            let prev = pair[0].close.to_f64()?;
            let cur = pair[1].close.to_f64()?;
            if prev > 0.0 { Some(cur / prev - 1.0) } else { None }
        })
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    use statrs::statistics::Statistics;
    returns.std_dev()
}

/// Compute the full indicator set from an hourly candle window.
pub fn compute(candles: &[Candle]) -> IndicatorSet {
    let closes: Vec<f64> = candles
        .iter()
        .map(|c| c.close.to_f64().unwrap_or(0.0))
        .collect();

    let (macd_value, macd_signal, macd_histogram) = macd(&closes);
    let (bb_upper, bb_middle, bb_lower) = bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_WIDTH);

    IndicatorSet {
        ema_fast: ema(&closes, EMA_FAST_PERIOD),
        ema_slow: ema(&closes, EMA_SLOW_PERIOD),
        rsi: rsi(&closes, RSI_PERIOD),
        macd: macd_value,
        macd_signal,
        macd_histogram,
        bollinger_upper: bb_upper,
        bollinger_middle: bb_middle,
        bollinger_lower: bb_lower,
        atr: atr(candles, ATR_PERIOD),
        volume_ratio: volume_ratio(candles, VOLUME_RATIO_PERIOD),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Candle {
                symbol: "BTC/USDT".to_string(),
                open: Decimal::from_f64(*c).unwrap(),
                high: Decimal::from_f64(c + 1.0).unwrap(),
                low: Decimal::from_f64(c - 1.0).unwrap(),
                close: Decimal::from_f64(*c).unwrap(),
                volume: Decimal::from(1000),
                timestamp: i as i64,
            })
            .collect()
    }

    #[test]
    fn test_ema_seeded_at_first_value() {
        let series = ema_series(&[10.0, 10.0, 10.0], 3);
        assert_eq!(series, vec![10.0, 10.0, 10.0]);

        // k = 2/(2+1) = 2/3; 10 -> 10*1/3 + 13*2/3 = 12
        let series = ema_series(&[10.0, 13.0], 2);
        assert!((series[1] - 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_ema_is_deterministic() {
        let values: Vec<f64> = (0..200).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        assert_eq!(ema(&values, 9).to_bits(), ema(&values, 9).to_bits());
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&rising, 14), 100.0);

        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        assert!(rsi(&falling, 14) < 1.0);

        // Not enough history: neutral.
        assert_eq!(rsi(&[100.0, 101.0], 14), 50.0);
    }

    #[test]
    fn test_rsi_in_range() {
        let values: Vec<f64> = (0..100).map(|i| 100.0 + (i as f64 * 0.3).sin() * 10.0).collect();
        let value = rsi(&values, 14);
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn test_macd_flat_series_is_zero() {
        let flat = vec![100.0; 60];
        let (m, s, h) = macd(&flat);
        assert_eq!(m, 0.0);
        assert_eq!(s, 0.0);
        assert_eq!(h, 0.0);
    }

    #[test]
    fn test_macd_positive_in_uptrend() {
        let rising: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 2.0).collect();
        let (m, _, _) = macd(&rising);
        assert!(m > 0.0);
    }

    #[test]
    fn test_bollinger_constant_series_collapses() {
        let flat = vec![50.0; 25];
        let (upper, middle, lower) = bollinger(&flat, 20, 2.0);
        assert_eq!(upper, 50.0);
        assert_eq!(middle, 50.0);
        assert_eq!(lower, 50.0);
    }

    #[test]
    fn test_bollinger_known_values() {
        // Window [1..=20]: mean 10.5, population stddev ~5.766
        let values: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let (upper, middle, lower) = bollinger(&values, 20, 2.0);
        assert!((middle - 10.5).abs() < 1e-9);
        assert!((upper - (10.5 + 2.0 * 5.766281297335398)).abs() < 1e-9);
        assert!((lower - (10.5 - 2.0 * 5.766281297335398)).abs() < 1e-9);
    }

    #[test]
    fn test_atr_constant_range() {
        // Every bar has high-low = 2 and closes at the same price.
        let candles = candles_from_closes(&[100.0; 30]);
        let value = atr(&candles, 14);
        assert!((value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_volume_ratio() {
        let mut candles = candles_from_closes(&[100.0; 21]);
        candles.last_mut().unwrap().volume = Decimal::from(3000);
        let ratio = volume_ratio(&candles, 20);
        assert!(ratio > 2.5 && ratio < 3.1);
    }

    #[test]
    fn test_returns_volatility_flat_is_zero() {
        let candles = candles_from_closes(&[100.0; 30]);
        assert_eq!(returns_volatility(&candles, 20), 0.0);
    }

    #[test]
    fn test_compute_produces_full_set() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + (i as f64 * 0.2).sin() * 3.0).collect();
        let candles = candles_from_closes(&closes);
        let set = compute(&candles);
        assert!(set.ema_fast > 0.0);
        assert!(set.ema_slow > 0.0);
        assert!((0.0..=100.0).contains(&set.rsi));
        assert!(set.bollinger_upper >= set.bollinger_middle);
        assert!(set.bollinger_middle >= set.bollinger_lower);
        assert!(set.atr > 0.0);
    }
}

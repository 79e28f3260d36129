//! Pure indicator math over close slices and bar slices.
//!
//! Every function returns `None` instead of panicking when the input is
//! too short or a period is zero, so callers can map that straight to
//! "not ready yet". Outputs are tail-aligned: the last element always
//! describes the most recent input.

use wick_core::Bar;

/// Simple moving average; one value per full window.
#[must_use]
pub fn sma(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(
        values
            .windows(period)
            .map(|window| window.iter().sum::<f64>() / period as f64)
            .collect(),
    )
}

/// Exponential moving average seeded with the SMA of the first window.
#[must_use]
pub fn ema(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || values.len() < period {
        return None;
    }
    let smoothing = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    let mut prev = seed;
    out.push(seed);
    for value in &values[period..] {
        prev = (value - prev) * smoothing + prev;
        out.push(prev);
    }
    Some(out)
}

/// Wilder smoothing (aka RMA), the EMA variant classic RSI/ADX use.
fn wilder(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || values.len() < period {
        return None;
    }
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    let mut prev = seed;
    out.push(seed);
    for value in &values[period..] {
        prev = (prev * (period as f64 - 1.0) + value) / period as f64;
        out.push(prev);
    }
    Some(out)
}

/// Relative strength index over `period` deltas.
#[must_use]
pub fn rsi(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }
    let deltas: Vec<f64> = values.windows(2).map(|pair| pair[1] - pair[0]).collect();
    let gains: Vec<f64> = deltas.iter().map(|d| d.max(0.0)).collect();
    let losses: Vec<f64> = deltas.iter().map(|d| (-d).max(0.0)).collect();
    let avg_gains = wilder(&gains, period)?;
    let avg_losses = wilder(&losses, period)?;
    Some(
        avg_gains
            .iter()
            .zip(avg_losses.iter())
            .map(|(gain, loss)| {
                if *loss == 0.0 {
                    if *gain == 0.0 {
                        50.0
                    } else {
                        100.0
                    }
                } else {
                    100.0 - 100.0 / (1.0 + gain / loss)
                }
            })
            .collect(),
    )
}

/// One point of the MACD line with its signal and histogram.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Moving average convergence/divergence.
#[must_use]
pub fn macd(
    values: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<Vec<MacdPoint>> {
    if fast_period == 0 || signal_period == 0 || slow_period <= fast_period {
        return None;
    }
    let fast = ema(values, fast_period)?;
    let slow = ema(values, slow_period)?;
    // The fast series starts earlier; line both up on the slow tail.
    let lead = slow_period - fast_period;
    let macd_line: Vec<f64> = slow
        .iter()
        .enumerate()
        .map(|(index, slow_value)| fast[index + lead] - slow_value)
        .collect();
    let signal_line = ema(&macd_line, signal_period)?;
    let skip = macd_line.len() - signal_line.len();
    Some(
        macd_line[skip..]
            .iter()
            .zip(signal_line.iter())
            .map(|(macd, signal)| MacdPoint {
                macd: *macd,
                signal: *signal,
                histogram: macd - signal,
            })
            .collect(),
    )
}

/// One stochastic oscillator point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StochPoint {
    pub k: f64,
    pub d: f64,
}

/// Stochastic oscillator: raw %K over `k_period` highs/lows, %D as the
/// SMA of %K over `d_period`. Bars without a high or low fall back to
/// their close.
#[must_use]
pub fn stochastic(bars: &[Bar], k_period: usize, d_period: usize) -> Option<Vec<StochPoint>> {
    if k_period == 0 || d_period == 0 || bars.len() + 1 < k_period + d_period {
        return None;
    }
    let k_values: Vec<f64> = bars
        .windows(k_period)
        .map(|window| {
            let close = window[window.len() - 1].close;
            let highest = window
                .iter()
                .map(|bar| bar.high.unwrap_or(bar.close))
                .fold(f64::NEG_INFINITY, f64::max);
            let lowest = window
                .iter()
                .map(|bar| bar.low.unwrap_or(bar.close))
                .fold(f64::INFINITY, f64::min);
            if highest == lowest {
                50.0
            } else {
                (close - lowest) / (highest - lowest) * 100.0
            }
        })
        .collect();
    let d_values = sma(&k_values, d_period)?;
    let skip = k_values.len() - d_values.len();
    Some(
        k_values[skip..]
            .iter()
            .zip(d_values)
            .map(|(k, d)| StochPoint { k: *k, d })
            .collect(),
    )
}

/// Average directional index (Wilder). Needs `2 * period` bars for the
/// first value.
#[must_use]
pub fn adx(bars: &[Bar], period: usize) -> Option<Vec<f64>> {
    if period == 0 || bars.len() < 2 * period {
        return None;
    }
    let mut true_ranges = Vec::with_capacity(bars.len() - 1);
    let mut plus_dms = Vec::with_capacity(bars.len() - 1);
    let mut minus_dms = Vec::with_capacity(bars.len() - 1);

    for pair in bars.windows(2) {
        let (prev, current) = (&pair[0], &pair[1]);
        let high = current.high.unwrap_or(current.close);
        let low = current.low.unwrap_or(current.close);
        let prev_high = prev.high.unwrap_or(prev.close);
        let prev_low = prev.low.unwrap_or(prev.close);

        let tr = (high - low)
            .max((high - prev.close).abs())
            .max((low - prev.close).abs());
        true_ranges.push(tr);

        let up = high - prev_high;
        let down = prev_low - low;
        plus_dms.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dms.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let smoothed_tr = wilder(&true_ranges, period)?;
    let smoothed_plus = wilder(&plus_dms, period)?;
    let smoothed_minus = wilder(&minus_dms, period)?;

    let dx_values: Vec<f64> = smoothed_tr
        .iter()
        .zip(smoothed_plus.iter().zip(smoothed_minus.iter()))
        .map(|(tr, (plus, minus))| {
            if *tr == 0.0 {
                return 0.0;
            }
            let plus_di = 100.0 * plus / tr;
            let minus_di = 100.0 * minus / tr;
            let sum = plus_di + minus_di;
            if sum == 0.0 {
                0.0
            } else {
                100.0 * (plus_di - minus_di).abs() / sum
            }
        })
        .collect();

    wilder(&dx_values, period)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<f64> {
        (0..len).map(|i| i as f64).collect()
    }

    fn trend_bars(len: usize) -> Vec<Bar> {
        (0..len)
            .map(|i| {
                let base = i as f64;
                Bar::ohlc(i as i64 * 60_000, base, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect()
    }

    #[test]
    fn sma_matches_hand_computation() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&values, 3), Some(vec![2.0, 3.0, 4.0]));
        assert_eq!(sma(&values, 6), None);
        assert_eq!(sma(&values, 0), None);
    }

    #[test]
    fn ema_seeds_with_the_first_window_average() {
        // seed = 2, k = 0.5: (4-2)*0.5+2 = 3, (5-3)*0.5+3 = 4
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(ema(&values, 3), Some(vec![2.0, 3.0, 4.0]));
        assert_eq!(ema(&values, 9), None);
    }

    #[test]
    fn rsi_saturates_in_one_way_markets() {
        let rising = ramp(30);
        let values = rsi(&rising, 14).unwrap();
        assert!(*values.last().unwrap() > 99.0);

        let falling: Vec<f64> = rising.iter().rev().copied().collect();
        let values = rsi(&falling, 14).unwrap();
        assert!(*values.last().unwrap() < 1.0);
    }

    #[test]
    fn rsi_requires_period_plus_one_samples() {
        assert!(rsi(&ramp(14), 14).is_none());
        assert!(rsi(&ramp(15), 14).is_some());
    }

    #[test]
    fn macd_is_positive_on_a_steady_uptrend() {
        let values = ramp(60);
        let points = macd(&values, 12, 26, 9).unwrap();
        // (60 - 26 + 1) macd values, minus the signal warm-up.
        assert_eq!(points.len(), 60 - 26 + 1 - 9 + 1);
        assert!(points.last().unwrap().macd > 0.0);
        assert!(macd(&values, 26, 12, 9).is_none());
    }

    #[test]
    fn stochastic_pins_high_in_an_uptrend() {
        let bars = trend_bars(30);
        let points = stochastic(&bars, 14, 3).unwrap();
        assert_eq!(points.len(), 30 - 14 + 1 - 3 + 1);
        let last = points.last().unwrap();
        assert!(last.k > 60.0);
        assert!(last.d > 60.0);
        assert!(stochastic(&bars[..15], 14, 3).is_none());
    }

    #[test]
    fn stochastic_is_neutral_when_the_window_is_flat() {
        let bars: Vec<Bar> = (0..20)
            .map(|i| Bar::ohlc(i * 60_000, 5.0, 5.0, 5.0, 5.0))
            .collect();
        let points = stochastic(&bars, 14, 3).unwrap();
        assert_eq!(points.last().unwrap().k, 50.0);
    }

    #[test]
    fn adx_saturates_in_a_strong_trend() {
        let bars = trend_bars(60);
        let values = adx(&bars, 14).unwrap();
        assert!(*values.last().unwrap() > 80.0);
    }

    #[test]
    fn adx_is_zero_on_a_flat_series() {
        let bars: Vec<Bar> = (0..60)
            .map(|i| Bar::ohlc(i * 60_000, 5.0, 5.0, 5.0, 5.0))
            .collect();
        let values = adx(&bars, 14).unwrap();
        assert_eq!(*values.last().unwrap(), 0.0);
    }

    #[test]
    fn adx_requires_two_periods_of_bars() {
        assert!(adx(&trend_bars(27), 14).is_none());
        assert!(adx(&trend_bars(28), 14).is_some());
    }
}

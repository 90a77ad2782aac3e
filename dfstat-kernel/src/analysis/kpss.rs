//! KPSS stationarity test.
//!
//! Null hypothesis: the series is stationary around a level (`Constant`) or
//! around a deterministic linear trend (`ConstantTrend`). Rejecting it at
//! the 5% level means the series shifted in a way a straight line does not
//! explain.

use super::StationarityTest;
use statistical::mean;

/// 5% critical values from Kwiatkowski et al. (1992), table 1.
const CRITICAL_5PCT_LEVEL: f64 = 0.463;
const CRITICAL_5PCT_TREND: f64 = 0.146;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KpssRegression {
    /// "c": level stationarity.
    Constant,
    /// "ct": trend stationarity.
    ConstantTrend,
}

impl KpssRegression {
    pub fn critical_value(self) -> f64 {
        match self {
            KpssRegression::Constant => CRITICAL_5PCT_LEVEL,
            KpssRegression::ConstantTrend => CRITICAL_5PCT_TREND,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KpssTest {
    pub regression: KpssRegression,
}

impl Default for KpssTest {
    fn default() -> Self {
        Self {
            regression: KpssRegression::ConstantTrend,
        }
    }
}

/// Newey-West truncation lag, `floor(12 * (n/100)^(1/4))`, capped at `n - 1`.
pub fn legacy_lags(n: usize) -> usize {
    let lags = (12.0 * (n as f64 / 100.0).powf(0.25)).floor() as usize;
    lags.min(n.saturating_sub(1))
}

fn residuals(series: &[f64], regression: KpssRegression) -> Vec<f64> {
    let y_bar = mean(series);
    match regression {
        KpssRegression::Constant => series.iter().map(|y| y - y_bar).collect(),
        KpssRegression::ConstantTrend => {
            let t: Vec<f64> = (1..=series.len()).map(|i| i as f64).collect();
            let t_bar = mean(&t);
            let sxy: f64 = t.iter().zip(series).map(|(ti, yi)| (ti - t_bar) * (yi - y_bar)).sum();
            let sxx: f64 = t.iter().map(|ti| (ti - t_bar).powi(2)).sum();
            let slope = sxy / sxx;
            let intercept = y_bar - slope * t_bar;
            t.iter().zip(series).map(|(ti, yi)| yi - intercept - slope * ti).collect()
        }
    }
}

/// KPSS statistic, or `None` when the series is too short or has no
/// variance left after detrending.
pub fn kpss_statistic(series: &[f64], regression: KpssRegression, lags: usize) -> Option<f64> {
    let n = series.len();
    if n < 3 {
        return None;
    }
    let e = residuals(series, regression);
    let nf = n as f64;

    let mut partial = 0.0;
    let mut eta = 0.0;
    for r in &e {
        partial += r;
        eta += partial * partial;
    }
    eta /= nf * nf;

    let mut long_run: f64 = e.iter().map(|r| r * r).sum();
    for k in 1..=lags.min(n - 1) {
        let weight = 1.0 - k as f64 / (lags as f64 + 1.0);
        let autocov: f64 = (k..n).map(|t| e[t] * e[t - k]).sum();
        long_run += 2.0 * weight * autocov;
    }
    long_run /= nf;

    if long_run <= f64::EPSILON {
        return None;
    }
    Some(eta / long_run)
}

impl StationarityTest for KpssTest {
    fn is_non_stationary(&self, series: &[f64]) -> bool {
        match kpss_statistic(series, self.regression, legacy_lags(series.len())) {
            Some(stat) => stat > self.regression.critical_value(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: usize, high: f64, low: f64) -> Vec<f64> {
        (0..n).map(|i| if i < n / 2 { high } else { low }).collect()
    }

    #[test]
    fn test_lag_rule() {
        assert_eq!(legacy_lags(100), 12);
        assert_eq!(legacy_lags(20), 8);
        // capped by the series length
        assert_eq!(legacy_lags(5), 4);
        assert_eq!(legacy_lags(1), 0);
    }

    #[test]
    fn test_level_shift_statistic() {
        let series = step(100, 100.0, 50.0);
        let stat = kpss_statistic(&series, KpssRegression::Constant, 12).unwrap();
        assert!((stat - 0.7363).abs() < 1e-3, "stat = {stat}");

        let test = KpssTest {
            regression: KpssRegression::Constant,
        };
        assert!(test.is_non_stationary(&series));
    }

    #[test]
    fn test_flat_series_is_stationary() {
        let flat = vec![1000.0; 20];
        assert_eq!(kpss_statistic(&flat, KpssRegression::Constant, 4), None);
        assert!(!KpssTest::default().is_non_stationary(&flat));
    }

    #[test]
    fn test_straight_line_is_trend_stationary() {
        let line: Vec<f64> = (0..30).map(|i| 5000.0 - 40.0 * i as f64).collect();
        assert!(!KpssTest::default().is_non_stationary(&line));
    }

    #[test]
    fn test_short_series_never_rejects() {
        assert!(!KpssTest::default().is_non_stationary(&[10.0, 1.0]));
        assert!(!KpssTest::default().is_non_stationary(&[]));
    }
}

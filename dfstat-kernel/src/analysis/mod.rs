/**
 * TREND ANALYZER - decides whether a partition is draining abnormally
 *
 * ROLE : pure function of a measurement window (oldest first). No I/O, no
 * clock, safe to run next to polling.
 *
 * Sign convention: drained fraction of available space,
 * `(first - last) / first`. Positive when space disappears; an alert fires
 * only when it is strictly greater than `drop_threshold`.
 */

pub mod kpss;

use crate::config::AnalysisSettings;
use crate::models::Measurement;
use serde::Serialize;
use std::sync::Arc;

pub use kpss::KpssTest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictReason {
    None,
    NonStationaryDrop,
    HighOccupancy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendVerdict {
    pub alert: bool,
    pub percent_occupied: f64,
    pub reason: VerdictReason,
}

impl TrendVerdict {
    pub fn quiet() -> Self {
        Self {
            alert: false,
            percent_occupied: 0.0,
            reason: VerdictReason::None,
        }
    }

    fn fire(latest: &Measurement, reason: VerdictReason) -> Self {
        Self {
            alert: true,
            percent_occupied: percent_occupied(latest),
            reason,
        }
    }
}

/// Secondary confirmation on the available-space series.
pub trait StationarityTest: Send + Sync {
    fn is_non_stationary(&self, series: &[f64]) -> bool;
}

/// `used / size * 100`, rounded up.
pub fn percent_occupied(m: &Measurement) -> f64 {
    if m.partition_size == 0 {
        return 0.0;
    }
    (m.used as f64 * 100.0 / m.partition_size as f64).ceil()
}

/// `(first - last) / first`, `None` when `first` is zero.
pub fn drained_fraction(first: u64, last: u64) -> Option<f64> {
    if first == 0 {
        return None;
    }
    Some((first as f64 - last as f64) / first as f64)
}

/// Tiered occupancy limits: small partitions may fill to `small_limit`
/// percent, those above `large_partition_kb` to `large_limit`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccupancyPolicy {
    pub large_partition_kb: u64,
    pub small_limit: f64,
    pub large_limit: f64,
}

impl Default for OccupancyPolicy {
    fn default() -> Self {
        Self {
            // 20 TiB in 1024-byte blocks
            large_partition_kb: 20 * 1024 * 1024 * 1024,
            small_limit: 80.0,
            large_limit: 90.0,
        }
    }
}

impl OccupancyPolicy {
    pub fn limit_for(&self, partition_size: u64) -> f64 {
        if partition_size > self.large_partition_kb {
            self.large_limit
        } else {
            self.small_limit
        }
    }

    pub fn exceeded(&self, latest: &Measurement) -> bool {
        percent_occupied(latest) > self.limit_for(latest.partition_size)
    }
}

#[derive(Clone)]
pub struct TrendAnalyzer {
    drop_threshold: f64,
    min_points: usize,
    confirmation: Option<Arc<dyn StationarityTest>>,
    occupancy: Option<OccupancyPolicy>,
}

impl TrendAnalyzer {
    pub fn new(drop_threshold: f64, min_points: usize) -> Self {
        Self {
            drop_threshold,
            min_points,
            confirmation: None,
            occupancy: None,
        }
    }

    pub fn from_settings(settings: &AnalysisSettings) -> Self {
        let mut analyzer = Self::new(settings.drop_threshold, settings.min_points);
        if settings.confirm_stationarity {
            analyzer = analyzer.with_confirmation(Arc::new(KpssTest::default()));
        }
        if settings.occupancy_check {
            analyzer = analyzer.with_occupancy(OccupancyPolicy::default());
        }
        analyzer
    }

    /// Require the stationarity test (and a falling last step) before a drop alerts.
    pub fn with_confirmation(mut self, test: Arc<dyn StationarityTest>) -> Self {
        self.confirmation = Some(test);
        self
    }

    pub fn with_occupancy(mut self, policy: OccupancyPolicy) -> Self {
        self.occupancy = Some(policy);
        self
    }

    pub fn min_points(&self) -> usize {
        self.min_points
    }

    pub fn evaluate(&self, window: &[Measurement]) -> TrendVerdict {
        let series: Vec<&Measurement> = window.iter().filter(|m| m.error_code == 0).collect();
        let (Some(first), Some(latest)) = (series.first(), series.last()) else {
            return TrendVerdict::quiet();
        };
        if series.len() < self.min_points {
            return TrendVerdict::quiet();
        }

        if self.is_draining(&series, first, latest) {
            return TrendVerdict::fire(latest, VerdictReason::NonStationaryDrop);
        }
        if let Some(policy) = &self.occupancy {
            if policy.exceeded(latest) {
                return TrendVerdict::fire(latest, VerdictReason::HighOccupancy);
            }
        }
        TrendVerdict::quiet()
    }

    fn is_draining(&self, series: &[&Measurement], first: &Measurement, latest: &Measurement) -> bool {
        let Some(drained) = drained_fraction(first.available, latest.available) else {
            return false;
        };
        if drained <= self.drop_threshold {
            return false;
        }

        let Some(test) = &self.confirmation else {
            return true;
        };
        let falling = match series {
            [.., before, now] => before.available > now.available,
            _ => false,
        };
        let available: Vec<f64> = series.iter().map(|m| m.available as f64).collect();
        falling && test.is_non_stationary(&available)
    }
}

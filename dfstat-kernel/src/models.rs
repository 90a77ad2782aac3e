use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;

/// host -> mount points to watch on that host.
pub type Targets = BTreeMap<String, BTreeSet<String>>;

/// Number of (host, partition) pairs in a target map.
pub fn pair_count(targets: &Targets) -> usize {
    targets.values().map(BTreeSet::len).sum()
}

/// One partition line of a `df -P` report, in 1024-byte blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionUsage {
    pub size: u64,
    pub used: u64,
    pub available: u64,
}

/// A successful measurement row; `error_code` is always 0 for rows read back
/// through `MeasurementStore::recent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub host: String,
    pub partition: String,
    pub partition_size: u64,
    pub used: u64,
    pub available: u64,
    pub error_code: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub measured_at: OffsetDateTime,
}

/// An audit row written when a host could not be measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub host: String,
    pub error_code: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub measured_at: OffsetDateTime,
}

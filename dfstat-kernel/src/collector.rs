/**
 * COLLECTOR - one poll cycle over the whole fleet
 *
 * ROLE : query every host concurrently (bounded), then apply the outcomes
 * to the store and the health tracker one at a time.
 *
 * Worker tasks only do remote I/O and parsing; they never touch the store.
 * A host failing, hanging or returning garbage never stops the others.
 * On shutdown the remaining hosts get `shutdown_grace` to answer, then
 * they are abandoned; what already arrived is persisted.
 */

use crate::error::{StorageError, TransportError};
use crate::health::{Escalation, HostHealthRecord, HostHealthTracker};
use crate::models::{PartitionUsage, Targets};
use crate::parser;
use crate::remote::RemoteExec;
use crate::store::MeasurementStore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum HostOutcome {
    /// Host answered; possibly with none of the watched partitions.
    Measured(BTreeMap<String, PartitionUsage>),
    Failed(TransportError),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PollReport {
    pub hosts_polled: usize,
    pub measurements: usize,
    pub failed_hosts: Vec<String>,
    /// Reachable hosts that reported none of their partitions.
    pub empty_hosts: Vec<String>,
    /// Hosts still outstanding when the shutdown grace period ran out.
    pub abandoned_hosts: Vec<String>,
    /// Unreachable-host alerts due this cycle.
    #[serde(skip)]
    pub escalations: Vec<HostHealthRecord>,
}

pub struct Collector {
    remote: Arc<dyn RemoteExec>,
    command: String,
    remote_timeout: Duration,
    max_concurrent: usize,
    shutdown_grace: Duration,
}

impl Collector {
    pub fn new(
        remote: Arc<dyn RemoteExec>,
        command: impl Into<String>,
        remote_timeout: Duration,
        max_concurrent: usize,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            remote,
            command: command.into(),
            remote_timeout,
            max_concurrent: max_concurrent.max(1),
            shutdown_grace,
        }
    }

    pub async fn poll_once(
        &self,
        targets: &Targets,
        store: &MeasurementStore,
        tracker: &HostHealthTracker,
        shutdown: &CancellationToken,
    ) -> Result<PollReport, StorageError> {
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        let mut pending: HashSet<String> = HashSet::new();

        for (host, partitions) in targets {
            let remote = self.remote.clone();
            let permits = permits.clone();
            let command = self.command.clone();
            let timeout = self.remote_timeout;
            let host = host.clone();
            let partitions = partitions.clone();
            pending.insert(host.clone());

            tasks.spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let outcome = fetch_host(remote.as_ref(), &host, &command, &partitions, timeout).await;
                (host, outcome)
            });
        }

        let mut report = PollReport::default();
        let mut deadline: Option<Instant> = None;

        loop {
            let joined = match deadline {
                None => tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = shutdown.cancelled() => {
                        warn!(pending = pending.len(), grace = ?self.shutdown_grace, "shutdown during poll, waiting for in-flight hosts");
                        deadline = Some(Instant::now() + self.shutdown_grace);
                        continue;
                    }
                },
                Some(at) => match tokio::time::timeout_at(at, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tasks.abort_all();
                        let mut abandoned: Vec<String> = pending.drain().collect();
                        abandoned.sort();
                        warn!(hosts = ?abandoned, "abandoning hosts after shutdown grace");
                        report.abandoned_hosts = abandoned;
                        break;
                    }
                },
            };

            let Some(joined) = joined else { break };
            match joined {
                Ok((host, outcome)) => {
                    pending.remove(&host);
                    apply(&host, outcome, store, tracker, &mut report)?;
                }
                Err(e) => error!(error = %e, "poll task did not complete"),
            }
        }

        // abandoned hosts never reported back
        report.hosts_polled = targets.len() - report.abandoned_hosts.len();
        report.failed_hosts.sort();
        report.empty_hosts.sort();
        info!(
            hosts = report.hosts_polled,
            measurements = report.measurements,
            failed = report.failed_hosts.len(),
            "poll cycle finished"
        );
        Ok(report)
    }
}

async fn fetch_host(
    remote: &dyn RemoteExec,
    host: &str,
    command: &str,
    partitions: &BTreeSet<String>,
    timeout: Duration,
) -> HostOutcome {
    let exec = match tokio::time::timeout(timeout, remote.exec(host, command)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            host: host.to_string(),
            timeout,
        }),
    };

    match exec {
        Ok(out) if out.ok() => {
            let lines: Vec<&str> = out.stdout.lines().skip(1).collect();
            HostOutcome::Measured(parser::parse(&lines, partitions))
        }
        Ok(out) => HostOutcome::Failed(TransportError::NonZeroExit {
            host: host.to_string(),
            code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        }),
        Err(e) => HostOutcome::Failed(e),
    }
}

fn apply(
    host: &str,
    outcome: HostOutcome,
    store: &MeasurementStore,
    tracker: &HostHealthTracker,
    report: &mut PollReport,
) -> Result<(), StorageError> {
    match outcome {
        HostOutcome::Measured(usage) => {
            if let Some(closed) = tracker.on_success(host) {
                info!(%host, failures = closed.consecutive_failures, "host reachable again");
            }
            if usage.is_empty() {
                warn!(%host, "host answered but reported none of its partitions");
                report.empty_hosts.push(host.to_string());
            }
            for (partition, u) in &usage {
                store.record(host, partition, u.size, u.used, u.available)?;
                report.measurements += 1;
            }
        }
        HostOutcome::Failed(err) => {
            warn!(%host, code = err.code(), error = %err, "poll failed");
            store.record_error(host, err.code())?;
            match tracker.on_failure(host, err.code()) {
                Escalation::Notify(record) => report.escalations.push(record),
                Escalation::Suppressed => debug!(%host, "unreachable alert suppressed by cooldown"),
                Escalation::BelowThreshold => {}
            }
            report.failed_hosts.push(host.to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CODE_TIMEOUT;
    use crate::health::EscalationPolicy;
    use crate::remote::ExecOutput;
    use async_trait::async_trait;
    use dfstat_devkit::DfReportBuilder;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted fleet: per-host canned answers, `None` means hang forever.
    #[derive(Default)]
    struct FakeFleet {
        answers: Mutex<HashMap<String, Option<Result<ExecOutput, i32>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFleet {
        fn report(&self, host: &str, stdout: String) {
            self.answers.lock().insert(
                host.into(),
                Some(Ok(ExecOutput {
                    exit_code: 0,
                    stdout,
                    stderr: String::new(),
                })),
            );
        }

        fn exit(&self, host: &str, code: i32) {
            self.answers.lock().insert(
                host.into(),
                Some(Ok(ExecOutput {
                    exit_code: code,
                    stdout: String::new(),
                    stderr: "ssh: connect to host refused".into(),
                })),
            );
        }

        fn hang(&self, host: &str) {
            self.answers.lock().insert(host.into(), None);
        }

        fn spawn_failure(&self, host: &str) {
            self.answers.lock().insert(host.into(), Some(Err(127)));
        }
    }

    #[async_trait]
    impl RemoteExec for FakeFleet {
        async fn exec(&self, host: &str, command: &str) -> Result<ExecOutput, TransportError> {
            assert_eq!(command, "df -P");
            self.calls.lock().push(host.to_string());
            let answer = self.answers.lock().get(host).cloned().flatten();
            match answer {
                Some(Ok(out)) => Ok(out),
                Some(Err(_)) => Err(TransportError::Spawn {
                    host: host.into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "ssh"),
                }),
                None => std::future::pending().await,
            }
        }
    }

    fn targets(pairs: &[(&str, &[&str])]) -> Targets {
        pairs
            .iter()
            .map(|(h, parts)| (h.to_string(), parts.iter().map(|p| p.to_string()).collect()))
            .collect()
    }

    fn tracker(threshold: u32) -> HostHealthTracker {
        HostHealthTracker::new(EscalationPolicy {
            threshold,
            repeat_interval: time::Duration::hours(1),
        })
    }

    fn collector(fleet: Arc<FakeFleet>) -> Collector {
        Collector::new(fleet, "df -P", Duration::from_secs(30), 4, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_records_watched_partitions() {
        let fleet = Arc::new(FakeFleet::default());
        fleet.report(
            "alpha",
            DfReportBuilder::new()
                .partition("/", 100, 50, 50)
                .partition("/home", 2000, 500, 1500)
                .build(),
        );
        let store = MeasurementStore::open_in_memory().unwrap();
        let health = tracker(3);

        let report = collector(fleet)
            .poll_once(&targets(&[("alpha", &["/home"])]), &store, &health, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.measurements, 1);
        assert!(report.failed_hosts.is_empty());
        let rows = store.recent("alpha", "/home", 5).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].partition_size, rows[0].used, rows[0].available), (2000, 500, 1500));
        assert!(store.recent("alpha", "/", 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_host_does_not_stop_others() {
        let fleet = Arc::new(FakeFleet::default());
        fleet.exit("alpha", 255);
        fleet.spawn_failure("beta");
        fleet.report("gamma", DfReportBuilder::new().partition("/data", 10, 1, 9).build());
        let store = MeasurementStore::open_in_memory().unwrap();
        let health = tracker(3);

        let report = collector(fleet.clone())
            .poll_once(
                &targets(&[("alpha", &["/home"]), ("beta", &["/"]), ("gamma", &["/data"])]),
                &store,
                &health,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.failed_hosts, vec!["alpha", "beta"]);
        assert_eq!(report.measurements, 1);
        assert_eq!(store.recent_errors("alpha", 5).unwrap()[0].error_code, 255);
        assert_eq!(store.recent_errors("beta", 5).unwrap()[0].error_code, 127);
        assert_eq!(health.get("alpha").unwrap().consecutive_failures, 1);
        assert!(health.get("gamma").is_none());
        assert_eq!(fleet.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_reachable_host_with_nothing_to_report() {
        let fleet = Arc::new(FakeFleet::default());
        fleet.report("alpha", DfReportBuilder::new().partition("/var", 10, 1, 9).build());
        let store = MeasurementStore::open_in_memory().unwrap();
        let health = tracker(3);
        health.on_failure("alpha", 255);

        let report = collector(fleet)
            .poll_once(&targets(&[("alpha", &["/home"])]), &store, &health, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.empty_hosts, vec!["alpha"]);
        assert!(report.failed_hosts.is_empty());
        // reachable counts as success for host health
        assert!(health.get("alpha").is_none());
        assert_eq!(store.row_count().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_host_times_out_without_blocking_others() {
        let fleet = Arc::new(FakeFleet::default());
        fleet.hang("alpha");
        fleet.report("beta", DfReportBuilder::new().partition("/", 10, 1, 9).build());
        let store = MeasurementStore::open_in_memory().unwrap();
        let health = tracker(3);

        let report = Collector::new(fleet, "df -P", Duration::from_secs(30), 1, Duration::from_secs(5))
            .poll_once(&targets(&[("alpha", &["/"]), ("beta", &["/"])]), &store, &health, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed_hosts, vec!["alpha"]);
        assert_eq!(report.hosts_polled, 2);
        assert_eq!(report.measurements, 1);
        assert_eq!(store.recent_errors("alpha", 1).unwrap()[0].error_code, CODE_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_after_grace_and_keeps_partial_results() {
        let fleet = Arc::new(FakeFleet::default());
        fleet.hang("alpha");
        fleet.report("beta", DfReportBuilder::new().partition("/", 10, 1, 9).build());
        let store = MeasurementStore::open_in_memory().unwrap();
        let health = tracker(3);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = Collector::new(fleet, "df -P", Duration::from_secs(600), 4, Duration::from_secs(2))
            .poll_once(&targets(&[("alpha", &["/"]), ("beta", &["/"])]), &store, &health, &shutdown)
            .await
            .unwrap();

        assert_eq!(report.abandoned_hosts, vec!["alpha"]);
        assert_eq!(report.hosts_polled, 1);
        assert!(report.failed_hosts.is_empty());
        assert_eq!(store.recent("beta", "/", 1).unwrap().len(), 1);
        // abandoned is not a host failure
        assert!(health.get("alpha").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_escalates_once() {
        let fleet = Arc::new(FakeFleet::default());
        fleet.exit("alpha", 255);
        let store = MeasurementStore::open_in_memory().unwrap();
        let health = tracker(3);
        let collector = collector(fleet);
        let fleet_targets = targets(&[("alpha", &["/home"])]);

        let mut escalations = 0;
        for _ in 0..5 {
            let report = collector
                .poll_once(&fleet_targets, &store, &health, &CancellationToken::new())
                .await
                .unwrap();
            escalations += report.escalations.len();
        }
        assert_eq!(escalations, 1);
        assert_eq!(store.recent_errors("alpha", 10).unwrap().len(), 5);
    }
}

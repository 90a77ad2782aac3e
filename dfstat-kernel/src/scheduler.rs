/**
 * SCHEDULER - the daemon loop
 *
 * ROLE : owns everything built from the configuration (`DaemonContext`)
 * and drives STARTING -> POLLING -> SLEEPING -> ... -> SHUTTING_DOWN.
 *
 * Control messages (poll now, reload, shutdown) interrupt the sleep
 * immediately. A reload that fails keeps the running context; host health
 * and alert cooldowns always survive it. Storage errors end the loop after
 * the shutdown steps have been attempted.
 */

use crate::analysis::{TrendAnalyzer, TrendVerdict};
use crate::collector::Collector;
use crate::config::Settings;
use crate::error::{ConfigError, DaemonError, StorageError};
use crate::health::{HostHealthRecord, HostHealthTracker};
use crate::inventory::{TargetSource, TomlInventory};
use crate::models::{pair_count, Targets};
use crate::notifier::{AlertDispatcher, Notifier, RelayNotifier};
use crate::remote::{RemoteExec, SshExec};
use crate::state::{new_state, CycleSummary, DaemonStatus, SchedulerState, Shared};
use crate::store::MeasurementStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    PollNow,
    Reload,
    Shutdown,
}

/// Where configuration and collaborators come from.
pub trait Environment: Send + Sync {
    fn load_settings(&self) -> Result<Settings, ConfigError>;
    fn remote_exec(&self, settings: &Settings) -> Result<Arc<dyn RemoteExec>, ConfigError>;
    fn notifier(&self, settings: &Settings) -> Arc<dyn Notifier>;
    fn target_source(&self, settings: &Settings) -> Arc<dyn TargetSource>;
}

/// Production wiring: TOML files, ssh, and the TCP relay.
pub struct SystemEnvironment {
    config_path: PathBuf,
}

impl SystemEnvironment {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }
}

impl Environment for SystemEnvironment {
    fn load_settings(&self) -> Result<Settings, ConfigError> {
        Settings::load(&self.config_path)
    }

    fn remote_exec(&self, settings: &Settings) -> Result<Arc<dyn RemoteExec>, ConfigError> {
        Ok(Arc::new(SshExec::from_shell_line(&settings.poll.remote_shell)?))
    }

    fn notifier(&self, settings: &Settings) -> Arc<dyn Notifier> {
        Arc::new(RelayNotifier::new(
            settings.alerts.relay_addr.clone(),
            settings.alerts.relay_timeout(),
        ))
    }

    fn target_source(&self, settings: &Settings) -> Arc<dyn TargetSource> {
        Arc::new(TomlInventory::new(settings.inventory.path.clone()))
    }
}

/// Everything derived from one configuration load, immutable for a cycle.
pub struct DaemonContext {
    pub settings: Settings,
    pub targets: Targets,
    collector: Collector,
    analyzer: TrendAnalyzer,
    dispatcher: AlertDispatcher,
}

impl DaemonContext {
    pub fn build(env: &dyn Environment, settings: Settings, alerts_in_flight: &TaskTracker) -> Result<Self, ConfigError> {
        let targets = env.target_source(&settings).list_targets()?;
        let poll = &settings.poll;
        let collector = Collector::new(
            env.remote_exec(&settings)?,
            poll.command.clone(),
            poll.remote_timeout(),
            poll.max_concurrent_hosts,
            poll.shutdown_grace(),
        );
        let analyzer = TrendAnalyzer::from_settings(&settings.analysis);
        let dispatcher = AlertDispatcher::new(
            env.notifier(&settings),
            settings.alerts.recipients.clone(),
            alerts_in_flight.clone(),
        );
        Ok(Self {
            settings,
            targets,
            collector,
            analyzer,
            dispatcher,
        })
    }
}

/// Cooldown for partition alerts, keyed by (host, partition).
#[derive(Debug, Default)]
pub struct AlertLedger {
    sent: HashMap<(String, String), OffsetDateTime>,
}

impl AlertLedger {
    pub fn should_send(&mut self, host: &str, partition: &str, now: OffsetDateTime, repeat: time::Duration) -> bool {
        let key = (host.to_string(), partition.to_string());
        match self.sent.get(&key) {
            Some(sent) if now - *sent <= repeat => false,
            _ => {
                self.sent.insert(key, now);
                true
            }
        }
    }

    pub fn clear(&mut self, host: &str, partition: &str) {
        self.sent.remove(&(host.to_string(), partition.to_string()));
    }

    /// Forget pairs that are no longer configured.
    pub fn retain_targets(&mut self, targets: &Targets) {
        self.sent
            .retain(|(host, partition), _| targets.get(host).is_some_and(|p| p.contains(partition)));
    }
}

pub fn trend_alert_text(host: &str, partition: &str, verdict: &TrendVerdict) -> (String, String) {
    (
        format!("Check {partition} on {host}"),
        format!("The diskspace is {:.0}% occupied.", verdict.percent_occupied),
    )
}

pub fn host_alert_text(record: &HostHealthRecord) -> (String, String) {
    let since = record
        .first_failure_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| record.first_failure_at.to_string());
    (
        format!("{} is unreachable", record.host),
        format!(
            "{} consecutive failed polls since {} (last exit code {}).",
            record.consecutive_failures, since, record.last_error_code
        ),
    )
}

pub struct Scheduler {
    env: Arc<dyn Environment>,
    store: Arc<MeasurementStore>,
    tracker: HostHealthTracker,
    ctx: DaemonContext,
    ledger: AlertLedger,
    alerts_in_flight: TaskTracker,
    status: Shared<DaemonStatus>,
}

impl Scheduler {
    /// STARTING: build the context from already-loaded settings and persist the targets.
    pub fn start(
        env: Arc<dyn Environment>,
        settings: Settings,
        store: Arc<MeasurementStore>,
        tracker: HostHealthTracker,
    ) -> Result<Self, DaemonError> {
        let alerts_in_flight = TaskTracker::new();
        let ctx = DaemonContext::build(env.as_ref(), settings, &alerts_in_flight)?;
        store.sync_targets(&ctx.targets)?;
        tracker.set_policy(ctx.settings.alerts.escalation_policy());
        info!(
            hosts = ctx.targets.len(),
            partitions = pair_count(&ctx.targets),
            "targets loaded"
        );

        Ok(Self {
            env,
            store,
            tracker,
            ctx,
            ledger: AlertLedger::default(),
            alerts_in_flight,
            status: new_state(DaemonStatus::new()),
        })
    }

    pub fn status(&self) -> Shared<DaemonStatus> {
        self.status.clone()
    }

    fn set_state(&self, state: SchedulerState) {
        debug!(?state, "scheduler state");
        self.status.lock().state = state;
    }

    pub async fn run(mut self, mut control: mpsc::Receiver<Control>, shutdown: CancellationToken) -> Result<(), StorageError> {
        let mut state = SchedulerState::Polling;
        let mut outcome = Ok(());

        loop {
            self.set_state(state);
            state = match state {
                SchedulerState::Starting => match self.reload() {
                    Ok(_) => SchedulerState::Polling,
                    Err(e) => {
                        outcome = Err(e);
                        SchedulerState::ShuttingDown
                    }
                },
                SchedulerState::Polling => match self.run_cycle(&shutdown).await {
                    Ok(_) if shutdown.is_cancelled() => SchedulerState::ShuttingDown,
                    Ok(_) => SchedulerState::Sleeping,
                    Err(e) => {
                        error!(error = %e, "storage failure, shutting down");
                        outcome = Err(e);
                        SchedulerState::ShuttingDown
                    }
                },
                SchedulerState::Sleeping => {
                    let interval = self.ctx.settings.poll.interval();
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => SchedulerState::Polling,
                        _ = shutdown.cancelled() => SchedulerState::ShuttingDown,
                        msg = control.recv() => match msg {
                            Some(Control::PollNow) => {
                                info!("poll requested");
                                SchedulerState::Polling
                            }
                            Some(Control::Reload) => {
                                info!("reload requested");
                                SchedulerState::Starting
                            }
                            Some(Control::Shutdown) | None => SchedulerState::ShuttingDown,
                        },
                    }
                }
                SchedulerState::ShuttingDown => break,
            };
        }

        self.finish().await;
        outcome
    }

    /// SHUTTING_DOWN: drain alert sends, persist host health, checkpoint the store.
    async fn finish(&self) {
        info!("shutting down");
        AlertDispatcher::drain(&self.alerts_in_flight, self.ctx.settings.poll.shutdown_grace()).await;

        if let Some(path) = &self.ctx.settings.store.health_state_path {
            if let Err(e) = self.tracker.save_to(path).await {
                warn!(error = %e, "host health not saved");
            }
        }
        if let Err(e) = self.store.close() {
            error!(error = %e, "store checkpoint failed");
        }
    }

    /// One POLLING pass: collect, escalate unreachable hosts, analyze, prune.
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> Result<CycleSummary, StorageError> {
        let cycle_id = Uuid::new_v4().to_string();
        let span = info_span!("cycle", id = %&cycle_id[..8]);
        let started_at = OffsetDateTime::now_utc();
        let clock = std::time::Instant::now();

        let report = self
            .ctx
            .collector
            .poll_once(&self.ctx.targets, &self.store, &self.tracker, shutdown)
            .instrument(span.clone())
            .await?;

        let _entered = span.enter();
        for record in &report.escalations {
            warn!(host = %record.host, failures = record.consecutive_failures, "host unreachable");
            let (subject, body) = host_alert_text(record);
            self.ctx.dispatcher.dispatch(&subject, &body);
        }

        let mut trend_alerts = 0;
        let mut pruned = 0;
        if !shutdown.is_cancelled() {
            trend_alerts = self.analyze()?;
            let analysis = &self.ctx.settings.analysis;
            pruned = self.store.prune(self.ctx.settings.store.retention(), analysis.window_size)?;
        }

        let summary = CycleSummary {
            cycle_id,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            hosts_polled: report.hosts_polled,
            measurements: report.measurements,
            failed_hosts: report.failed_hosts,
            trend_alerts,
            host_alerts: report.escalations.len(),
            pruned,
        };
        let mut status = self.status.lock();
        status.cycles += 1;
        status.last_cycle = Some(summary.clone());
        Ok(summary)
    }

    fn analyze(&mut self) -> Result<usize, StorageError> {
        let window_size = self.ctx.settings.analysis.window_size;
        let repeat = self.ctx.settings.alerts.escalation_policy().repeat_interval;
        let now = OffsetDateTime::now_utc();
        let mut fired = 0;

        for (host, partitions) in &self.ctx.targets {
            for partition in partitions {
                let window = self.store.recent(host, partition, window_size)?;
                if window.len() < self.ctx.analyzer.min_points() {
                    continue;
                }
                let verdict = self.ctx.analyzer.evaluate(&window);
                if !verdict.alert {
                    self.ledger.clear(host, partition);
                    continue;
                }
                if !self.ledger.should_send(host, partition, now, repeat) {
                    debug!(%host, %partition, "partition alert suppressed by cooldown");
                    continue;
                }
                warn!(
                    %host,
                    %partition,
                    occupied = verdict.percent_occupied,
                    reason = ?verdict.reason,
                    "partition alert"
                );
                let (subject, body) = trend_alert_text(host, partition, &verdict);
                self.ctx.dispatcher.dispatch(&subject, &body);
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Re-read configuration and inventory. A `ConfigError` keeps the
    /// running context and returns `Ok(false)`.
    pub fn reload(&mut self) -> Result<bool, StorageError> {
        let ctx = match self
            .env
            .load_settings()
            .and_then(|settings| DaemonContext::build(self.env.as_ref(), settings, &self.alerts_in_flight))
        {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "reload rejected, keeping previous configuration");
                return Ok(false);
            }
        };

        if ctx.settings.store.path != self.ctx.settings.store.path {
            warn!("store.path changed; the new path takes effect after a restart");
        }
        self.store.sync_targets(&ctx.targets)?;
        self.tracker.set_policy(ctx.settings.alerts.escalation_policy());
        self.ledger.retain_targets(&ctx.targets);
        self.status.lock().reloads += 1;
        info!(
            hosts = ctx.targets.len(),
            partitions = pair_count(&ctx.targets),
            "configuration reloaded"
        );
        self.ctx = ctx;
        Ok(true)
    }
}

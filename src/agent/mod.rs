pub mod stats;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::flow::attribution::AttributionResolver;
use crate::flow::tracker::{FlowSample, Tracker};
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::proc::{IdentityCache, ProcessIdentity};
use crate::publish::{ChangeEvent, ConnectionUpdate, Publisher};
use crate::rollup::engine::AggregationEngine;
use crate::rollup::{AppSample, GlobalSample, SampleBatch};
use crate::snapshot::{ProcNetSource, SnapshotSource};
use crate::store::{ClickHouseStore, MemoryStore, RollupStore, StoreBatch, StoreWriter};
use crate::trace::{self, IngestTotals, TraceSource};

use self::stats::CycleStats;

/// Agent orchestrates all components: snapshot polling, attribution,
/// aggregation, persistence, publishing, and the health endpoint.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    cache: Arc<IdentityCache>,
    tracker: Arc<Tracker>,
    publisher: Arc<Publisher>,
    store: Option<Arc<RollupStore>>,
    snapshot_source: Option<Box<dyn SnapshotSource>>,
    resolver: Option<AttributionResolver>,
    trace_source: Option<Box<dyn TraceSource>>,
    stats: Arc<CycleStats>,
    cancel: CancellationToken,
    poll_task: Option<tokio::task::JoinHandle<()>>,
    writer_task: Option<tokio::task::JoinHandle<()>>,
    ingest_task: Option<tokio::task::JoinHandle<IngestTotals>>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let cache = Arc::new(IdentityCache::new(cfg.identity_cache.capacity));
        let tracker = Arc::new(Tracker::new(cfg.poll.grace_polls));
        let publisher = Arc::new(Publisher::new(cfg.publisher.buffer));

        Ok(Self {
            cfg,
            health,
            cache,
            tracker,
            publisher,
            store: None,
            snapshot_source: Some(Box::new(ProcNetSource::new())),
            resolver: Some(AttributionResolver::new()),
            trace_source: None,
            stats: Arc::new(CycleStats::new()),
            cancel: CancellationToken::new(),
            poll_task: None,
            writer_task: None,
            ingest_task: None,
        })
    }

    /// Replaces the flow table source. Must be called before `start`.
    pub fn set_snapshot_source(&mut self, source: Box<dyn SnapshotSource>) {
        self.snapshot_source = Some(source);
    }

    /// Replaces the attribution resolver. Must be called before `start`.
    pub fn set_attribution_resolver(&mut self, resolver: AttributionResolver) {
        self.resolver = Some(resolver);
    }

    /// Attaches a supplementary trace source. Must be called before `start`.
    pub fn attach_trace_source(&mut self, source: Box<dyn TraceSource>) {
        self.trace_source = Some(source);
    }

    /// Registers a change-event subscriber.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
        self.publisher.subscribe()
    }

    /// The durable store, available after `start`.
    pub fn store(&self) -> Option<Arc<RollupStore>> {
        self.store.as_ref().map(Arc::clone)
    }

    /// Start all components and begin observation.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond during setup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 2. Durable store.
        let store = if self.cfg.store.clickhouse.enabled {
            let ch = ClickHouseStore::new(&self.cfg.store.clickhouse);
            ch.connect().await.context("connecting to ClickHouse")?;
            info!(
                endpoint = %self.cfg.store.clickhouse.endpoint,
                "ClickHouse store connected",
            );

            if self.cfg.store.clickhouse.migrations.enabled {
                let migrator = ClickHouseMigrator::new(ch.pool().clone());
                migrator.up().await.context("applying store migrations")?;
            }

            RollupStore::ClickHouse(ch)
        } else {
            warn!("no durable store configured, aggregates will not survive restart");
            RollupStore::Memory(MemoryStore::new())
        };
        let store = Arc::new(store);
        self.store = Some(Arc::clone(&store));

        // 3. Store writer task. The poll loop owns the only sender, so the
        // writer drains naturally once the loop shuts down.
        let (batch_tx, batch_rx) = mpsc::channel::<StoreBatch>(64);
        self.writer_task = Some(spawn_store_writer(
            Arc::clone(&store),
            batch_rx,
            StoreWriter::new(
                self.cfg.store.clickhouse.write_attempts,
                self.cfg.store.clickhouse.write_backoff,
            ),
            Arc::clone(&self.health),
        ));

        // 4. Optional trace source; absence degrades to polling-only.
        if self.cfg.trace.enabled {
            match self.trace_source.take() {
                Some(mut source) => {
                    let (tx, rx) = mpsc::channel(self.cfg.trace.buffer);
                    match source.start(tx, self.cancel.child_token()) {
                        Ok(()) => {
                            info!(source = source.name(), "trace source started");
                            self.ingest_task = Some(trace::spawn_ingest(
                                Arc::clone(&self.tracker),
                                rx,
                                self.cancel.child_token(),
                            ));
                        }
                        Err(e) => {
                            warn!(
                                source = source.name(),
                                error = %e,
                                "trace source unavailable, continuing polling-only",
                            );
                        }
                    }
                }
                None => {
                    warn!("trace ingestion enabled but no source attached, continuing polling-only");
                }
            }
        }

        // 5. Poll loop.
        let source = self
            .snapshot_source
            .take()
            .context("start called more than once")?;
        let resolver = self
            .resolver
            .take()
            .context("start called more than once")?;

        self.poll_task = Some(spawn_poll_loop(PollLoop {
            interval: self.cfg.poll.interval,
            source,
            resolver,
            tracker: Arc::clone(&self.tracker),
            cache: Arc::clone(&self.cache),
            publisher: Arc::clone(&self.publisher),
            health: Arc::clone(&self.health),
            stats: Arc::clone(&self.stats),
            batch_tx,
            cancel: self.cancel.child_token(),
        }));

        // 6. Background maintenance and reporting.
        self.spawn_maintenance(Arc::clone(&store));
        self.spawn_stats_reporter();

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    ///
    /// The in-flight cycle completes to its sample boundary and pending
    /// rollup increments are flushed before persistence tears down.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.poll_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "poll loop join failed");
            }
        }

        // The poll loop has dropped its sender; the writer finishes the
        // remaining queue and exits.
        if let Some(task) = self.writer_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "store writer join failed");
            }
        }

        if let Some(task) = self.ingest_task.take() {
            match task.await {
                Ok(totals) => {
                    self.health
                        .trace_records_unmatched
                        .inc_by(totals.unmatched as f64);
                }
                Err(e) => error!(error = %e, "trace ingest join failed"),
            }
        }

        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }

    /// Spawn the retention maintenance cycle.
    fn spawn_maintenance(&self, store: Arc<RollupStore>) {
        let cancel = self.cancel.clone();
        let interval = self.cfg.store.maintenance_interval;
        let policy = self.cfg.store.retention.policy();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick; pruning right at startup
            // buys nothing.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        match store.prune(&policy, SystemTime::now()).await {
                            Ok(()) => {
                                debug!(
                                    elapsed_ms = started.elapsed().as_millis() as u64,
                                    "retention maintenance completed",
                                );
                            }
                            Err(e) => {
                                warn!(error = %e, "retention maintenance failed");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawn the periodic cycle stats reporter.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snap = stats.snapshot();
                        if snap.polls == 0 {
                            continue;
                        }

                        info!(
                            polls = snap.polls,
                            observations = snap.observations,
                            new_flows = snap.new_flows,
                            closed_flows = snap.closed_flows,
                            samples = snap.samples,
                            unattributed = snap.unattributed,
                            reuse_detections = snap.reuse_detections,
                            "cycle stats (60s)",
                        );
                    }
                }
            }
        });
    }
}

/// Everything the poll loop task owns.
struct PollLoop {
    interval: Duration,
    source: Box<dyn SnapshotSource>,
    resolver: AttributionResolver,
    tracker: Arc<Tracker>,
    cache: Arc<IdentityCache>,
    publisher: Arc<Publisher>,
    health: Arc<HealthMetrics>,
    stats: Arc<CycleStats>,
    batch_tx: mpsc::Sender<StoreBatch>,
    cancel: CancellationToken,
}

fn spawn_poll_loop(lp: PollLoop) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let PollLoop {
            interval,
            source,
            resolver,
            tracker,
            cache,
            publisher,
            health,
            stats,
            batch_tx,
            cancel,
        } = lp;

        let mut engine = AggregationEngine::new();
        let mut ticker = tokio::time::interval(interval);
        // A slow poll delays the next tick rather than overlapping it.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick so the first window spans a full
        // interval.
        ticker.tick().await;

        let mut window_start = SystemTime::now();
        let mut last_evictions = 0u64;
        let mut last_published = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Flush pending rollup increments at the last completed
                    // sample boundary; no partial-bucket state is lost.
                    let rollups = engine.drain();
                    if !rollups.is_empty() {
                        let batch = StoreBatch { rollups, ..Default::default() };
                        if batch_tx.send(batch).await.is_err() {
                            error!("store writer gone before final flush");
                        }
                    }
                    debug!("poll loop stopped");
                    return;
                }

                _ = ticker.tick() => {
                    let cycle_started = Instant::now();
                    let now = SystemTime::now();

                    // Poll, diff, attribute, emit: one logical unit of work.
                    let observations = source.poll();
                    let summary = tracker.apply_snapshot(&observations, now);
                    let attribution = resolver.attribute_cycle(&tracker, &cache, now);
                    let diff = tracker.collect_cycle(now);

                    let (app_samples, global_sample) =
                        fold_samples(&diff.samples, &cache, window_start, now);

                    publish_cycle(&publisher, &diff.samples, &cache, &app_samples, global_sample);

                    let batch = SampleBatch {
                        window_start,
                        window_end: now,
                        apps: app_samples.clone(),
                        global: global_sample,
                    };
                    let ingest = engine.ingest(&batch);
                    let rollups = engine.drain();

                    let store_batch = StoreBatch {
                        raw_apps: app_samples,
                        raw_global: Some(global_sample),
                        rollups,
                    };
                    if !store_batch.is_empty() {
                        // try_send: a saturated writer must not stall polling.
                        match batch_tx.try_send(store_batch) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(batch)) => {
                                warn!(rows = batch.row_count(), "store writer backlogged, dropping batch");
                                health.store_batches_dropped.inc();
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                error!("store writer channel closed");
                            }
                        }
                    }

                    // Health bookkeeping.
                    health.polls_total.inc();
                    health.poll_duration.observe(cycle_started.elapsed().as_secs_f64());
                    health.connections_observed.set(summary.observed as f64);
                    health.connections_tracked.set(tracker.len() as f64);
                    health.connections_closed.inc_by(diff.closed as f64);
                    health.connections_unattributed.set(attribution.unattributed as f64);
                    health.pid_reuse_detections.inc_by(attribution.reuse_detected as f64);
                    health.process_exits.inc_by(attribution.exited as f64);
                    health.identity_cache_size.set(cache.len() as f64);
                    health.sample_batches_emitted.inc();
                    health.rollup_duplicates_skipped.inc_by(ingest.duplicate_lanes as f64);
                    health.subscribers.set(publisher.subscriber_count() as f64);

                    let evictions = cache.eviction_count();
                    health.identity_cache_evictions.inc_by((evictions - last_evictions) as f64);
                    last_evictions = evictions;

                    let published = publisher.published_count();
                    health.events_published.inc_by((published - last_published) as f64);
                    last_published = published;

                    stats.record_cycle(
                        summary.observed as u64,
                        summary.new_flows as u64,
                        diff.closed as u64,
                        diff.samples.len() as u64,
                        attribution.unattributed as u64,
                        attribution.reuse_detected as u64,
                    );

                    window_start = now;
                }
            }
        }
    })
}

/// Folds per-flow samples into per-app and global interval samples.
///
/// Per-app series carry attributed traffic only; the global series carries
/// everything, so unattributed flows degrade visibility per-app without
/// losing bytes system-wide.
fn fold_samples(
    samples: &[FlowSample],
    cache: &IdentityCache,
    window_start: SystemTime,
    window_end: SystemTime,
) -> (Vec<AppSample>, GlobalSample) {
    let mut apps: HashMap<String, (u64, u64)> = HashMap::new();
    let mut app_names: HashMap<ProcessIdentity, Option<String>> = HashMap::new();
    let mut global = (0u64, 0u64);

    for sample in samples {
        global.0 += sample.delta_sent;
        global.1 += sample.delta_received;

        if sample.delta_sent == 0 && sample.delta_received == 0 {
            continue;
        }

        let Some(identity) = sample.identity else {
            continue;
        };

        let name = app_names
            .entry(identity)
            .or_insert_with(|| cache.get(&identity).map(|m| m.app_key()));

        if let Some(name) = name {
            let entry = apps.entry(name.clone()).or_insert((0, 0));
            entry.0 += sample.delta_sent;
            entry.1 += sample.delta_received;
        }
    }

    let mut app_samples: Vec<AppSample> = apps
        .into_iter()
        .map(|(app, (sent, received))| AppSample {
            app,
            window_start,
            window_end,
            bytes_sent: sent,
            bytes_received: received,
        })
        .collect();
    app_samples.sort_by(|a, b| a.app.cmp(&b.app));

    let global_sample = GlobalSample {
        window_start,
        window_end,
        bytes_sent: global.0,
        bytes_received: global.1,
    };

    (app_samples, global_sample)
}

/// Publishes this cycle's change events.
fn publish_cycle(
    publisher: &Publisher,
    samples: &[FlowSample],
    cache: &IdentityCache,
    app_samples: &[AppSample],
    global_sample: GlobalSample,
) {
    for sample in samples {
        let changed = sample.opened
            || sample.closed
            || sample.delta_sent > 0
            || sample.delta_received > 0;
        if !changed {
            continue;
        }

        let app = sample
            .identity
            .and_then(|id| cache.get(&id))
            .map(|m| m.app_key());
        publisher.publish(ChangeEvent::ConnectionChanged(ConnectionUpdate::from_sample(
            sample, app,
        )));
    }

    for sample in app_samples {
        publisher.publish(ChangeEvent::AppSampleReady(sample.clone()));
    }
    publisher.publish(ChangeEvent::GlobalSampleReady(global_sample));
}

/// Spawns the task applying write batches with retry, keeping the poll
/// loop decoupled from store latency.
fn spawn_store_writer(
    store: Arc<RollupStore>,
    mut rx: mpsc::Receiver<StoreBatch>,
    writer: StoreWriter,
    health: Arc<HealthMetrics>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            let started = Instant::now();
            let raw_apps = batch.raw_apps.len();
            let raw_global = usize::from(batch.raw_global.is_some());
            let rollups = batch.rollups.len();

            if writer.write(&store, &batch).await {
                health.store_write_duration.observe(started.elapsed().as_secs_f64());
                health
                    .store_rows_written
                    .with_label_values(&["app_network"])
                    .inc_by(raw_apps as f64);
                health
                    .store_rows_written
                    .with_label_values(&["global_network"])
                    .inc_by(raw_global as f64);
                health
                    .store_rows_written
                    .with_label_values(&["rollup"])
                    .inc_by(rollups as f64);
            } else {
                health.store_batches_dropped.inc();
            }
        }

        debug!("store writer stopped");
    })
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use tracing::debug;

use crate::proc::ProcessIdentity;

use super::{ConnectionKey, ConnectionObservation, FlowCounters, SocketState};

/// Tracker-owned state for one flow.
///
/// Byte totals are monotonic cumulative counts owned by the tracker; raw
/// source counters are kept separately so a source counter reset never
/// produces a negative delta.
#[derive(Debug, Clone)]
pub struct TrackedConnection {
    pub key: ConnectionKey,
    pub state: SocketState,
    pub first_seen: SystemTime,
    pub last_active: SystemTime,
    /// Monotonic cumulative totals since tracking began.
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Counters as last reported by the snapshot source.
    src_counters: Option<FlowCounters>,
    /// Cumulative totals at the last emitted sample.
    sample_sent: u64,
    sample_received: u64,
    last_speed_calc: SystemTime,
    pub send_bps: f64,
    pub recv_bps: f64,
    pub reset_count: u32,
    /// Owning process instance; written only by the attribution resolver.
    pub identity: Option<ProcessIdentity>,
    seen_gen: u64,
    missed_polls: u32,
    /// False once the flow has been absent from at least one poll.
    pub live: bool,
    announced: bool,
}

/// Per-flow measurement emitted once per poll cycle.
#[derive(Debug, Clone)]
pub struct FlowSample {
    pub key: ConnectionKey,
    pub identity: Option<ProcessIdentity>,
    pub state: SocketState,
    pub delta_sent: u64,
    pub delta_received: u64,
    pub send_bps: f64,
    pub recv_bps: f64,
    pub total_sent: u64,
    pub total_received: u64,
    pub first_seen: SystemTime,
    /// First sample ever emitted for this flow.
    pub opened: bool,
    /// Final sample; the flow has been released.
    pub closed: bool,
}

/// Result of applying one snapshot.
#[derive(Debug, Default)]
pub struct SnapshotSummary {
    pub observed: usize,
    pub new_flows: usize,
}

/// Samples produced by one cycle's collection pass.
#[derive(Debug, Default)]
pub struct CycleDiff {
    pub samples: Vec<FlowSample>,
    pub closed: usize,
    pub stale: usize,
}

/// Maintains per-flow state across snapshot polls.
///
/// Flows move New -> Active -> Stale (absent 1..grace polls) -> Closed.
/// Entries are keyed and mutated independently; the trace source may add
/// byte deltas concurrently with snapshot application on disjoint keys.
pub struct Tracker {
    flows: DashMap<ConnectionKey, TrackedConnection>,
    grace_polls: u32,
    generation: AtomicU64,
}

impl Tracker {
    /// Creates a tracker tolerating `grace_polls` consecutive missed polls
    /// before a flow is declared closed.
    pub fn new(grace_polls: u32) -> Self {
        Self {
            flows: DashMap::with_capacity(256),
            grace_polls: grace_polls.max(1),
            generation: AtomicU64::new(0),
        }
    }

    /// The live flow table. Exposed for the attribution resolver, which
    /// writes identity references, and for tests.
    pub fn flows(&self) -> &DashMap<ConnectionKey, TrackedConnection> {
        &self.flows
    }

    /// Applies one complete snapshot of the flow table.
    ///
    /// Observed flows are created or refreshed; absence is handled later by
    /// `collect_cycle` so that application stays a single forward pass.
    pub fn apply_snapshot(
        &self,
        observations: &[ConnectionObservation],
        now: SystemTime,
    ) -> SnapshotSummary {
        let gen = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut summary = SnapshotSummary {
            observed: observations.len(),
            new_flows: 0,
        };

        for obs in observations {
            let key = obs.key();

            match self.flows.get_mut(&key) {
                Some(mut conn) => {
                    conn.state = obs.state;
                    conn.last_active = now;
                    conn.seen_gen = gen;
                    conn.missed_polls = 0;
                    conn.live = true;
                    if let Some(counters) = obs.counters {
                        apply_counters(&mut conn, counters);
                    }
                }
                None => {
                    summary.new_flows += 1;
                    self.flows.insert(
                        key,
                        TrackedConnection {
                            key,
                            state: obs.state,
                            first_seen: obs.observed_at,
                            last_active: now,
                            bytes_sent: 0,
                            bytes_received: 0,
                            // First report is the baseline; bytes moved before
                            // tracking began are not counted.
                            src_counters: obs.counters,
                            sample_sent: 0,
                            sample_received: 0,
                            last_speed_calc: now,
                            send_bps: 0.0,
                            recv_bps: 0.0,
                            reset_count: 0,
                            identity: None,
                            seen_gen: gen,
                            missed_polls: 0,
                            live: true,
                            announced: false,
                        },
                    );
                }
            }
        }

        summary
    }

    /// Adds trace-source byte deltas to a tracked flow's cumulative totals.
    ///
    /// Returns false when the flow is not (or no longer) tracked; such
    /// records are dropped since liveness is owned by the snapshot path.
    pub fn record_delta(&self, key: &ConnectionKey, sent: u64, received: u64) -> bool {
        match self.flows.get_mut(key) {
            Some(mut conn) => {
                conn.bytes_sent += sent;
                conn.bytes_received += received;
                true
            }
            None => {
                debug!(%key, "trace record for untracked flow dropped");
                false
            }
        }
    }

    /// Emits one sample per tracked flow and sweeps absent flows.
    ///
    /// Flows missing from the latest snapshot go stale; after `grace_polls`
    /// consecutive misses the flow emits a final zero-speed sample and is
    /// released.
    pub fn collect_cycle(&self, now: SystemTime) -> CycleDiff {
        let gen = self.generation.load(Ordering::Relaxed);
        let mut diff = CycleDiff::default();

        self.flows.retain(|_, conn| {
            if conn.seen_gen == gen {
                diff.samples.push(emit_sample(conn, now));
                return true;
            }

            // Absent from this poll.
            conn.missed_polls += 1;
            conn.live = false;
            conn.send_bps = 0.0;
            conn.recv_bps = 0.0;

            if conn.missed_polls < self.grace_polls {
                diff.stale += 1;
                // Flush any trace-source bytes that arrived while stale.
                if conn.bytes_sent > conn.sample_sent
                    || conn.bytes_received > conn.sample_received
                {
                    diff.samples.push(emit_sample(conn, now));
                }
                return true;
            }

            // Grace exhausted: final sample, then release the entry.
            let mut sample = emit_sample(conn, now);
            sample.send_bps = 0.0;
            sample.recv_bps = 0.0;
            sample.closed = true;
            diff.samples.push(sample);
            diff.closed += 1;
            false
        });

        diff
    }

    /// Number of currently tracked flows.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether no flows are tracked.
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Folds freshly reported source counters into the cumulative totals,
/// treating any decrease as a counter reset that counts from zero.
fn apply_counters(conn: &mut TrackedConnection, counters: FlowCounters) {
    if let Some(prev) = conn.src_counters {
        let mut reset = false;

        let sent_delta = if counters.sent < prev.sent {
            reset = true;
            counters.sent
        } else {
            counters.sent - prev.sent
        };

        let recv_delta = if counters.received < prev.received {
            reset = true;
            counters.received
        } else {
            counters.received - prev.received
        };

        if reset {
            conn.reset_count += 1;
            debug!(key = %conn.key, resets = conn.reset_count, "counter reset detected");
        }

        conn.bytes_sent += sent_delta;
        conn.bytes_received += recv_delta;
    }

    conn.src_counters = Some(counters);
}

/// Builds a sample from the bytes accumulated since the last one and
/// advances the sample baseline.
fn emit_sample(conn: &mut TrackedConnection, now: SystemTime) -> FlowSample {
    let delta_sent = conn.bytes_sent - conn.sample_sent;
    let delta_received = conn.bytes_received - conn.sample_received;

    let elapsed = now
        .duration_since(conn.last_speed_calc)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    if elapsed > 0.0 {
        conn.send_bps = delta_sent as f64 / elapsed;
        conn.recv_bps = delta_received as f64 / elapsed;
    } else {
        conn.send_bps = 0.0;
        conn.recv_bps = 0.0;
    }

    conn.sample_sent = conn.bytes_sent;
    conn.sample_received = conn.bytes_received;
    conn.last_speed_calc = now;

    let opened = !conn.announced;
    conn.announced = true;

    FlowSample {
        key: conn.key,
        identity: conn.identity,
        state: conn.state,
        delta_sent,
        delta_received,
        send_bps: conn.send_bps,
        recv_bps: conn.recv_bps,
        total_sent: conn.bytes_sent,
        total_received: conn.bytes_received,
        first_seen: conn.first_seen,
        opened,
        closed: false,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use crate::flow::Protocol;

    use super::*;

    fn obs(pid: u32, port: u16, counters: Option<FlowCounters>, at: SystemTime) -> ConnectionObservation {
        ConnectionObservation {
            local: SocketAddr::from(([127, 0, 0, 1], port)),
            remote: SocketAddr::from(([93, 184, 216, 34], 443)),
            protocol: Protocol::Tcp,
            state: SocketState::Established,
            pid,
            counters,
            observed_at: at,
        }
    }

    fn counters(sent: u64, received: u64) -> Option<FlowCounters> {
        Some(FlowCounters { sent, received })
    }

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_new_flow_baselines_counters() {
        let tracker = Tracker::new(3);
        let summary = tracker.apply_snapshot(&[obs(1, 5000, counters(9999, 1234), t(0))], t(0));

        assert_eq!(summary.new_flows, 1);

        let diff = tracker.collect_cycle(t(1));
        assert_eq!(diff.samples.len(), 1);
        let s = &diff.samples[0];
        // Bytes moved before tracking are not counted.
        assert_eq!(s.delta_sent, 0);
        assert_eq!(s.delta_received, 0);
        assert!(s.opened);
    }

    #[test]
    fn test_active_flow_delta_and_speed() {
        let tracker = Tracker::new(3);
        tracker.apply_snapshot(&[obs(1, 5000, counters(1000, 0), t(0))], t(0));
        tracker.collect_cycle(t(0));

        tracker.apply_snapshot(&[obs(1, 5000, counters(3000, 500), t(1))], t(1));
        let diff = tracker.collect_cycle(t(1));

        let s = &diff.samples[0];
        assert_eq!(s.delta_sent, 2000);
        assert_eq!(s.delta_received, 500);
        assert!((s.send_bps - 2000.0).abs() < f64::EPSILON);
        assert!((s.recv_bps - 500.0).abs() < f64::EPSILON);
        assert!(!s.opened);
    }

    #[test]
    fn test_counter_reset_never_negative() {
        let tracker = Tracker::new(3);

        // Counter goes 5000 -> 0 -> 120 across three polls at 1s spacing.
        tracker.apply_snapshot(&[obs(1, 5000, counters(5000, 0), t(0))], t(0));
        tracker.collect_cycle(t(0));

        tracker.apply_snapshot(&[obs(1, 5000, counters(0, 0), t(1))], t(1));
        let d1 = tracker.collect_cycle(t(1));
        assert_eq!(d1.samples[0].delta_sent, 0);
        assert!(d1.samples[0].send_bps.abs() < f64::EPSILON);

        tracker.apply_snapshot(&[obs(1, 5000, counters(120, 0), t(2))], t(2));
        let d2 = tracker.collect_cycle(t(2));
        assert_eq!(d2.samples[0].delta_sent, 120);
        assert!((d2.samples[0].send_bps - 120.0).abs() < f64::EPSILON);

        let key = obs(1, 5000, None, t(0)).key();
        let conn = tracker.flows().get(&key).expect("tracked");
        assert_eq!(conn.reset_count, 1);
        assert_eq!(conn.bytes_sent, 120);
    }

    #[test]
    fn test_reset_with_immediate_traffic_counts_from_zero() {
        let tracker = Tracker::new(3);
        tracker.apply_snapshot(&[obs(1, 5000, counters(5000, 0), t(0))], t(0));
        tracker.collect_cycle(t(0));

        // Source restarted and already moved 300 bytes.
        tracker.apply_snapshot(&[obs(1, 5000, counters(300, 0), t(1))], t(1));
        let diff = tracker.collect_cycle(t(1));
        assert_eq!(diff.samples[0].delta_sent, 300);
    }

    #[test]
    fn test_stale_then_closed_lifecycle() {
        let tracker = Tracker::new(2);
        tracker.apply_snapshot(&[obs(1, 5000, counters(100, 0), t(0))], t(0));
        tracker.collect_cycle(t(0));

        // Absent once: stale, still tracked, no sample (nothing pending).
        tracker.apply_snapshot(&[], t(1));
        let d1 = tracker.collect_cycle(t(1));
        assert_eq!(d1.stale, 1);
        assert_eq!(d1.closed, 0);
        assert!(d1.samples.is_empty());
        assert_eq!(tracker.len(), 1);

        // Absent twice: grace exhausted, exactly one final zero-speed sample.
        tracker.apply_snapshot(&[], t(2));
        let d2 = tracker.collect_cycle(t(2));
        assert_eq!(d2.closed, 1);
        assert_eq!(d2.samples.len(), 1);
        let last = &d2.samples[0];
        assert!(last.closed);
        assert!(last.send_bps.abs() < f64::EPSILON);
        assert!(last.recv_bps.abs() < f64::EPSILON);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_reappearing_flow_survives_grace() {
        let tracker = Tracker::new(3);
        tracker.apply_snapshot(&[obs(1, 5000, counters(100, 0), t(0))], t(0));
        tracker.collect_cycle(t(0));

        // Missed two polls, then reappears before the grace runs out.
        tracker.apply_snapshot(&[], t(1));
        tracker.collect_cycle(t(1));
        tracker.apply_snapshot(&[], t(2));
        tracker.collect_cycle(t(2));

        tracker.apply_snapshot(&[obs(1, 5000, counters(250, 0), t(3))], t(3));
        let diff = tracker.collect_cycle(t(3));

        assert_eq!(tracker.len(), 1);
        assert_eq!(diff.closed, 0);
        assert_eq!(diff.samples[0].delta_sent, 150);
    }

    #[test]
    fn test_trace_deltas_accumulate() {
        let tracker = Tracker::new(3);
        let key = obs(1, 5000, None, t(0)).key();

        tracker.apply_snapshot(&[obs(1, 5000, None, t(0))], t(0));
        tracker.collect_cycle(t(0));

        assert!(tracker.record_delta(&key, 400, 100));
        assert!(tracker.record_delta(&key, 200, 0));

        tracker.apply_snapshot(&[obs(1, 5000, None, t(1))], t(1));
        let diff = tracker.collect_cycle(t(1));

        assert_eq!(diff.samples[0].delta_sent, 600);
        assert_eq!(diff.samples[0].delta_received, 100);
    }

    #[test]
    fn test_trace_delta_for_untracked_flow_dropped() {
        let tracker = Tracker::new(3);
        let key = obs(1, 5000, None, t(0)).key();
        assert!(!tracker.record_delta(&key, 400, 100));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_stale_flow_flushes_pending_trace_bytes() {
        let tracker = Tracker::new(3);
        let key = obs(1, 5000, None, t(0)).key();
        tracker.apply_snapshot(&[obs(1, 5000, None, t(0))], t(0));
        tracker.collect_cycle(t(0));

        tracker.record_delta(&key, 50, 0);

        tracker.apply_snapshot(&[], t(1));
        let diff = tracker.collect_cycle(t(1));

        assert_eq!(diff.stale, 1);
        assert_eq!(diff.samples.len(), 1);
        assert_eq!(diff.samples[0].delta_sent, 50);
    }

    #[test]
    fn test_same_endpoints_different_pid_tracked_separately() {
        let tracker = Tracker::new(3);
        tracker.apply_snapshot(
            &[
                obs(100, 5000, counters(10, 0), t(0)),
                obs(200, 5000, counters(20, 0), t(0)),
            ],
            t(0),
        );

        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_concurrent_trace_records() {
        use std::sync::Arc;
        use std::thread;

        let tracker = Arc::new(Tracker::new(3));
        let mut observations = Vec::new();
        for port in 0..8u16 {
            observations.push(obs(1, 10_000 + port, None, t(0)));
        }
        tracker.apply_snapshot(&observations, t(0));
        tracker.collect_cycle(t(0));

        let mut handles = Vec::new();
        for port in 0..8u16 {
            let tracker = Arc::clone(&tracker);
            let key = obs(1, 10_000 + port, None, t(0)).key();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    tracker.record_delta(&key, 1, 1);
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        tracker.apply_snapshot(&observations, t(1));
        let diff = tracker.collect_cycle(t(1));
        let total: u64 = diff.samples.iter().map(|s| s.delta_sent).sum();
        assert_eq!(total, 8000);
    }
}

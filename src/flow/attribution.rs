use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::proc::{self, IdentityCache, ProcessIdentity, ProcessMetadata, ResolveError};

use super::tracker::Tracker;

type ResolveProbe = Box<dyn Fn(u32) -> Result<ProcessIdentity, ResolveError> + Send + Sync>;
type MetadataProbe = Box<dyn Fn(u32) -> Option<ProcessMetadata> + Send + Sync>;

/// Per-cycle attribution counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AttributionStats {
    /// Flows attributed to the pid's current live identity.
    pub resolved: usize,
    /// Flows that kept their original identity because the pid now belongs
    /// to a different instance or the process exited.
    pub retained: usize,
    /// Flows with no identity at all this cycle.
    pub unattributed: usize,
    /// Flows whose pid was observed recycled by a newer process.
    pub reuse_detected: usize,
    /// Distinct processes newly discovered to have exited.
    pub exited: usize,
}

/// Maps tracked flows to owning process instances.
///
/// The resolver is the only writer of `TrackedConnection::identity`. OS
/// probes are injectable so the reuse-guard logic is testable without a
/// live process table.
pub struct AttributionResolver {
    resolve: ResolveProbe,
    collect: MetadataProbe,
}

impl AttributionResolver {
    /// Creates a resolver backed by the live process table.
    pub fn new() -> Self {
        Self {
            resolve: Box::new(proc::resolve_identity),
            collect: Box::new(|pid| proc::collect_metadata(pid).ok()),
        }
    }

    /// Creates a resolver with custom identity/metadata probes.
    pub fn with_probes(resolve: ResolveProbe, collect: MetadataProbe) -> Self {
        Self { resolve, collect }
    }

    /// Attributes every tracked flow for this cycle.
    ///
    /// For each distinct pid the current identity is resolved once. A flow
    /// is valid for that identity iff it was first seen at or after the
    /// identity's start time; otherwise the pid has been recycled and the
    /// flow keeps its original identity, or stays unattributed if it never
    /// had one. A flow is never silently re-pointed at an unrelated process.
    pub fn attribute_cycle(
        &self,
        tracker: &Tracker,
        cache: &IdentityCache,
        now: SystemTime,
    ) -> AttributionStats {
        let mut stats = AttributionStats::default();

        // One process-table read per distinct pid per cycle.
        let mut current_by_pid: HashMap<u32, Option<ProcessIdentity>> = HashMap::new();
        let mut exited_marked: HashSet<ProcessIdentity> = HashSet::new();

        for mut entry in tracker.flows().iter_mut() {
            let conn = entry.value_mut();
            let pid = conn.key.pid;

            if pid == 0 {
                // Kernel-owned or unidentifiable socket.
                stats.unattributed += 1;
                continue;
            }

            let current = *current_by_pid.entry(pid).or_insert_with(|| {
                match (self.resolve)(pid) {
                    Ok(identity) => {
                        self.refresh_metadata(cache, identity);
                        Some(identity)
                    }
                    Err(ResolveError::NotFound { .. }) => None,
                    Err(e) => {
                        warn!(pid, error = %e, "identity resolution failed");
                        None
                    }
                }
            });

            match current {
                Some(identity) if conn.first_seen >= identity.start_time => {
                    conn.identity = Some(identity);
                    stats.resolved += 1;
                }
                Some(identity) => {
                    // The pid now belongs to a process started after this
                    // flow appeared: recycled pid.
                    stats.reuse_detected += 1;
                    debug!(
                        pid,
                        new_start = ?identity.start_time,
                        flow_first_seen = ?conn.first_seen,
                        "pid recycled under tracked flow",
                    );
                    match conn.identity {
                        Some(_) => stats.retained += 1,
                        None => stats.unattributed += 1,
                    }
                }
                None => match conn.identity {
                    Some(original) => {
                        if exited_marked.insert(original) {
                            cache.mark_exited(&original, now);
                            stats.exited += 1;
                        }
                        stats.retained += 1;
                    }
                    None => stats.unattributed += 1,
                },
            }
        }

        stats
    }

    /// Ensures metadata for a live identity is cached and current.
    fn refresh_metadata(&self, cache: &IdentityCache, identity: ProcessIdentity) {
        if let Some(mut meta) = (self.collect)(identity.pid) {
            // Preserve exit state recorded by an earlier cycle; a live
            // refresh for the same instance supersedes it anyway.
            meta.has_exited = false;
            meta.exit_time = None;
            cache.upsert(identity, meta);
        }
    }
}

impl Default for AttributionResolver {
    fn default() -> Self {
        Self::new()
    }
}

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use lru::LruCache;
use thiserror::Error;
use tracing::debug;

/// Kernel USER_HZ used for the starttime field of `/proc/<pid>/stat`.
/// Fixed at 100 on every supported architecture.
const CLOCK_TICKS_PER_SEC: u64 = 100;

/// Error resolving a pid to a live process instance.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The process exited between observation and lookup. Expected and
    /// frequent; callers leave the flow unattributed and retry next cycle.
    #[error("process {pid} not found")]
    NotFound { pid: u32 },

    #[error("reading process {pid}: {source}")]
    Read {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed stat data for process {pid}")]
    Malformed { pid: u32 },
}

/// One process *instance*: a pid qualified by its start time.
///
/// The OS reuses pids, so a bare pid never identifies a process across time.
/// Equality over both fields is what defeats reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: SystemTime,
}

/// Descriptive metadata for one process instance.
#[derive(Debug, Clone, Default)]
pub struct ProcessMetadata {
    pub name: String,
    pub exe_path: Option<PathBuf>,
    pub cmdline: Option<String>,
    pub threads: u32,
    pub memory_bytes: u64,
    pub has_exited: bool,
    pub exit_time: Option<SystemTime>,
}

impl ProcessMetadata {
    /// Key used to group this process's traffic into per-app samples.
    /// Prefers the executable file name, falling back to the comm name.
    pub fn app_key(&self) -> String {
        if let Some(path) = &self.exe_path {
            if let Some(stem) = path.file_name() {
                return stem.to_string_lossy().into_owned();
            }
        }
        self.name.clone()
    }
}

/// Bounded LRU cache of per-instance process metadata.
///
/// Keys are full `ProcessIdentity` values, never bare pids. Metadata for
/// exited processes is demoted to the cold end rather than removed, since
/// their connections may still be settling in TIME_WAIT-like states.
pub struct IdentityCache {
    inner: parking_lot::Mutex<LruCache<ProcessIdentity, ProcessMetadata>>,
    evictions: AtomicU64,
}

impl IdentityCache {
    /// Creates a cache bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            inner: parking_lot::Mutex::new(LruCache::new(capacity)),
            evictions: AtomicU64::new(0),
        }
    }

    /// Queries the OS for the current identity of `pid`.
    ///
    /// This is a pure read against the process table; it never touches the
    /// cache. Callers decide whether the returned identity matches the flow
    /// they are attributing.
    pub fn resolve(&self, pid: u32) -> Result<ProcessIdentity, ResolveError> {
        resolve_identity(pid)
    }

    /// Returns cached metadata, refreshing LRU recency.
    pub fn get(&self, identity: &ProcessIdentity) -> Option<ProcessMetadata> {
        self.inner.lock().get(identity).cloned()
    }

    /// Inserts or refreshes metadata for an identity.
    pub fn upsert(&self, identity: ProcessIdentity, metadata: ProcessMetadata) {
        let mut inner = self.inner.lock();
        let at_capacity = inner.len() == usize::from(inner.cap());
        if at_capacity && !inner.contains(&identity) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        inner.put(identity, metadata);
    }

    /// Records that the process exited and demotes the entry so capacity
    /// pressure removes exited instances first.
    pub fn mark_exited(&self, identity: &ProcessIdentity, at: SystemTime) {
        let mut inner = self.inner.lock();
        if let Some(meta) = inner.get_mut(identity) {
            if !meta.has_exited {
                meta.has_exited = true;
                meta.exit_time = Some(at);
                debug!(pid = identity.pid, "process exit recorded");
            }
        }
        inner.demote(identity);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total entries displaced by capacity pressure since startup.
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Resolves the current identity of `pid` from the live process table.
pub fn resolve_identity(pid: u32) -> Result<ProcessIdentity, ResolveError> {
    let start_time = read_proc_start_time(pid)?;
    Ok(ProcessIdentity { pid, start_time })
}

/// Reads the process start time from `/proc/<pid>/stat`.
///
/// Field 22 (starttime) is in clock ticks since boot; combined with the boot
/// timestamp from `/proc/stat` this yields an absolute wall-clock instant
/// that is stable for the lifetime of the process instance.
#[cfg(target_os = "linux")]
fn read_proc_start_time(pid: u32) -> Result<SystemTime, ResolveError> {
    let stat = read_proc_file(pid, "stat")?;
    let ticks = parse_stat_field(&stat, 21).ok_or(ResolveError::Malformed { pid })?;
    let boot = boot_time().ok_or(ResolveError::Malformed { pid })?;

    let offset_ms = ticks.saturating_mul(1000) / CLOCK_TICKS_PER_SEC;
    Ok(boot + Duration::from_millis(offset_ms))
}

#[cfg(not(target_os = "linux"))]
fn read_proc_start_time(pid: u32) -> Result<SystemTime, ResolveError> {
    Err(ResolveError::NotFound { pid })
}

/// Collects current metadata for a live process.
///
/// Individual field reads are best-effort: a process racing to exit yields
/// partial metadata rather than an error.
#[cfg(target_os = "linux")]
pub fn collect_metadata(pid: u32) -> Result<ProcessMetadata, ResolveError> {
    let name = read_proc_comm(pid)?;

    let exe_path = std::fs::read_link(format!("/proc/{pid}/exe")).ok();
    let cmdline = read_proc_cmdline(pid).ok().filter(|c| !c.trim().is_empty());

    let stat = read_proc_file(pid, "stat").unwrap_or_default();
    let threads = parse_stat_field(&stat, 19).unwrap_or(0) as u32;

    let memory_bytes = read_proc_rss_bytes(pid).unwrap_or(0);

    Ok(ProcessMetadata {
        name,
        exe_path,
        cmdline,
        threads,
        memory_bytes,
        has_exited: false,
        exit_time: None,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn collect_metadata(pid: u32) -> Result<ProcessMetadata, ResolveError> {
    Err(ResolveError::NotFound { pid })
}

/// Read /proc/<pid>/comm, returning the trimmed process name.
#[cfg(target_os = "linux")]
fn read_proc_comm(pid: u32) -> Result<String, ResolveError> {
    let data = read_proc_file(pid, "comm")?;
    Ok(data.trim().to_string())
}

/// Read /proc/<pid>/cmdline, joining null-separated args with spaces.
#[cfg(target_os = "linux")]
fn read_proc_cmdline(pid: u32) -> Result<String, ResolveError> {
    let path = format!("/proc/{pid}/cmdline");
    let data = std::fs::read(&path).map_err(|e| map_io_error(pid, e))?;
    Ok(String::from_utf8_lossy(&data)
        .trim_end_matches('\0')
        .replace('\0', " "))
}

/// Resident set size from /proc/<pid>/statm (second field, in pages).
#[cfg(target_os = "linux")]
fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let statm = read_proc_file(pid, "statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

#[cfg(target_os = "linux")]
fn read_proc_file(pid: u32, name: &str) -> Result<String, ResolveError> {
    let path = format!("/proc/{pid}/{name}");
    std::fs::read_to_string(&path).map_err(|e| map_io_error(pid, e))
}

#[cfg(target_os = "linux")]
fn map_io_error(pid: u32, e: std::io::Error) -> ResolveError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ResolveError::NotFound { pid }
    } else {
        ResolveError::Read { pid, source: e }
    }
}

/// Extracts a numeric field from `/proc/<pid>/stat`, 0-indexed.
///
/// The comm field (index 1) may contain spaces and parentheses, so fields
/// are counted from the last `)` in the line.
fn parse_stat_field(stat: &str, index: usize) -> Option<u64> {
    let rest = stat.rsplit_once(')')?.1;
    // `rest` starts at field index 2 (state).
    rest.split_whitespace().nth(index - 2)?.parse().ok()
}

/// Boot timestamp from the `btime` line of `/proc/stat`.
#[cfg(target_os = "linux")]
fn boot_time() -> Option<SystemTime> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    for line in stat.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            let secs: u64 = rest.trim().parse().ok()?;
            return Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(pid: u32, start_secs: u64) -> ProcessIdentity {
        ProcessIdentity {
            pid,
            start_time: SystemTime::UNIX_EPOCH + Duration::from_secs(start_secs),
        }
    }

    fn metadata(name: &str) -> ProcessMetadata {
        ProcessMetadata {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_stat_field_basic() {
        let stat = "1234 (nginx) S 1 1234 1234 0 -1 4194560 100 0 0 0 5 3 0 0 20 0 4 0 98765 1000000 250 18446744073709551615";
        // Field 19 (0-indexed) is num_threads.
        assert_eq!(parse_stat_field(stat, 19), Some(4));
        // Field 21 is starttime.
        assert_eq!(parse_stat_field(stat, 21), Some(98765));
    }

    #[test]
    fn test_parse_stat_field_comm_with_spaces_and_parens() {
        let stat = "42 (Web Content (x)) R 1 42 42 0 -1 0 0 0 0 0 0 0 0 0 20 0 7 0 5555 0 0 0";
        assert_eq!(parse_stat_field(stat, 19), Some(7));
        assert_eq!(parse_stat_field(stat, 21), Some(5555));
    }

    #[test]
    fn test_parse_stat_field_malformed() {
        assert_eq!(parse_stat_field("no parens here", 21), None);
        assert_eq!(parse_stat_field("1 (x) S", 21), None);
    }

    #[test]
    fn test_identity_equality_requires_start_time() {
        let a = identity(100, 1000);
        let b = identity(100, 2000);
        assert_ne!(a, b, "same pid, different instance");
        assert_eq!(a, identity(100, 1000));
    }

    #[test]
    fn test_cache_upsert_and_get() {
        let cache = IdentityCache::new(16);
        let id = identity(100, 1000);

        assert!(cache.get(&id).is_none());

        cache.upsert(id, metadata("nginx"));
        let meta = cache.get(&id).expect("entry exists");
        assert_eq!(meta.name, "nginx");
        assert!(!meta.has_exited);
    }

    #[test]
    fn test_cache_get_misses_on_other_instance() {
        let cache = IdentityCache::new(16);
        cache.upsert(identity(100, 1000), metadata("old"));

        // Recycled pid with a newer start time must not hit the old entry.
        assert!(cache.get(&identity(100, 2000)).is_none());
    }

    #[test]
    fn test_cache_capacity_evicts_lru() {
        let cache = IdentityCache::new(2);
        let a = identity(1, 10);
        let b = identity(2, 20);
        let c = identity(3, 30);

        cache.upsert(a, metadata("a"));
        cache.upsert(b, metadata("b"));

        // Touch `a` so `b` is the LRU victim.
        assert!(cache.get(&a).is_some());
        cache.upsert(c, metadata("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
        assert_eq!(cache.eviction_count(), 1);
    }

    #[test]
    fn test_mark_exited_sets_state_and_demotes() {
        let cache = IdentityCache::new(2);
        let exited = identity(1, 10);
        let live = identity(2, 20);

        cache.upsert(exited, metadata("gone"));
        cache.upsert(live, metadata("alive"));

        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(99);
        cache.mark_exited(&exited, at);

        let meta = cache.get(&exited).expect("still cached after exit");
        assert!(meta.has_exited);
        assert_eq!(meta.exit_time, Some(at));

        // Exited entry is the preferred victim even though `live` is older
        // by insertion order.
        cache.mark_exited(&exited, at);
        cache.upsert(identity(3, 30), metadata("new"));
        assert!(cache.get(&exited).is_none());
        assert!(cache.get(&live).is_some());
    }

    #[test]
    fn test_mark_exited_unknown_identity_is_noop() {
        let cache = IdentityCache::new(4);
        cache.mark_exited(&identity(9, 9), SystemTime::UNIX_EPOCH);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_app_key_prefers_exe_name() {
        let meta = ProcessMetadata {
            name: "MainThread".to_string(),
            exe_path: Some(PathBuf::from("/usr/lib/firefox/firefox")),
            ..Default::default()
        };
        assert_eq!(meta.app_key(), "firefox");

        let bare = metadata("sshd");
        assert_eq!(bare.app_key(), "sshd");
    }

    #[test]
    fn test_cache_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(IdentityCache::new(64));
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..100u32 {
                    let id = identity(t * 100 + i, u64::from(i));
                    cache.upsert(id, metadata("p"));
                    let _ = cache.get(&id);
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        assert_eq!(cache.len(), 64);
    }
}

//! Memory budget tracking and admission control
//!
//! A `MemoryManager` is constructor-injected into each parse (no
//! process-wide singleton). It gates admission of chunk buffers and
//! cache entries against a fixed budget, and runs a background sampler
//! thread while `managed_processing` is active. When memory
//! introspection is unavailable on the host, usage degrades to a
//! coarse tracked-bytes estimate; monitoring never fails the parse.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Per-chunk memory overhead factor: a chunk's working set is roughly
/// twice its raw size (buffer plus rendered output).
const CHUNK_OVERHEAD: f64 = 2.0;

/// Largest cacheable object relative to the budget
const CACHE_OBJECT_RATIO: f64 = 0.10;

/// Memory budget and sampling parameters
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Budget in bytes
    pub max_memory_usage: usize,
    /// Usage ratio past which chunk sizes are shrunk
    pub warning_ratio: f64,
    /// Usage ratio past which cleanup runs and admission stops
    pub cleanup_ratio: f64,
    /// Background sampler polling interval
    pub sampling_interval: Duration,
    /// Whether cache admission is allowed at all
    pub enable_cache: bool,
    /// Time-to-live for cached objects
    pub cache_ttl: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_usage: 256 * 1024 * 1024,
            warning_ratio: 0.75,
            cleanup_ratio: 0.90,
            sampling_interval: Duration::from_millis(100),
            enable_cache: true,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Point-in-time memory snapshot
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryStatus {
    /// Current tracked usage in MB
    pub current_mb: f64,
    /// Peak tracked usage in MB
    pub peak_mb: f64,
    /// Current usage as a fraction of the budget
    pub usage_ratio: f64,
}

/// Alert observer invoked by the sampler with `(current_mb, ratio)`
pub type MemoryCallback = Box<dyn Fn(f64, f64) + Send + Sync>;

struct CacheEntry {
    value: String,
    size: usize,
    inserted_at: Instant,
}

struct TrackedState {
    /// Bytes explicitly tracked through acquire/release
    tracked_bytes: usize,
    /// Peak of the sampled usage in bytes
    peak_bytes: usize,
    /// Baseline process RSS at monitor start, subtracted from samples
    baseline_bytes: Option<usize>,
    cache: HashMap<String, CacheEntry>,
    cache_bytes: usize,
}

struct Shared {
    config: MemoryConfig,
    state: Mutex<TrackedState>,
    callbacks: Mutex<Vec<MemoryCallback>>,
    monitoring: AtomicBool,
}

/// Tracks process memory and gates admission against a budget
pub struct MemoryManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("status", &self.get_memory_status())
            .finish()
    }
}

impl MemoryManager {
    /// Creates a manager enforcing the given budget
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(TrackedState {
                    tracked_bytes: 0,
                    peak_bytes: 0,
                    baseline_bytes: None,
                    cache: HashMap::new(),
                    cache_bytes: 0,
                }),
                callbacks: Mutex::new(Vec::new()),
                monitoring: AtomicBool::new(false),
            }),
        }
    }

    /// Registers an alert callback invoked by the sampler thread
    pub fn add_callback(&self, callback: MemoryCallback) {
        self.shared.callbacks.lock().unwrap().push(callback);
    }

    /// Scoped acquisition: starts the background sampler and returns a
    /// guard that stops it and runs a cleanup pass on every exit path.
    pub fn managed_processing(&self) -> MemoryGuard {
        let shared = self.shared.clone();
        {
            let mut state = shared.state.lock().unwrap();
            state.baseline_bytes = process_rss_bytes();
            if state.baseline_bytes.is_none() {
                log::debug!("process memory introspection unavailable; using tracked estimate");
            }
        }
        shared.monitoring.store(true, Ordering::SeqCst);

        let sampler_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("markstream-memory".to_string())
            .spawn(move || sampler_loop(sampler_shared))
            .map_err(|e| {
                // Degrade: no sampler, counters still work
                log::warn!("failed to start memory sampler thread: {e}");
            })
            .ok();

        MemoryGuard {
            shared,
            handle,
        }
    }

    /// Returns a point-in-time snapshot of tracked usage
    pub fn get_memory_status(&self) -> MemoryStatus {
        let state = self.shared.state.lock().unwrap();
        let current = current_usage_bytes(&state);
        MemoryStatus {
            current_mb: current as f64 / BYTES_PER_MB,
            peak_mb: state.peak_bytes.max(current) as f64 / BYTES_PER_MB,
            usage_ratio: ratio(current, self.shared.config.max_memory_usage),
        }
    }

    /// Peak tracked usage in bytes
    pub fn peak_bytes(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.peak_bytes.max(current_usage_bytes(&state))
    }

    /// Estimated working-set cost of processing a chunk of `size`
    /// bytes, including the default overhead factor.
    pub fn estimate_chunk_memory(size: usize) -> usize {
        (size as f64 * CHUNK_OVERHEAD) as usize
    }

    /// Checks whether admitting a chunk of `size` bytes keeps
    /// projected usage below the cleanup threshold.
    pub fn can_process_chunk(&self, size: usize) -> bool {
        let state = self.shared.state.lock().unwrap();
        let projected = current_usage_bytes(&state) + Self::estimate_chunk_memory(size);
        ratio(projected, self.shared.config.max_memory_usage) < self.shared.config.cleanup_ratio
    }

    /// Records that a chunk buffer of `size` bytes is now live
    pub fn acquire_chunk(&self, size: usize) {
        let mut state = self.shared.state.lock().unwrap();
        state.tracked_bytes += Self::estimate_chunk_memory(size);
        let current = current_usage_bytes(&state);
        state.peak_bytes = state.peak_bytes.max(current);
    }

    /// Records that a chunk buffer of `size` bytes was released
    pub fn release_chunk(&self, size: usize) {
        let mut state = self.shared.state.lock().unwrap();
        let estimated = Self::estimate_chunk_memory(size);
        state.tracked_bytes = state.tracked_bytes.saturating_sub(estimated);
    }

    /// Shrinks `desired` proportionally once usage passes the warning
    /// threshold. Floor is 50% of `desired`; below the threshold the
    /// size is returned unchanged.
    pub fn optimize_chunk_size(&self, desired: usize) -> usize {
        let status = self.get_memory_status();
        let warning = self.shared.config.warning_ratio;
        let cleanup = self.shared.config.cleanup_ratio;

        if status.usage_ratio <= warning {
            return desired;
        }

        let span = (cleanup - warning).max(f64::EPSILON);
        let factor = ((cleanup - status.usage_ratio) / span).clamp(0.5, 1.0);
        ((desired as f64 * factor) as usize).max(1)
    }

    /// Caches an object under `key`. Admission is silently rejected
    /// once usage passes the cleanup threshold, when the object is
    /// larger than 10% of the budget, or when caching is disabled.
    pub fn cache_object(&self, key: &str, value: String) {
        let size = value.len();
        if !self.can_cache(size) {
            log::debug!("cache admission rejected for '{key}' ({size} bytes)");
            return;
        }

        let mut state = self.shared.state.lock().unwrap();
        if let Some(old) = state.cache.insert(
            key.to_string(),
            CacheEntry {
                value,
                size,
                inserted_at: Instant::now(),
            },
        ) {
            state.cache_bytes = state.cache_bytes.saturating_sub(old.size);
        }
        state.cache_bytes += size;
    }

    /// Looks up a cached object, honoring the TTL
    pub fn get_cached_object(&self, key: &str) -> Option<String> {
        let mut state = self.shared.state.lock().unwrap();
        let expired = match state.cache.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.shared.config.cache_ttl,
            None => return None,
        };

        if expired {
            if let Some(entry) = state.cache.remove(key) {
                state.cache_bytes = state.cache_bytes.saturating_sub(entry.size);
            }
            return None;
        }

        state.cache.get(key).map(|entry| entry.value.clone())
    }

    /// Synchronous cleanup pass: drops expired cache entries first,
    /// then the whole cache if usage is still past the threshold.
    pub fn force_cleanup(&self) {
        let mut state = self.shared.state.lock().unwrap();
        evict(&mut state, &self.shared.config);
    }

    fn can_cache(&self, object_size: usize) -> bool {
        if !self.shared.config.enable_cache {
            return false;
        }
        let budget = self.shared.config.max_memory_usage;
        if object_size as f64 > budget as f64 * CACHE_OBJECT_RATIO {
            return false;
        }
        let state = self.shared.state.lock().unwrap();
        ratio(current_usage_bytes(&state), budget) <= self.shared.config.cleanup_ratio
    }

    #[cfg(test)]
    fn cached_entry_count(&self) -> usize {
        self.shared.state.lock().unwrap().cache.len()
    }
}

/// RAII guard returned by `managed_processing`; stops the sampler and
/// runs a final cleanup when dropped, on every exit path.
pub struct MemoryGuard {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        self.shared.monitoring.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut state = self.shared.state.lock().unwrap();
        evict(&mut state, &self.shared.config);
    }
}

fn sampler_loop(shared: Arc<Shared>) {
    while shared.monitoring.load(Ordering::SeqCst) {
        let (current_mb, usage_ratio, over_cleanup) = {
            let mut state = shared.state.lock().unwrap();
            let current = current_usage_bytes(&state);
            state.peak_bytes = state.peak_bytes.max(current);
            let usage_ratio = ratio(current, shared.config.max_memory_usage);
            (
                current as f64 / BYTES_PER_MB,
                usage_ratio,
                usage_ratio >= shared.config.cleanup_ratio,
            )
        };

        if over_cleanup {
            log::debug!("memory pressure: usage ratio {usage_ratio:.2}, running cleanup");
            let mut state = shared.state.lock().unwrap();
            evict(&mut state, &shared.config);
        }

        let callbacks = shared.callbacks.lock().unwrap();
        for callback in callbacks.iter() {
            callback(current_mb, usage_ratio);
        }
        drop(callbacks);

        std::thread::sleep(shared.config.sampling_interval);
    }
}

/// Current usage: process RSS above the monitoring baseline when
/// available, otherwise the coarse tracked estimate.
fn current_usage_bytes(state: &TrackedState) -> usize {
    if let Some(baseline) = state.baseline_bytes {
        if let Some(rss) = process_rss_bytes() {
            return rss.saturating_sub(baseline) + state.cache_bytes;
        }
    }
    state.tracked_bytes + state.cache_bytes
}

fn evict(state: &mut TrackedState, config: &MemoryConfig) {
    let ttl = config.cache_ttl;
    state
        .cache
        .retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
    state.cache_bytes = state.cache.values().map(|e| e.size).sum();

    let current = current_usage_bytes(state);
    if ratio(current, config.max_memory_usage) >= config.cleanup_ratio {
        state.cache.clear();
        state.cache_bytes = 0;
    }
}

fn ratio(bytes: usize, budget: usize) -> f64 {
    if budget == 0 {
        return 1.0;
    }
    bytes as f64 / budget as f64
}

/// Resident set size of the current process, when the host exposes
/// it. `VmRSS` is reported in kB, so no page-size assumption is
/// needed.
#[cfg(target_os = "linux")]
fn process_rss_bytes() -> Option<usize> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: usize = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn process_rss_bytes() -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(budget: usize) -> MemoryConfig {
        MemoryConfig {
            max_memory_usage: budget,
            sampling_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Manager whose usage comes only from the injected counters, so
    /// assertions do not depend on host RSS.
    fn tracked_only_manager(budget: usize) -> MemoryManager {
        MemoryManager::new(test_config(budget))
    }

    #[test]
    fn test_estimate_chunk_memory() {
        assert_eq!(MemoryManager::estimate_chunk_memory(1000), 2000);
        assert_eq!(MemoryManager::estimate_chunk_memory(0), 0);
    }

    #[test]
    fn test_admission_against_budget() {
        let manager = tracked_only_manager(1000);
        // 2x overhead: a 400-byte chunk projects to 800 of 1000,
        // still under the 0.9 cleanup threshold
        assert!(manager.can_process_chunk(400));
        // A 500-byte chunk projects exactly to the threshold
        assert!(!manager.can_process_chunk(500));
    }

    #[test]
    fn test_acquire_release_cycle() {
        let manager = tracked_only_manager(10_000);
        manager.acquire_chunk(1000);
        assert!(manager.get_memory_status().usage_ratio > 0.0);
        assert!(!manager.can_process_chunk(4000));

        manager.release_chunk(1000);
        assert!(manager.can_process_chunk(4000));

        // Peak survives the release
        assert!(manager.peak_bytes() >= 2000);
    }

    #[test]
    fn test_optimize_chunk_size_below_warning() {
        let manager = tracked_only_manager(1_000_000);
        assert_eq!(manager.optimize_chunk_size(4096), 4096);
    }

    #[test]
    fn test_optimize_chunk_size_under_pressure() {
        let manager = tracked_only_manager(1000);
        manager.acquire_chunk(440); // 880 tracked of 1000: past warning

        let shrunk = manager.optimize_chunk_size(4096);
        assert!(shrunk < 4096);
        assert!(shrunk >= 2048, "floor is 50% of desired, got {shrunk}");
    }

    #[test]
    fn test_cache_round_trip() {
        let manager = tracked_only_manager(1_000_000);
        manager.cache_object("chunk:0", "rendered".to_string());
        assert_eq!(
            manager.get_cached_object("chunk:0").as_deref(),
            Some("rendered")
        );
        assert_eq!(manager.get_cached_object("chunk:1"), None);
    }

    #[test]
    fn test_cache_rejects_oversized_objects() {
        let manager = tracked_only_manager(1000);
        // 10% of budget is 100 bytes
        manager.cache_object("big", "x".repeat(200));
        assert_eq!(manager.get_cached_object("big"), None);
        assert_eq!(manager.cached_entry_count(), 0);
    }

    #[test]
    fn test_cache_rejects_under_pressure() {
        let manager = tracked_only_manager(1000);
        manager.acquire_chunk(460); // 920 of 1000: past cleanup ratio
        manager.cache_object("late", "y".repeat(10));
        assert_eq!(manager.cached_entry_count(), 0);
    }

    #[test]
    fn test_cache_respects_ttl() {
        let config = MemoryConfig {
            cache_ttl: Duration::from_millis(0),
            ..test_config(1_000_000)
        };
        let manager = MemoryManager::new(config);
        manager.cache_object("ephemeral", "value".to_string());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.get_cached_object("ephemeral"), None);
    }

    #[test]
    fn test_cache_disabled() {
        let config = MemoryConfig {
            enable_cache: false,
            ..test_config(1_000_000)
        };
        let manager = MemoryManager::new(config);
        manager.cache_object("k", "v".to_string());
        assert_eq!(manager.get_cached_object("k"), None);
    }

    #[test]
    fn test_force_cleanup_under_pressure_clears_cache() {
        let manager = tracked_only_manager(1000);
        manager.cache_object("k", "v".repeat(50));
        assert_eq!(manager.cached_entry_count(), 1);

        manager.acquire_chunk(500); // push usage past cleanup ratio
        manager.force_cleanup();
        assert_eq!(manager.cached_entry_count(), 0);
    }

    #[test]
    fn test_sampler_invokes_callbacks() {
        let manager = tracked_only_manager(1_000_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        manager.add_callback(Box::new(move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        {
            let _guard = manager.managed_processing();
            std::thread::sleep(Duration::from_millis(50));
        }

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rss_probe_reports_resident_memory() {
        let rss = process_rss_bytes().expect("VmRSS should be readable on Linux");
        assert!(rss > 0);
    }

    #[test]
    fn test_guard_stops_sampler_on_drop() {
        let manager = tracked_only_manager(1_000_000);
        {
            let _guard = manager.managed_processing();
        }
        assert!(!manager.shared.monitoring.load(Ordering::SeqCst));
    }
}

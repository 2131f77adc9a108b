//! Adaptive chunk sizing from file size and runtime feedback
//!
//! The sizer picks a base chunk size from a step function of the file
//! size, caps it by available memory, and corrects it using a window
//! of recent per-chunk metrics when they show memory pressure or
//! unstable chunk timings.

use std::time::Duration;

/// Base sizes for the file-size step function
const SMALL_FILE_LIMIT: u64 = 1024 * 1024; // 1MB
const MEDIUM_FILE_LIMIT: u64 = 100 * 1024 * 1024; // 100MB
const SMALL_CHUNK: usize = 64 * 1024;
const MEDIUM_CHUNK: usize = 512 * 1024;
const HUGE_CHUNK: usize = 4 * 1024 * 1024;

/// Memory-pressure boundaries for the correction factor
const MEMORY_PRESSURE_RATIO: f64 = 0.8;
const MEMORY_UNDERUSE_RATIO: f64 = 0.4;
const PRESSURE_FACTOR: f64 = 0.7;
const UNDERUSE_FACTOR: f64 = 1.2;

/// Observed cost of processing one chunk
#[derive(Debug, Clone)]
pub struct ChunkMetrics {
    /// Size of the chunk in bytes
    pub chunk_size: usize,
    /// Wall time spent processing the chunk
    pub duration: Duration,
    /// Peak memory usage during the chunk, as a fraction of budget
    pub memory_ratio: f64,
}

/// Computes the next chunk size from file size, available memory, and
/// recent throughput/memory metrics
#[derive(Debug, Clone)]
pub struct AdaptiveChunkSizer {
    min_chunk_size: usize,
    max_chunk_size: usize,
    /// Processing time to aim for per chunk
    target_chunk_time: Duration,
}

impl AdaptiveChunkSizer {
    /// Creates a sizer clamped to `[min_chunk_size, max_chunk_size]`
    pub fn new(min_chunk_size: usize, max_chunk_size: usize) -> Self {
        Self {
            min_chunk_size,
            max_chunk_size,
            target_chunk_time: Duration::from_millis(100),
        }
    }

    /// Overrides the per-chunk processing time target
    pub fn with_target_chunk_time(mut self, target: Duration) -> Self {
        self.target_chunk_time = target;
        self
    }

    /// Computes the optimal chunk size.
    ///
    /// `file_size` is `None` for unsized streams, which fall back to
    /// the medium base size. `recent` is a window of metrics from the
    /// chunks just processed; corrections only apply when it shows
    /// memory peak above 80% of budget or chunk-time variance above
    /// 50% of the mean.
    pub fn get_optimal_chunk_size(
        &self,
        file_size: Option<u64>,
        available_memory: usize,
        recent: &[ChunkMetrics],
    ) -> usize {
        let base = match file_size {
            Some(size) if size < SMALL_FILE_LIMIT => SMALL_CHUNK,
            Some(size) if size < MEDIUM_FILE_LIMIT => MEDIUM_CHUNK,
            Some(_) => HUGE_CHUNK,
            None => MEDIUM_CHUNK,
        };

        let capped = base.min((available_memory / 4).max(1));
        let corrected = self.apply_corrections(capped, recent);

        corrected.clamp(self.min_chunk_size, self.max_chunk_size)
    }

    fn apply_corrections(&self, size: usize, recent: &[ChunkMetrics]) -> usize {
        if recent.is_empty() {
            return size;
        }

        let peak_memory = recent
            .iter()
            .map(|m| m.memory_ratio)
            .fold(0.0_f64, f64::max);
        let times: Vec<f64> = recent.iter().map(|m| m.duration.as_secs_f64()).collect();
        let mean = times.iter().sum::<f64>() / times.len() as f64;
        let variance = times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / times.len() as f64;
        let unstable_timing = mean > 0.0 && variance.sqrt() > mean * 0.5;

        if peak_memory <= MEMORY_PRESSURE_RATIO && !unstable_timing {
            return size;
        }

        let memory_factor = if peak_memory > MEMORY_PRESSURE_RATIO {
            PRESSURE_FACTOR
        } else if peak_memory < MEMORY_UNDERUSE_RATIO {
            UNDERUSE_FACTOR
        } else {
            1.0
        };

        let time_factor = if mean > 0.0 {
            (self.target_chunk_time.as_secs_f64() / mean).clamp(0.5, 2.0)
        } else {
            1.0
        };

        ((size as f64 * memory_factor * time_factor) as usize).max(1)
    }
}

//! Streaming parse orchestration
//!
//! `StreamingParser` composes the chunk manager, chunk processor,
//! memory manager, progress tracker, and adaptive sizer into the
//! `parse_file` / `parse_stream` / `parse_file_async` entry points.
//! Chunk processing for a single parse is sequential and ordered; an
//! optional parallel mode processes block-aligned groups of chunks
//! concurrently and reassembles results strictly by index.

use crate::adaptive::{AdaptiveChunkSizer, ChunkMetrics};
use crate::chunking::{ChunkIter, ChunkManager};
use crate::config::StreamingParserConfig;
use crate::error::{ParserError, Result};
use crate::memory::{MemoryConfig, MemoryManager};
use crate::processor::{ChunkProcessor, MarkupProcessor, PlainRenderer, ProcessingContext};
use crate::progress::{ProgressInfo, ProgressState, ProgressTracker};

use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Number of recent chunk metrics kept for adaptive sizing
const METRICS_WINDOW: usize = 8;

/// Final result of one parse call
#[derive(Debug, Clone, Serialize)]
pub struct ParseResult {
    /// Assembled output content
    pub content: String,
    /// Parse-level metadata (cancellation flag, source, counters)
    pub metadata: HashMap<String, String>,
    /// Errors in chunk order; processing continued past each
    pub errors: Vec<String>,
    /// Warnings in chunk order
    pub warnings: Vec<String>,
    /// Wall time spent in the parse
    pub processing_time: Duration,
    /// Peak tracked memory in bytes
    pub memory_peak: usize,
    /// Number of chunks consumed
    pub chunks_processed: usize,
}

impl ParseResult {
    /// True when the parse stopped early due to cancellation
    pub fn was_cancelled(&self) -> bool {
        self.metadata.get("cancelled").map(String::as_str) == Some("true")
    }
}

/// Read-only chunking diagnostics for a source file
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChunkInfo {
    /// Source size in bytes
    pub file_size: u64,
    /// Chunk size the parser would use
    pub chunk_size: usize,
    /// Estimated number of chunks
    pub estimated_chunks: usize,
}

/// Per-call options for the parse entry points
#[derive(Default, Clone)]
pub struct ParseOptions {
    /// Explicit chunk size, overriding adaptive sizing
    pub chunk_size: Option<usize>,
    /// Memory budget override in bytes
    pub max_memory: Option<usize>,
    /// Observer forwarded progress snapshots, throttled by the
    /// configured progress interval
    pub progress_callback: Option<Arc<dyn Fn(&ProgressInfo) + Send + Sync>>,
    /// Externally owned tracker, e.g. to cancel the parse from
    /// another thread. One is created internally when absent.
    pub tracker: Option<Arc<ProgressTracker>>,
}

impl std::fmt::Debug for ParseOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParseOptions")
            .field("chunk_size", &self.chunk_size)
            .field("max_memory", &self.max_memory)
            .field("has_progress_callback", &self.progress_callback.is_some())
            .field("has_tracker", &self.tracker.is_some())
            .finish()
    }
}

/// Cancellable handle for an asynchronous parse
pub struct ParseHandle {
    tracker: Arc<ProgressTracker>,
    handle: JoinHandle<Result<ParseResult>>,
}

impl ParseHandle {
    /// Requests cooperative cancellation of the running parse
    pub fn cancel(&self) {
        self.tracker.cancel(None);
    }

    /// Tracker shared with the running parse
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// True once the worker has finished
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the parse to finish and returns its result
    pub fn join(self) -> Result<ParseResult> {
        self.handle.join().unwrap_or_else(|_| {
            Err(ParserError::Worker {
                reason: "parse worker panicked".to_string(),
            })
        })
    }
}

/// Streaming parser for block-delimited markup
pub struct StreamingParser {
    config: StreamingParserConfig,
    processor: Arc<dyn ChunkProcessor>,
}

impl std::fmt::Debug for StreamingParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingParser")
            .field("config", &self.config)
            .finish()
    }
}

impl StreamingParser {
    /// Creates a parser with the built-in markup processor.
    ///
    /// Fails with `ParserError::Configuration` when the configuration
    /// is invalid; this is never deferred to parse time.
    pub fn new(config: StreamingParserConfig) -> Result<Self> {
        Self::with_processor(config, Arc::new(MarkupProcessor::new(PlainRenderer)))
    }

    /// Creates a parser with a custom chunk processor
    pub fn with_processor(
        config: StreamingParserConfig,
        processor: Arc<dyn ChunkProcessor>,
    ) -> Result<Self> {
        let violations = config.validate();
        if !violations.is_empty() {
            return Err(ParserError::from_violations(violations));
        }
        Ok(Self { config, processor })
    }

    /// Parser configuration
    pub fn config(&self) -> &StreamingParserConfig {
        &self.config
    }

    /// Parses a file into a `ParseResult`.
    ///
    /// Fails fast when `path` does not exist. Cancellation mid-stream
    /// still yields a normal result with best-effort content and
    /// `metadata["cancelled"] = "true"`.
    pub fn parse_file(&self, path: impl AsRef<Path>, options: ParseOptions) -> Result<ParseResult> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ParserError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ParserError::from(e)
            }
        })?;

        let file = File::open(path)?;
        let mut result = self.run_pipeline(file, Some(metadata.len()), options)?;
        result
            .metadata
            .insert("source".to_string(), path.display().to_string());
        Ok(result)
    }

    /// Parses an already-open stream. `total_size` is optional; when
    /// absent, ratio-based progress reporting is disabled.
    pub fn parse_stream<R: Read>(
        &self,
        reader: R,
        total_size: Option<u64>,
        options: ParseOptions,
    ) -> Result<ParseResult> {
        self.run_pipeline(reader, total_size, options)
    }

    /// Runs `parse_file` on a dedicated worker thread, returning a
    /// cancellable handle sharing the parse's progress tracker.
    pub fn parse_file_async(
        &self,
        path: impl Into<PathBuf>,
        mut options: ParseOptions,
    ) -> Result<ParseHandle> {
        let path = path.into();
        let tracker = options
            .tracker
            .take()
            .unwrap_or_else(|| Arc::new(ProgressTracker::new(None, None)));
        options.tracker = Some(tracker.clone());

        let worker = Self {
            config: self.config.clone(),
            processor: self.processor.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("markstream-parse".to_string())
            .spawn(move || worker.parse_file(&path, options))
            .map_err(|e| ParserError::Worker {
                reason: format!("failed to spawn parse worker: {e}"),
            })?;

        Ok(ParseHandle { tracker, handle })
    }

    /// Read-only chunking diagnostics for `path`; never mutates
    /// parser state.
    pub fn get_chunk_info(&self, path: impl AsRef<Path>) -> Result<ChunkInfo> {
        let file_size = std::fs::metadata(path.as_ref())?.len();
        let chunk_size = self.effective_chunk_size(None, Some(file_size));
        Ok(ChunkInfo {
            file_size,
            chunk_size,
            estimated_chunks: ChunkManager::estimate_chunks_count(file_size, chunk_size),
        })
    }

    /// Estimated peak working-set in bytes for parsing `path`
    pub fn estimate_memory_usage(&self, path: impl AsRef<Path>) -> Result<usize> {
        let info = self.get_chunk_info(path)?;
        Ok(MemoryManager::estimate_chunk_memory(info.chunk_size))
    }

    /// Effective chunk size: explicit beats adaptive
    fn effective_chunk_size(&self, explicit: Option<usize>, total_size: Option<u64>) -> usize {
        match explicit {
            Some(size) => size.max(1),
            None => {
                let sizer =
                    AdaptiveChunkSizer::new(self.config.min_chunk_size, self.config.max_chunk_size);
                sizer.get_optimal_chunk_size(total_size, self.config.max_memory_usage, &[])
            }
        }
    }

    fn memory_manager(&self, budget: usize) -> MemoryManager {
        MemoryManager::new(MemoryConfig {
            max_memory_usage: budget,
            enable_cache: self.config.enable_cache,
            cache_ttl: self.config.cache_ttl,
            ..Default::default()
        })
    }

    /// Wires the user progress callback behind interval throttling.
    /// Terminal-state snapshots are always forwarded.
    fn wire_progress_callback(
        &self,
        tracker: &ProgressTracker,
        callback: Arc<dyn Fn(&ProgressInfo) + Send + Sync>,
    ) {
        let interval = self.config.progress_interval as u64;
        let last_forwarded = AtomicU64::new(0);
        tracker.add_callback(Box::new(move |info| {
            let due = info.state != ProgressState::Running
                || info
                    .processed_bytes
                    .saturating_sub(last_forwarded.load(Ordering::Relaxed))
                    >= interval;
            if due {
                last_forwarded.store(info.processed_bytes, Ordering::Relaxed);
                callback(info);
            }
        }));
    }

    /// The synchronous parse pipeline shared by every entry point
    fn run_pipeline<R: Read>(
        &self,
        reader: R,
        total_size: Option<u64>,
        options: ParseOptions,
    ) -> Result<ParseResult> {
        let start = Instant::now();
        let budget = options.max_memory.unwrap_or(self.config.max_memory_usage);
        let chunk_size = self.effective_chunk_size(options.chunk_size, total_size);

        let tracker = options
            .tracker
            .clone()
            .unwrap_or_else(|| Arc::new(ProgressTracker::new(None, None)));
        tracker.set_totals(
            total_size,
            total_size.map(|s| ChunkManager::estimate_chunks_count(s, chunk_size)),
        );
        if let Some(callback) = options.progress_callback.clone() {
            self.wire_progress_callback(&tracker, callback);
        }

        let memory = self.memory_manager(budget);
        let _monitor = memory.managed_processing();
        tracker.start();

        let manager = ChunkManager::new(chunk_size);
        let chunks = manager.create_chunks(reader);

        #[cfg(feature = "parallel")]
        let outcome = if self.config.worker_threads > 1 {
            self.drive_parallel(chunks, &tracker, &memory)
        } else {
            self.drive_sequential(chunks, total_size, budget, &tracker, &memory, &options)
        };
        #[cfg(not(feature = "parallel"))]
        let outcome = self.drive_sequential(chunks, total_size, budget, &tracker, &memory, &options);

        let (merged, chunks_processed, cancelled) = match outcome {
            Ok(v) => v,
            Err(e) => {
                tracker.error(e.to_string());
                return Err(e);
            }
        };

        if cancelled {
            log::debug!("parse cancelled after {chunks_processed} chunks");
        } else {
            tracker.complete(None);
        }

        let mut metadata = HashMap::new();
        metadata.insert("cancelled".to_string(), cancelled.to_string());
        metadata.insert("chunk_size".to_string(), chunk_size.to_string());
        metadata.insert(
            "worker_threads".to_string(),
            self.config.worker_threads.to_string(),
        );

        Ok(ParseResult {
            content: merged.content,
            metadata,
            errors: merged.errors,
            warnings: merged.warnings,
            processing_time: start.elapsed(),
            memory_peak: memory.peak_bytes(),
            chunks_processed,
        })
    }

    /// Sequential, ordered chunk loop with carry-over context
    fn drive_sequential<R: Read>(
        &self,
        mut chunks: ChunkIter<R>,
        total_size: Option<u64>,
        budget: usize,
        tracker: &ProgressTracker,
        memory: &MemoryManager,
        options: &ParseOptions,
    ) -> Result<(crate::processor::MergedOutput, usize, bool)> {
        let sizer =
            AdaptiveChunkSizer::new(self.config.min_chunk_size, self.config.max_chunk_size);
        let mut ctx = ProcessingContext::new();
        let mut outputs = Vec::new();
        let mut recent: Vec<ChunkMetrics> = Vec::with_capacity(METRICS_WINDOW);
        let mut processed_bytes: u64 = 0;
        let mut chunks_processed = 0;
        let mut cancelled = false;
        let mut is_first = true;

        // One chunk of lookahead so the processor learns which chunk
        // is the last one.
        let mut next = chunks.next().transpose()?;

        while let Some(chunk) = next.take() {
            if tracker.is_cancelled() {
                cancelled = true;
                break;
            }

            // Memory admission: on rejection force a cleanup and
            // proceed regardless, logging the pressure.
            if !memory.can_process_chunk(chunk.len()) {
                memory.force_cleanup();
                if !memory.can_process_chunk(chunk.len()) {
                    log::warn!(
                        "chunk {} ({} bytes) exceeds memory admission after cleanup; \
                         continuing under pressure",
                        chunk.metadata.index,
                        chunk.len()
                    );
                }
            }

            next = chunks.next().transpose()?;
            let is_last = next.is_none();

            memory.acquire_chunk(chunk.len());
            let chunk_start = Instant::now();
            let output = self.processor.process_chunk(
                &chunk.content,
                chunk.metadata.index,
                is_first,
                is_last,
                &mut ctx,
            );
            let elapsed = chunk_start.elapsed();
            memory.release_chunk(chunk.len());

            processed_bytes += chunk.len() as u64;
            chunks_processed += 1;
            tracker.update(processed_bytes, chunk.metadata.index);
            outputs.push(output);

            if recent.len() == METRICS_WINDOW {
                recent.remove(0);
            }
            recent.push(ChunkMetrics {
                chunk_size: chunk.len(),
                duration: elapsed,
                memory_ratio: memory.get_memory_status().usage_ratio,
            });

            // Retarget the next chunk under memory/throughput feedback
            // unless the caller pinned an explicit size.
            if options.chunk_size.is_none() {
                let desired = sizer.get_optimal_chunk_size(total_size, budget, &recent);
                chunks.set_chunk_size(memory.optimize_chunk_size(desired));
            }

            is_first = false;
        }

        let merged = self.processor.merge_results(outputs, &mut ctx);
        Ok((merged, chunks_processed, cancelled))
    }

    /// Parallel mode: chunks are regrouped into block-aligned units,
    /// units processed concurrently with per-unit contexts, and
    /// results reassembled strictly by unit index. Units are gathered
    /// in bounded batches so the source is never fully buffered.
    #[cfg(feature = "parallel")]
    fn drive_parallel<R: Read>(
        &self,
        mut chunks: ChunkIter<R>,
        tracker: &ProgressTracker,
        memory: &MemoryManager,
    ) -> Result<(crate::processor::MergedOutput, usize, bool)> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.worker_threads)
            .thread_name(|i| format!("markstream-worker-{i}"))
            .build()
            .map_err(|e| ParserError::Worker {
                reason: format!("failed to build worker pool: {e}"),
            })?;

        // Enough units in flight to keep the pool busy without
        // materializing the whole source.
        let batch_limit = self.config.worker_threads * 2;

        let mut scanner = UnitScanner::default();
        let mut current = String::new();
        let mut batch: Vec<String> = Vec::new();
        let mut outputs = Vec::new();
        let mut chunks_processed = 0;
        let mut unit_index = 0;
        let mut cancelled = false;
        let mut exhausted = false;

        let processor = &self.processor;

        while !exhausted || !batch.is_empty() {
            while !exhausted && batch.len() < batch_limit {
                if tracker.is_cancelled() {
                    cancelled = true;
                    current.clear();
                    exhausted = true;
                    break;
                }
                match chunks.next().transpose()? {
                    Some(chunk) => {
                        if !memory.can_process_chunk(chunk.len()) {
                            memory.force_cleanup();
                            if !memory.can_process_chunk(chunk.len()) {
                                log::warn!(
                                    "chunk {} ({} bytes) exceeds memory admission after cleanup; \
                                     continuing under pressure",
                                    chunk.metadata.index,
                                    chunk.len()
                                );
                            }
                        }
                        chunks_processed += 1;
                        scanner.feed(&chunk.content);
                        current.push_str(&chunk.content);
                        if scanner.at_boundary() {
                            batch.push(std::mem::take(&mut current));
                        }
                    }
                    None => {
                        exhausted = true;
                        if !current.is_empty() {
                            batch.push(std::mem::take(&mut current));
                        }
                    }
                }
            }

            if batch.is_empty() {
                break;
            }

            let units = std::mem::take(&mut batch);
            let batch_outputs: Vec<Option<_>> = pool.install(|| {
                units
                    .par_iter()
                    .enumerate()
                    .map(|(offset, unit)| {
                        // Cooperative cancellation: skip units not yet
                        // dequeued once the flag is raised.
                        if tracker.is_cancelled() {
                            return None;
                        }
                        let index = unit_index + offset;
                        memory.acquire_chunk(unit.len());
                        let mut ctx = ProcessingContext::new();
                        // Units are block-aligned, so each one is closed
                        // as if it were the end of its own input.
                        let output =
                            processor.process_chunk(unit, index, index == 0, true, &mut ctx);
                        memory.release_chunk(unit.len());
                        tracker.increment(unit.len() as u64);
                        Some(output)
                    })
                    .collect()
            });
            unit_index += units.len();
            outputs.extend(batch_outputs.into_iter().flatten());
        }

        let cancelled = cancelled || tracker.is_cancelled();
        let mut ctx = ProcessingContext::new();
        let merged = self.processor.merge_results(outputs, &mut ctx);

        Ok((merged, chunks_processed, cancelled))
    }
}

/// Incremental scanner deciding where concatenated chunks may be cut
/// into independently processable units.
///
/// A boundary is only safe when nothing carries across it: the text is
/// outside any block, no partial line is pending, and the last whole
/// line either closed a block or was blank (which flushes the pending
/// paragraph). A stray closing marker is paragraph text, not a
/// boundary.
#[cfg(feature = "parallel")]
#[derive(Default)]
struct UnitScanner {
    in_block: bool,
    tail: String,
    boundary: bool,
}

#[cfg(feature = "parallel")]
impl UnitScanner {
    fn feed(&mut self, content: &str) {
        use crate::chunking::{is_close_marker, is_open_marker};

        let mut text = std::mem::take(&mut self.tail);
        text.push_str(content);
        if !text.ends_with('\n') {
            self.tail = match text.rfind('\n') {
                Some(pos) => text.split_off(pos + 1),
                None => std::mem::take(&mut text),
            };
        }

        for line in text.split_inclusive('\n') {
            self.boundary = if self.in_block {
                if is_close_marker(line) {
                    self.in_block = false;
                    true
                } else {
                    false
                }
            } else if is_open_marker(line) {
                self.in_block = true;
                false
            } else {
                line.trim().is_empty()
            };
        }
    }

    fn at_boundary(&self) -> bool {
        self.boundary && self.tail.is_empty() && !self.in_block
    }
}

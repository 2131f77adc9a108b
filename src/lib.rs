//! Streaming parser for block-delimited markup with bounded memory
//!
//! markstream converts arbitrarily large documents written in a
//! `;;;`-delimited block notation while keeping peak memory bounded,
//! reporting progress, and supporting cooperative cancellation. The
//! core splits the input into bounded-size chunks at safe boundaries
//! (block end, blank line, line, forced cut), adapts the chunk size to
//! memory and throughput feedback, and reassembles per-chunk results
//! into one coherent output while a background thread enforces the
//! memory budget.
//!
//! Semantic rendering is pluggable: the core only guarantees
//! block-boundary integrity across chunk splits and hands well-formed
//! block text to a [`BlockRenderer`].
//!
//! # Example
//!
//! ```rust
//! use markstream::{ParseOptions, StreamingParser, StreamingParserConfig};
//! use std::io::Cursor;
//!
//! let parser = StreamingParser::new(StreamingParserConfig::default()).unwrap();
//! let doc = ";;;heading1\nTitle\n;;;\n\nBody text\n";
//!
//! let result = parser
//!     .parse_stream(Cursor::new(doc.as_bytes()), Some(doc.len() as u64), ParseOptions::default())
//!     .unwrap();
//!
//! assert!(result.content.contains("Title"));
//! assert_eq!(result.errors.len(), 0);
//! ```

pub mod adaptive;
pub mod chunking;
pub mod config;
pub mod error;
pub mod memory;
pub mod processor;
pub mod progress;

mod parser;

pub use adaptive::{AdaptiveChunkSizer, ChunkMetrics};
pub use chunking::{Chunk, ChunkIter, ChunkManager, ChunkMetadata};
pub use config::{StreamingParserConfig, StreamingParserConfigBuilder};
pub use error::{ParserError, Result};
pub use memory::{MemoryConfig, MemoryManager, MemoryStatus};
pub use parser::{ChunkInfo, ParseHandle, ParseOptions, ParseResult, StreamingParser};
pub use processor::{
    BlockRenderer, BlockState, ChunkOutput, ChunkProcessor, MarkupProcessor, MergedOutput,
    PlainRenderer, ProcessingContext,
};
pub use progress::{ProgressInfo, ProgressState, ProgressTracker};

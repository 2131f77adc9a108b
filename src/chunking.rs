//! Streaming chunking and boundary management
//!
//! This module splits an input stream into bounded-size chunks without
//! corrupting block structure. Split points are chosen by priority:
//! end of the last fully-closed block, last blank-line boundary, last
//! line boundary, and finally a hard cut backed off to a UTF-8
//! character boundary. Concatenating raw chunk contents always
//! reproduces the source byte-for-byte.

use crate::error::{ParserError, Result};
use std::io::Read;

/// Block delimiter: a line starting with this sequence opens a block
/// (when followed by a type header) or closes one (when it is the
/// entire line).
pub const BLOCK_MARKER: &str = ";;;";

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Extra bytes buffered past the target chunk size so a hard cut at
/// the size limit can see whether it would land inside a multi-byte
/// UTF-8 sequence.
const UTF8_LOOKAHEAD: usize = 3;

/// Returns true if `line` (without its trailing newline) opens a block.
pub(crate) fn is_open_marker(line: &str) -> bool {
    let line = line.trim_end_matches(['\r', '\n']);
    line.starts_with(BLOCK_MARKER) && !line[BLOCK_MARKER.len()..].trim().is_empty()
}

/// Returns true if `line` (without its trailing newline) closes a block.
pub(crate) fn is_close_marker(line: &str) -> bool {
    line.trim_end() == BLOCK_MARKER
}

/// Metadata describing one chunk's position and block structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetadata {
    /// Sequence position of this chunk (0-based)
    pub index: usize,

    /// Absolute byte offset of the chunk start in the source
    pub start_offset: usize,

    /// Absolute byte offset one past the chunk end
    pub end_offset: usize,

    /// Chunk length in bytes
    pub size: usize,

    /// True if at least one block opens and closes entirely within
    /// this chunk
    pub has_complete_blocks: bool,

    /// Chunk-relative offset of the opening marker of a block left
    /// unterminated at the chunk end. `Some(0)` means the chunk is a
    /// continuation of a block opened in an earlier chunk.
    pub incomplete_block_start: Option<usize>,

    /// Chunk-relative end offset of the closing marker that completes
    /// a block begun in an earlier chunk
    pub incomplete_block_end: Option<usize>,

    /// 1-based line numbers of the first and last line in this chunk
    pub line_range: (usize, usize),
}

/// A chunk of source text paired with its metadata
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Raw source text of this chunk
    pub content: String,

    /// Position and block-structure metadata
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Returns the byte length of this chunk
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Returns true if this chunk is empty
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Splits a stream into chunks at safe block boundaries
#[derive(Debug, Clone)]
pub struct ChunkManager {
    chunk_size: usize,
}

impl ChunkManager {
    /// Creates a manager that targets `chunk_size` bytes per chunk
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Returns the current target chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Produces a lazy sequence of chunks from `reader`.
    ///
    /// The iterator is finite and not restartable: it consumes the
    /// reader's position. An I/O error ends the sequence after being
    /// yielded once.
    pub fn create_chunks<R: Read>(&self, reader: R) -> ChunkIter<R> {
        ChunkIter {
            reader: Some(reader),
            buffer: Vec::with_capacity(self.chunk_size.min(READ_BUFFER_SIZE)),
            chunk_size: self.chunk_size,
            next_index: 0,
            byte_offset: 0,
            next_line: 1,
            in_block: false,
            done: false,
        }
    }

    /// Estimated chunk count for a source of `total_size` bytes
    pub fn estimate_chunks_count(total_size: u64, chunk_size: usize) -> usize {
        if total_size == 0 {
            return 0;
        }
        total_size.div_ceil(chunk_size.max(1) as u64) as usize
    }

    /// Splices a block whose text is split across two adjacent chunks
    /// back into one contiguous string.
    ///
    /// Returns `None` when the metadata does not describe a block
    /// spanning the pair.
    pub fn merge_incomplete_blocks(
        prev: &str,
        curr: &str,
        prev_meta: &ChunkMetadata,
        curr_meta: &ChunkMetadata,
    ) -> Option<String> {
        let start = prev_meta.incomplete_block_start?;
        if start > prev.len() {
            return None;
        }
        let end = curr_meta.incomplete_block_end.unwrap_or(curr.len());
        let end = end.min(curr.len());

        let mut merged = String::with_capacity(prev.len() - start + end);
        merged.push_str(&prev[start..]);
        merged.push_str(&curr[..end]);
        Some(merged)
    }
}

/// Lazy chunk sequence over a reader
pub struct ChunkIter<R: Read> {
    reader: Option<R>,
    buffer: Vec<u8>,
    chunk_size: usize,
    next_index: usize,
    byte_offset: usize,
    next_line: usize,
    /// Whether the next chunk starts inside a block
    in_block: bool,
    done: bool,
}

impl<R: Read> ChunkIter<R> {
    /// Retargets the chunk size for subsequent chunks.
    ///
    /// Used by the orchestrator to resize chunks adaptively under
    /// memory and throughput feedback; takes effect on the next call
    /// to `next`.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    /// Index the next emitted chunk will carry
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Fills the internal buffer up to the target chunk size.
    /// Returns true when the reader reached EOF.
    fn fill_buffer(&mut self) -> std::io::Result<bool> {
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Ok(true),
        };

        let target = self.chunk_size + UTF8_LOOKAHEAD;
        let mut scratch = [0u8; READ_BUFFER_SIZE];
        while self.buffer.len() < target {
            let want = (target - self.buffer.len()).min(scratch.len());
            let n = reader.read(&mut scratch[..want])?;
            if n == 0 {
                self.reader = None;
                return Ok(true);
            }
            self.buffer.extend_from_slice(&scratch[..n]);
        }
        Ok(false)
    }

    /// Chooses a split point in `(0, limit]` by boundary priority.
    fn choose_split(&self, limit: usize) -> usize {
        if let Some(pos) = self.last_block_end(limit) {
            return pos;
        }
        if let Some(pos) = last_blank_line(&self.buffer[..limit]) {
            return pos;
        }
        if let Some(pos) = last_line_end(&self.buffer[..limit]) {
            return pos;
        }
        // Hard cut, backed off to a UTF-8 character boundary
        let mut pos = limit;
        while pos > 0 && !is_char_boundary(&self.buffer, pos) {
            pos -= 1;
        }
        if pos == 0 {
            // The whole window sits inside one multi-byte sequence;
            // extend the cut forward into the buffered lookahead bytes
            // to the next character boundary instead.
            pos = limit;
            while pos < self.buffer.len() && !is_char_boundary(&self.buffer, pos) {
                pos += 1;
            }
        }
        pos
    }

    /// Byte offset just past the closing marker of the last block that
    /// closes within the first `limit` bytes of the buffer.
    fn last_block_end(&self, limit: usize) -> Option<usize> {
        let window = &self.buffer[..limit];
        let mut in_block = self.in_block;
        let mut last_end = None;
        let mut pos = 0;

        for line in split_lines(window) {
            let end = pos + line.len();
            // Marker detection is byte-oriented here; markers are ASCII
            // so lossy decoding of a single line is safe.
            let text = String::from_utf8_lossy(line);
            if in_block {
                if is_close_marker(&text) {
                    in_block = false;
                    last_end = Some(end);
                }
            } else if is_open_marker(&text) {
                in_block = true;
            }
            pos = end;
        }

        // A split inside the window is only useful if it is a real
        // boundary, not the window end of a still-open block.
        last_end.filter(|&p| p > 0)
    }

    /// Scans an emitted chunk and derives its block metadata, updating
    /// the carried in-block state.
    fn scan_chunk(&mut self, content: &str) -> ChunkMetadata {
        let started_in_block = self.in_block;
        let mut in_block = started_in_block;
        let mut open_offset: Option<usize> = if started_in_block { Some(0) } else { None };
        let mut has_complete_blocks = false;
        let mut incomplete_block_end = None;
        let mut pos = 0;
        let mut newline_count = 0;

        for line in content.split_inclusive('\n') {
            if line.ends_with('\n') {
                newline_count += 1;
            }
            if in_block {
                if is_close_marker(line) {
                    in_block = false;
                    if open_offset == Some(0) && started_in_block {
                        incomplete_block_end = Some(pos + line.len());
                    } else {
                        has_complete_blocks = true;
                    }
                    open_offset = None;
                }
            } else if is_open_marker(line) {
                in_block = true;
                open_offset = Some(pos);
            }
            pos += line.len();
        }

        let start_line = self.next_line;
        let end_line = if content.ends_with('\n') {
            start_line + newline_count.max(1) - 1
        } else {
            start_line + newline_count
        };

        let metadata = ChunkMetadata {
            index: self.next_index,
            start_offset: self.byte_offset,
            end_offset: self.byte_offset + content.len(),
            size: content.len(),
            has_complete_blocks,
            incomplete_block_start: if in_block { open_offset } else { None },
            incomplete_block_end,
            line_range: (start_line, end_line),
        };

        self.in_block = in_block;
        self.next_line = start_line + newline_count;
        self.byte_offset += content.len();
        self.next_index += 1;

        metadata
    }
}

impl<R: Read> Iterator for ChunkIter<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let at_eof = match self.fill_buffer() {
            Ok(eof) => eof,
            Err(e) => {
                self.done = true;
                self.buffer.clear();
                return Some(Err(ParserError::from(e)));
            }
        };

        if self.buffer.is_empty() {
            self.done = true;
            return None;
        }

        let split = if at_eof && self.buffer.len() <= self.chunk_size {
            // Final chunk takes everything that is left
            self.buffer.len()
        } else {
            self.choose_split(self.chunk_size.min(self.buffer.len()))
        };

        let tail = self.buffer.split_off(split);
        let head = std::mem::replace(&mut self.buffer, tail);
        let content = match String::from_utf8(head) {
            Ok(s) => s,
            Err(e) => {
                self.done = true;
                self.buffer.clear();
                return Some(Err(ParserError::Utf8 {
                    position: self.byte_offset + e.utf8_error().valid_up_to(),
                }));
            }
        };

        let metadata = self.scan_chunk(&content);
        Some(Ok(Chunk { content, metadata }))
    }
}

/// Splits a byte window into lines, keeping the trailing newline
fn split_lines(window: &[u8]) -> impl Iterator<Item = &[u8]> {
    window.split_inclusive(|&b| b == b'\n')
}

/// Position just past the last blank-line boundary in `window`
fn last_blank_line(window: &[u8]) -> Option<usize> {
    window
        .windows(2)
        .rposition(|pair| pair == b"\n\n")
        .map(|pos| pos + 2)
        .filter(|&pos| pos < window.len())
}

/// Position just past the last newline in `window`
fn last_line_end(window: &[u8]) -> Option<usize> {
    window
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|pos| pos + 1)
        .filter(|&pos| pos > 0 && pos < window.len())
}

/// Checks if a position is at a UTF-8 character boundary
fn is_char_boundary(bytes: &[u8], pos: usize) -> bool {
    if pos == 0 || pos >= bytes.len() {
        return true;
    }

    // UTF-8 continuation bytes start with 0b10xxxxxx
    (bytes[pos] & 0b1100_0000) != 0b1000_0000
}

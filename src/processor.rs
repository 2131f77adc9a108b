//! Chunk processing with block-boundary carry-over
//!
//! A `ChunkProcessor` turns one chunk of raw markup into rendered
//! output plus carry-over state for any block left open at the chunk
//! end. The built-in `MarkupProcessor` detects `;;;` block boundaries
//! and hands well-formed block text to a pluggable renderer; it never
//! interprets the markup grammar beyond the block delimiters.

use crate::chunking::{is_close_marker, is_open_marker, BLOCK_MARKER};

/// Maps a detected block to an output fragment.
///
/// The renderer owns all semantic rules; the processor only guarantees
/// that `inner` is the complete text between the block's markers.
pub trait BlockRenderer: Send + Sync {
    /// Renders one block into an output fragment
    fn render_block(&self, marker_type: &str, attributes: &str, inner: &str) -> String;
}

/// Default renderer producing a bracketed, line-oriented form
#[derive(Debug, Default, Clone)]
pub struct PlainRenderer;

impl BlockRenderer for PlainRenderer {
    fn render_block(&self, marker_type: &str, attributes: &str, inner: &str) -> String {
        let inner = inner.trim_end_matches('\n');
        if attributes.is_empty() {
            format!("[{marker_type}]\n{inner}\n")
        } else {
            format!("[{marker_type} {attributes}]\n{inner}\n")
        }
    }
}

/// Per-parse block state carried between chunk-processing calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    /// Not inside any block
    OutsideBlock,
    /// Inside a block whose closing marker has not been seen yet
    InBlock {
        /// Block type from the opening marker line
        marker_type: String,
        /// Remainder of the opening marker line after the type
        attributes: String,
        /// Content accumulated so far, possibly across chunks
        buffer: String,
        /// Chunk index where the block was opened
        opened_at_chunk: usize,
    },
}

/// Carry-over context owned by the sequential parse loop (or by one
/// partition per worker in parallel mode)
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    /// Current block state
    pub state: BlockState,
    /// Trailing partial line held back from the previous chunk, so
    /// marker detection always sees whole lines no matter where a
    /// chunk was cut
    pub pending_line: String,
    /// Outside-block prose accumulated toward the next paragraph
    pub pending_paragraph: String,
    /// Number of blocks emitted so far
    pub blocks_emitted: usize,
}

impl Default for ProcessingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingContext {
    /// Creates a fresh context with no carried state
    pub fn new() -> Self {
        Self {
            state: BlockState::OutsideBlock,
            pending_line: String::new(),
            pending_paragraph: String::new(),
            blocks_emitted: 0,
        }
    }

    /// Buffered text of the block currently left open, if any
    pub fn incomplete_block_text(&self) -> Option<&str> {
        match &self.state {
            BlockState::InBlock { buffer, .. } => Some(buffer),
            BlockState::OutsideBlock => None,
        }
    }
}

/// Output of processing a single chunk
#[derive(Debug, Clone, Default)]
pub struct ChunkOutput {
    /// Rendered output produced from this chunk
    pub content: String,
    /// Buffered text of a block left open at the chunk end
    pub incomplete_block: Option<String>,
    /// Fatal-per-block problems, recorded but never halting the stream
    pub errors: Vec<String>,
    /// Non-fatal per-chunk issues
    pub warnings: Vec<String>,
}

/// Final merged output of all chunks
#[derive(Debug, Clone, Default)]
pub struct MergedOutput {
    /// Assembled output content
    pub content: String,
    /// Errors aggregated in chunk order
    pub errors: Vec<String>,
    /// Warnings aggregated in chunk order
    pub warnings: Vec<String>,
}

/// Turns chunks into partial output plus carry-over state
pub trait ChunkProcessor: Send + Sync {
    /// Processes one chunk. `ctx` carries block state between calls
    /// and must be fed chunks in index order.
    fn process_chunk(
        &self,
        content: &str,
        index: usize,
        is_first: bool,
        is_last: bool,
        ctx: &mut ProcessingContext,
    ) -> ChunkOutput;

    /// Merges per-chunk outputs into the final content, flushing any
    /// state still carried in `ctx`.
    fn merge_results(&self, outputs: Vec<ChunkOutput>, ctx: &mut ProcessingContext)
        -> MergedOutput;

    /// Re-splits two adjacent chunks at `pos` bytes into `curr`, used
    /// when a later pass finds a block's close earlier than assumed.
    fn handle_block_boundary(&self, prev: &str, curr: &str, pos: usize) -> (String, String) {
        let mut pos = pos.min(curr.len());
        while pos > 0 && !curr.is_char_boundary(pos) {
            pos -= 1;
        }
        let mut new_prev = String::with_capacity(prev.len() + pos);
        new_prev.push_str(prev);
        new_prev.push_str(&curr[..pos]);
        (new_prev, curr[pos..].to_string())
    }
}

/// Block-delimited markup processor
pub struct MarkupProcessor<R: BlockRenderer> {
    renderer: R,
}

impl Default for MarkupProcessor<PlainRenderer> {
    fn default() -> Self {
        Self::new(PlainRenderer)
    }
}

impl<R: BlockRenderer> MarkupProcessor<R> {
    /// Creates a processor that renders blocks through `renderer`
    pub fn new(renderer: R) -> Self {
        Self { renderer }
    }

    /// Parses the header of an opening marker line into type and
    /// attribute text.
    fn parse_open_marker(line: &str) -> (String, String) {
        let header = line.trim_end();
        // Strip exactly one marker; anything after it, including more
        // semicolons, belongs to the type header.
        let header = header.strip_prefix(BLOCK_MARKER).unwrap_or(header).trim();
        match header.split_once(char::is_whitespace) {
            Some((marker_type, attrs)) => (marker_type.to_string(), attrs.trim().to_string()),
            None => (header.to_string(), String::new()),
        }
    }

    /// Flushes accumulated outside-block prose as one paragraph block
    fn flush_paragraph(&self, ctx: &mut ProcessingContext, out: &mut String) {
        let text = std::mem::take(&mut ctx.pending_paragraph);
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            out.push_str(&self.renderer.render_block("paragraph", "", trimmed));
            ctx.blocks_emitted += 1;
        }
    }

    /// Closes the current block and renders it
    fn close_block(&self, ctx: &mut ProcessingContext, out: &mut String) {
        if let BlockState::InBlock {
            marker_type,
            attributes,
            buffer,
            ..
        } = std::mem::replace(&mut ctx.state, BlockState::OutsideBlock)
        {
            out.push_str(&self.renderer.render_block(&marker_type, &attributes, &buffer));
            ctx.blocks_emitted += 1;
        }
    }

    /// Force-closes a block left open at end of input.
    ///
    /// Unbalanced markers are reported as a warning and the buffered
    /// content is still emitted; see the crate docs for why this is
    /// the default rather than a hard error.
    fn force_close(&self, ctx: &mut ProcessingContext, out: &mut String, warnings: &mut Vec<String>) {
        if let BlockState::InBlock {
            marker_type,
            opened_at_chunk,
            ..
        } = &ctx.state
        {
            warnings.push(format!(
                "block '{marker_type}' opened in chunk {opened_at_chunk} was never closed; \
                 force-closed at end of input"
            ));
            self.close_block(ctx, out);
        }
    }

    /// Applies one whole line to the block state machine
    fn process_line(
        &self,
        line: &str,
        index: usize,
        ctx: &mut ProcessingContext,
        out: &mut ChunkOutput,
    ) {
        let in_block = matches!(ctx.state, BlockState::InBlock { .. });

        if in_block {
            if is_close_marker(line) {
                self.close_block(ctx, &mut out.content);
            } else if let BlockState::InBlock { buffer, .. } = &mut ctx.state {
                buffer.push_str(line);
            }
        } else if is_open_marker(line) {
            self.flush_paragraph(ctx, &mut out.content);
            let (marker_type, attributes) = Self::parse_open_marker(line);
            ctx.state = BlockState::InBlock {
                marker_type,
                attributes,
                buffer: String::new(),
                opened_at_chunk: index,
            };
        } else if is_close_marker(line) {
            // Orphan close: downgrade and keep the marker as literal
            // text rather than halting the stream.
            out.errors.push(format!(
                "closing marker without a matching open in chunk {index}; \
                 treated as literal text"
            ));
            ctx.pending_paragraph.push_str(line);
        } else if line.trim().is_empty() {
            self.flush_paragraph(ctx, &mut out.content);
        } else {
            ctx.pending_paragraph.push_str(line);
        }
    }
}

impl<R: BlockRenderer> ChunkProcessor for MarkupProcessor<R> {
    fn process_chunk(
        &self,
        content: &str,
        index: usize,
        _is_first: bool,
        is_last: bool,
        ctx: &mut ProcessingContext,
    ) -> ChunkOutput {
        let mut out = ChunkOutput::default();

        let mut text = std::mem::take(&mut ctx.pending_line);
        text.push_str(content);

        // Chunks may be cut mid-line; hold the trailing fragment back
        // until the rest of its line arrives.
        if !is_last && !text.ends_with('\n') {
            ctx.pending_line = match text.rfind('\n') {
                Some(pos) => text.split_off(pos + 1),
                None => std::mem::take(&mut text),
            };
        }

        for line in text.split_inclusive('\n') {
            self.process_line(line, index, ctx, &mut out);
        }

        if is_last {
            self.force_close(ctx, &mut out.content, &mut out.warnings);
            self.flush_paragraph(ctx, &mut out.content);
        }

        out.incomplete_block = ctx
            .incomplete_block_text()
            .map(|buffer| format!("{buffer}{}", ctx.pending_line));
        out
    }

    fn merge_results(
        &self,
        outputs: Vec<ChunkOutput>,
        ctx: &mut ProcessingContext,
    ) -> MergedOutput {
        let mut merged = MergedOutput::default();
        let tail_index = outputs.len().saturating_sub(1);

        for output in outputs {
            merged.content.push_str(&output.content);
            merged.errors.extend(output.errors);
            merged.warnings.extend(output.warnings);
        }

        // Flush anything still carried, for callers that never marked
        // a chunk as last (e.g. a stream that ended unexpectedly).
        let tail = std::mem::take(&mut ctx.pending_line);
        if !tail.is_empty() {
            let mut extra = ChunkOutput::default();
            self.process_line(&tail, tail_index, ctx, &mut extra);
            merged.content.push_str(&extra.content);
            merged.errors.extend(extra.errors);
        }
        self.force_close(ctx, &mut merged.content, &mut merged.warnings);
        self.flush_paragraph(ctx, &mut merged.content);

        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_all(chunks: &[&str]) -> (MergedOutput, ProcessingContext) {
        let processor = MarkupProcessor::default();
        let mut ctx = ProcessingContext::new();
        let last = chunks.len().saturating_sub(1);

        let outputs: Vec<_> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| processor.process_chunk(chunk, i, i == 0, i == last, &mut ctx))
            .collect();

        let merged = processor.merge_results(outputs, &mut ctx);
        (merged, ctx)
    }

    #[test]
    fn test_single_block() {
        let (merged, ctx) = process_all(&[";;;heading1\nTitle\n;;;\n"]);
        assert_eq!(merged.content, "[heading1]\nTitle\n");
        assert_eq!(ctx.blocks_emitted, 1);
        assert!(merged.errors.is_empty());
        assert!(merged.warnings.is_empty());
    }

    #[test]
    fn test_block_and_paragraph() {
        let (merged, _) = process_all(&[";;;heading1\nTitle\n;;;\n\nBody text\n"]);
        assert_eq!(merged.content, "[heading1]\nTitle\n[paragraph]\nBody text\n");
    }

    #[test]
    fn test_block_split_across_chunks() {
        let (merged, _) = process_all(&[";;;quote author=someone\nfirst ", "half\n;;;\n"]);
        assert_eq!(
            merged.content,
            "[quote author=someone]\nfirst half\n"
        );
    }

    #[test]
    fn test_marker_line_cut_mid_chunk() {
        // A hard cut inside the opening marker line must not change
        // what gets parsed.
        let (split, _) = process_all(&[";;;head", "ing1\nTitle\n;;", ";\n"]);
        let (whole, _) = process_all(&[";;;heading1\nTitle\n;;;\n"]);
        assert_eq!(split.content, whole.content);
        assert_eq!(split.content, "[heading1]\nTitle\n");
    }

    #[test]
    fn test_single_byte_chunks() {
        let doc = ";;;note\nhi\n;;;\n\nprose\n";
        let chunks: Vec<String> = doc.chars().map(String::from).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();

        let (split, _) = process_all(&refs);
        let (whole, _) = process_all(&[doc]);
        assert_eq!(split.content, whole.content);
    }

    #[test]
    fn test_carry_over_reported() {
        let processor = MarkupProcessor::default();
        let mut ctx = ProcessingContext::new();

        let out = processor.process_chunk(";;;note\npartial", 0, true, false, &mut ctx);
        assert_eq!(out.incomplete_block.as_deref(), Some("partial"));
        assert!(matches!(ctx.state, BlockState::InBlock { .. }));
    }

    #[test]
    fn test_unterminated_block_force_closed() {
        let (merged, ctx) = process_all(&[";;;note\nnever closed\n"]);
        assert_eq!(merged.content, "[note]\nnever closed\n");
        assert_eq!(merged.warnings.len(), 1);
        assert!(merged.warnings[0].contains("never closed"));
        assert_eq!(ctx.state, BlockState::OutsideBlock);
    }

    #[test]
    fn test_orphan_close_is_literal() {
        let (merged, _) = process_all(&["text before\n;;;\ntext after\n"]);
        assert_eq!(merged.errors.len(), 1);
        // The stray marker stays in the output as literal text
        assert!(merged.content.contains(";;;"));
        assert!(merged.content.contains("text before"));
        assert!(merged.content.contains("text after"));
    }

    #[test]
    fn test_open_marker_inside_block_is_content() {
        // Blocks do not nest: only a bare `;;;` line closes
        let (merged, _) = process_all(&[";;;outer\n;;;inner\nstill outer\n;;;\n"]);
        assert_eq!(merged.content, "[outer]\n;;;inner\nstill outer\n");
    }

    #[test]
    fn test_paragraphs_split_on_blank_lines() {
        let (merged, ctx) = process_all(&["one two\n\nthree four\n"]);
        assert_eq!(
            merged.content,
            "[paragraph]\none two\n[paragraph]\nthree four\n"
        );
        assert_eq!(ctx.blocks_emitted, 2);
    }

    #[test]
    fn test_paragraph_split_across_chunks_stays_whole() {
        let (split, _) = process_all(&["first half ", "second half\n"]);
        let (whole, _) = process_all(&["first half second half\n"]);
        assert_eq!(split.content, whole.content);
    }

    #[test]
    fn test_attribute_parsing() {
        let (marker_type, attrs) = MarkupProcessor::<PlainRenderer>::parse_open_marker(
            ";;;code lang=rust line_numbers=true\n",
        );
        assert_eq!(marker_type, "code");
        assert_eq!(attrs, "lang=rust line_numbers=true");

        let (marker_type, attrs) =
            MarkupProcessor::<PlainRenderer>::parse_open_marker(";;;heading1\n");
        assert_eq!(marker_type, "heading1");
        assert!(attrs.is_empty());

        // Only one marker is stripped; extra semicolons are part of
        // the type
        let (marker_type, _) = MarkupProcessor::<PlainRenderer>::parse_open_marker(";;;;;;x\n");
        assert_eq!(marker_type, ";;;x");
    }

    #[test]
    fn test_handle_block_boundary_resplit() {
        let processor = MarkupProcessor::default();
        let (prev, curr) = processor.handle_block_boundary("abc\n", "def\nghi\n", 4);
        assert_eq!(prev, "abc\ndef\n");
        assert_eq!(curr, "ghi\n");
    }

    #[test]
    fn test_handle_block_boundary_respects_char_boundary() {
        let processor = MarkupProcessor::default();
        let (prev, curr) = processor.handle_block_boundary("x", "世界", 4);
        assert_eq!(format!("{prev}{curr}"), "x世界");
        assert!(prev.is_char_boundary(prev.len()));
    }

    #[test]
    fn test_custom_renderer() {
        struct Upper;
        impl BlockRenderer for Upper {
            fn render_block(&self, marker_type: &str, _attrs: &str, inner: &str) -> String {
                format!("{}:{}", marker_type.to_uppercase(), inner.trim())
            }
        }

        let processor = MarkupProcessor::new(Upper);
        let mut ctx = ProcessingContext::new();
        let out = processor.process_chunk(";;;note\nhi\n;;;\n", 0, true, true, &mut ctx);
        assert_eq!(out.content, "NOTE:hi");
    }
}

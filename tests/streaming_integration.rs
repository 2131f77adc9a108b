//! End-to-end tests for the streaming parse pipeline

use markstream::{
    ChunkManager, ParseOptions, ParserError, ProgressState, ProgressTracker, StreamingParser,
    StreamingParserConfig,
};
use proptest::prelude::*;
use std::io::{Cursor, Write};
use std::sync::Arc;

fn test_parser() -> StreamingParser {
    let config = StreamingParserConfig {
        min_chunk_size: 4,
        default_chunk_size: 64,
        max_chunk_size: 4096,
        max_memory_usage: 64 * 1024,
        ..Default::default()
    };
    StreamingParser::new(config).unwrap()
}

fn parse_with_chunk_size(parser: &StreamingParser, doc: &str, chunk_size: usize) -> markstream::ParseResult {
    parser
        .parse_stream(
            Cursor::new(doc.as_bytes()),
            Some(doc.len() as u64),
            ParseOptions {
                chunk_size: Some(chunk_size),
                ..Default::default()
            },
        )
        .unwrap()
}

#[test]
fn end_to_end_chunk_size_independence() {
    let doc = ";;;heading1\nTitle\n;;;\n\nBody text\n";
    let parser = test_parser();

    let tiny = parse_with_chunk_size(&parser, doc, 10);
    let huge = parse_with_chunk_size(&parser, doc, 10_000);

    assert_eq!(tiny.content, huge.content);
    // One heading block and one paragraph
    assert_eq!(tiny.content, "[heading1]\nTitle\n[paragraph]\nBody text\n");
    assert!(tiny.errors.is_empty());
    assert!(tiny.warnings.is_empty());
}

#[test]
fn parse_file_round_trip_through_filesystem() {
    let doc = ";;;note author=me\nremember this\n;;;\n\nclosing words\n";
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(doc.as_bytes()).unwrap();

    let parser = test_parser();
    let result = parser.parse_file(file.path(), ParseOptions::default()).unwrap();

    assert_eq!(
        result.content,
        "[note author=me]\nremember this\n[paragraph]\nclosing words\n"
    );
    assert_eq!(result.metadata.get("cancelled").unwrap(), "false");
    assert!(result.metadata.contains_key("source"));
}

#[test]
fn missing_file_surfaces_not_found() {
    let parser = test_parser();
    let err = parser
        .parse_file("/no/such/markstream/input.mk", ParseOptions::default())
        .unwrap_err();
    assert!(matches!(err, ParserError::NotFound { .. }));
}

#[test]
fn config_violations_mention_fields_and_fail_construction() {
    let config = StreamingParserConfig {
        min_chunk_size: 1000,
        max_chunk_size: 500,
        ..Default::default()
    };

    let violations = config.validate();
    assert!(!violations.is_empty());
    assert!(violations.iter().any(|v| v.contains("min_chunk_size")));
    assert!(violations.iter().any(|v| v.contains("max_chunk_size")));

    assert!(matches!(
        StreamingParser::new(config),
        Err(ParserError::Configuration(_))
    ));
}

#[test]
fn cancellation_after_third_chunk_stops_early() {
    // Ten 8-byte lines, parsed with 8-byte chunks
    let doc = "0123456\n".repeat(10);
    let parser = test_parser();

    let tracker = Arc::new(ProgressTracker::new(None, None));
    let canceller = tracker.clone();
    tracker.add_callback(Box::new(move |info| {
        if info.state == ProgressState::Running && info.processed_bytes >= 3 * 8 {
            canceller.cancel(Some("deadline".into()));
        }
    }));

    let result = parser
        .parse_stream(
            Cursor::new(doc.as_bytes()),
            Some(doc.len() as u64),
            ParseOptions {
                chunk_size: Some(8),
                tracker: Some(tracker.clone()),
                ..Default::default()
            },
        )
        .unwrap();

    assert!(result.was_cancelled());
    assert!(result.chunks_processed <= 4, "got {}", result.chunks_processed);
    assert_eq!(tracker.state(), ProgressState::Cancelled);
    // Best-effort partial content from the completed chunks
    assert!(result.content.contains("0123456"));
}

#[test]
fn unterminated_block_is_force_closed_with_warning() {
    let doc = ";;;quote\nthe stream just ends";
    let parser = test_parser();
    let result = parse_with_chunk_size(&parser, doc, 7);

    assert_eq!(result.content, "[quote]\nthe stream just ends\n");
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("never closed"));
}

#[test]
fn malformed_close_is_literal_and_parse_continues() {
    let doc = "before\n;;;\nafter\n\n;;;real\nblock\n;;;\n";
    let parser = test_parser();
    let result = parse_with_chunk_size(&parser, doc, 2048);

    assert_eq!(result.errors.len(), 1);
    assert!(result.content.contains("[real]"));
    assert!(result.content.contains(";;;"));
}

#[test]
fn progress_reaches_total_bytes() {
    let doc = ";;;a\nx\n;;;\n".repeat(50);
    let parser = test_parser();

    let tracker = Arc::new(ProgressTracker::new(None, None));
    let result = parser
        .parse_stream(
            Cursor::new(doc.as_bytes()),
            Some(doc.len() as u64),
            ParseOptions {
                chunk_size: Some(16),
                tracker: Some(tracker.clone()),
                ..Default::default()
            },
        )
        .unwrap();

    assert!(!result.was_cancelled());
    let info = tracker.get_info();
    assert_eq!(info.state, ProgressState::Completed);
    assert_eq!(info.processed_bytes, doc.len() as u64);
    assert_eq!(info.progress_ratio(), Some(1.0));
}

#[test]
fn result_carries_run_metadata() {
    let doc = "filler line of text\n".repeat(200);
    let parser = test_parser();
    let result = parse_with_chunk_size(&parser, &doc, 64);

    assert!(result.processing_time.as_nanos() > 0);
    assert!(result.chunks_processed > 1);
    assert_eq!(result.metadata.get("chunk_size").unwrap(), "64");
    assert_eq!(result.metadata.get("worker_threads").unwrap(), "1");
}

/// Builds a well-formed document from generated blocks and prose
fn build_document(blocks: &[(String, String)], trailing: &str) -> (String, usize) {
    let mut doc = String::new();
    for (marker_type, body) in blocks {
        doc.push_str(";;;");
        doc.push_str(marker_type);
        doc.push('\n');
        doc.push_str(body);
        doc.push('\n');
        doc.push_str(";;;\n");
    }
    if !trailing.is_empty() {
        doc.push_str(trailing);
        doc.push('\n');
    }
    (doc, blocks.len())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Concatenating raw chunk contents reproduces the source exactly
    /// for every chunk size.
    #[test]
    fn prop_chunk_round_trip(
        blocks in prop::collection::vec(
            ("[a-z]{1,8}", "[ -~]{0,40}"),
            0..5,
        ),
        trailing in "[a-zA-Z ]{0,30}",
        chunk_size in 1usize..128,
    ) {
        let (doc, _) = build_document(&blocks, &trailing);
        let manager = ChunkManager::new(chunk_size);
        let chunks: Vec<_> = manager
            .create_chunks(Cursor::new(doc.as_bytes()))
            .collect::<markstream::Result<_>>()
            .unwrap();

        let rebuilt: String = chunks.iter().map(|c| c.content.as_str()).collect();
        prop_assert_eq!(rebuilt, doc);
    }

    /// Every block opened in a well-formed source is rendered exactly
    /// once, for every chunk size.
    #[test]
    fn prop_block_atomicity(
        blocks in prop::collection::vec(
            ("[a-z]{1,8}", "[a-z ]{1,40}"),
            1..5,
        ),
        chunk_size in 1usize..96,
    ) {
        let (doc, block_count) = build_document(&blocks, "");
        let parser = test_parser();
        let result = parse_with_chunk_size(&parser, &doc, chunk_size);

        prop_assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
        let rendered_blocks = result.content.matches('[').count();
        prop_assert_eq!(rendered_blocks, block_count);
    }

    /// Identical inputs and configs produce identical content,
    /// independent of chunk size.
    #[test]
    fn prop_output_is_chunk_size_invariant(
        blocks in prop::collection::vec(
            ("[a-z]{1,6}", "[a-z ]{1,30}"),
            1..4,
        ),
        trailing in "[a-z ]{0,20}",
        chunk_size in 1usize..80,
    ) {
        let (doc, _) = build_document(&blocks, trailing.trim());
        let parser = test_parser();

        let sized = parse_with_chunk_size(&parser, &doc, chunk_size);
        let whole = parse_with_chunk_size(&parser, &doc, doc.len().max(1) + 1);
        prop_assert_eq!(sized.content, whole.content);
    }
}

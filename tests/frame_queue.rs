//! FrameQueue framing and delimiter scanning.

use bytes::{Bytes, BytesMut};
use nbconn::{Error, FrameQueue, Index};

fn queue_of(chunks: &[&'static [u8]]) -> FrameQueue {
    let mut queue = FrameQueue::new();
    for chunk in chunks {
        queue.append(Bytes::from_static(chunk));
    }
    queue
}

fn concat(segments: Vec<Bytes>) -> Vec<u8> {
    segments.iter().flat_map(|s| s.iter().copied()).collect()
}

// ============================================================================
// Delimiter Framing
// ============================================================================

#[test]
fn delimiter_split_across_chunks() {
    let mut queue = queue_of(&[b"AB", b"C\r", b"\nDEF"]);

    assert_eq!(queue.index_of(b"\r\n", 100).unwrap(), Some(3));
    assert_eq!(queue.cached_index().unwrap().read_bytes(), 5);

    let content = queue.read_by_delimiter(b"\r\n", 100).unwrap().unwrap();
    assert_eq!(concat(content), b"ABC");
    assert_eq!(queue.len(), 3);
    assert_eq!(concat(queue.read_available()), b"DEF");
}

#[test]
fn delimiter_scan_resumes_after_append() {
    let mut queue = queue_of(&[b"hello\r"]);

    assert_eq!(queue.index_of(b"\r\n", 100).unwrap(), None);
    let index = queue.cached_index().unwrap();
    assert_eq!(index.scanned_segments(), 1);
    assert_eq!(index.partial_match(), 1);
    assert_eq!(index.read_bytes(), 6);

    queue.append(Bytes::from_static(b"\nworld"));
    assert_eq!(queue.index_of(b"\r\n", 100).unwrap(), Some(5));
    assert_eq!(queue.cached_index().unwrap().read_bytes(), 7);

    let line = queue.read_by_delimiter(b"\r\n", 100).unwrap().unwrap();
    assert_eq!(concat(line), b"hello");
    assert_eq!(concat(queue.read_available()), b"world");
}

#[test]
fn index_skips_segments_it_already_scanned() {
    let mut index = Index::new(b"\r\n");
    assert!(!index.scan([&b"hello\r"[..]]));

    // The first segment is not looked at again, so the delimiters planted
    // in it are never seen
    let found = index.scan([&b"\r\n\r\n\r\n"[..], &b"\nworld"[..]]);
    assert!(found);
    assert_eq!(index.content_len(), Some(5));
    assert_eq!(index.read_bytes(), 7);
}

#[test]
fn delimiter_change_restarts_scan() {
    let mut queue = queue_of(&[b"ab\r"]);
    assert_eq!(queue.index_of(b"\r\n", 100).unwrap(), None);

    assert_eq!(queue.index_of(b"b", 100).unwrap(), Some(1));
    assert_eq!(queue.cached_index().unwrap().delimiter(), b"b");
}

#[test]
fn extraction_discards_cached_index() {
    let mut queue = queue_of(&[b"abc", b"de"]);
    assert_eq!(queue.index_of(b"\n", 100).unwrap(), None);
    assert!(queue.cached_index().is_some());

    queue.read_by_length(1).unwrap();
    assert!(queue.cached_index().is_none());
}

#[test]
fn oversized_frame_is_reported() {
    let mut queue = queue_of(&[b"abcdefghij"]);
    match queue.index_of(b"\r\n", 5) {
        Err(Error::MaxReadSizeExceeded { max }) => assert_eq!(max, 5),
        other => panic!("expected MaxReadSizeExceeded, got {other:?}"),
    }
    // Nothing was consumed
    assert_eq!(queue.len(), 10);

    // Found, but beyond the budget
    let mut queue = queue_of(&[b"abcdef\r\n"]);
    assert!(matches!(
        queue.read_by_delimiter(b"\r\n", 4),
        Err(Error::MaxReadSizeExceeded { .. })
    ));
    assert_eq!(queue.index_of(b"\r\n", 8).unwrap(), Some(6));

    // Under budget and not found yet is a plain underflow
    let mut queue = queue_of(&[b"abc"]);
    assert_eq!(queue.index_of(b"\r\n", 20).unwrap(), None);
}

#[test]
fn empty_delimiter_is_rejected() {
    let mut queue = queue_of(&[b"abc"]);
    assert!(matches!(queue.index_of(b"", 10), Err(Error::EmptyDelimiter)));
}

#[test]
fn repeated_prefix_delimiter_under_matches() {
    // The matcher restarts from the current byte only, so "AAB" inside
    // "AAAB" goes unnoticed
    let mut queue = queue_of(&[b"AAAB"]);
    assert_eq!(queue.index_of(b"AAB", 100).unwrap(), None);

    let mut queue = queue_of(&[b"xAA", b"By"]);
    assert_eq!(queue.index_of(b"AAB", 100).unwrap(), Some(1));
}

// ============================================================================
// Length Framing
// ============================================================================

#[test]
fn read_by_length_survives_any_fragmentation() {
    let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();

    for chunk_size in [1, 3, 64, 999, 1000] {
        let mut queue = FrameQueue::new();
        for chunk in data.chunks(chunk_size) {
            queue.append(Bytes::copy_from_slice(chunk));
        }
        assert_eq!(queue.read_by_length(1001), None);

        let frame = queue.read_by_length(data.len()).unwrap();
        assert_eq!(concat(frame), data, "chunk size {chunk_size}");
        assert!(queue.is_empty());
    }

    // Uneven chunks
    let mut queue = FrameQueue::new();
    let mut offset = 0;
    let mut step = 1;
    while offset < data.len() {
        let end = (offset + step).min(data.len());
        queue.append(Bytes::copy_from_slice(&data[offset..end]));
        offset = end;
        step = step * 3 % 17 + 1;
    }
    assert_eq!(concat(queue.read_by_length(data.len()).unwrap()), data);
}

#[test]
fn partial_extraction_requeues_remainder() {
    let mut queue = queue_of(&[b"0123456789"]);

    let head = queue.read_by_length(4).unwrap();
    assert_eq!(concat(head), b"0123");
    assert_eq!(queue.len(), 6);
    assert_eq!(queue.segment_count(), 1);
    assert_eq!(concat(queue.drain()), b"456789");
}

#[test]
fn read_bytes_is_zero_copy_within_one_segment() {
    let segment = Bytes::from_static(b"hello world");
    let mut queue = FrameQueue::new();
    queue.append(segment.clone());

    let hello = queue.read_bytes(5).unwrap();
    assert_eq!(&hello[..], b"hello");
    assert_eq!(hello.as_ptr(), segment.as_ptr());

    queue.append(Bytes::from_static(b"!!"));
    let rest = queue.read_bytes(8).unwrap();
    assert_eq!(&rest[..], b" world!!");
    assert_eq!(queue.read_bytes(1), None);
}

// ============================================================================
// Queue Structure
// ============================================================================

#[test]
fn drain_of_empty_queue_keeps_version() {
    let mut queue = FrameQueue::new();
    let version = queue.version();

    assert!(queue.drain().is_empty());
    assert_eq!(queue.version(), version);

    queue.append(Bytes::from_static(b"x"));
    let version = queue.version();
    assert_eq!(queue.drain().len(), 1);
    assert_ne!(queue.version(), version);
}

#[test]
fn empty_segments_are_not_stored() {
    let mut queue = FrameQueue::new();
    let version = queue.version();
    queue.append(Bytes::new());
    queue.add_first(vec![Bytes::new()]);

    assert_eq!(queue.segment_count(), 0);
    assert_eq!(queue.version(), version);
}

#[test]
fn add_first_keeps_order() {
    let mut queue = queue_of(&[b"cd"]);
    queue.add_first(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

    assert_eq!(queue.len(), 4);
    assert_eq!(concat(queue.read_available()), b"abcd");
}

#[test]
fn remove_first_takes_head_segment() {
    let mut queue = queue_of(&[b"ab", b"cd"]);
    assert_eq!(queue.remove_first().unwrap(), Bytes::from_static(b"ab"));
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.remove_first().unwrap(), Bytes::from_static(b"cd"));
    assert_eq!(queue.remove_first(), None);
}

// ============================================================================
// Read Mark
// ============================================================================

#[test]
fn reset_to_mark_restores_extracted_bytes() {
    let mut queue = queue_of(&[b"abc", b"def"]);
    let version = queue.version();

    queue.mark_read_position();
    assert_eq!(&queue.read_bytes(2).unwrap()[..], b"ab");
    assert_eq!(&queue.read_bytes(2).unwrap()[..], b"cd");

    assert!(queue.reset_to_read_mark());
    assert_eq!(queue.len(), 6);
    assert_eq!(queue.version(), version);
    assert!(queue.is_marked());

    queue.remove_read_mark();
    assert!(!queue.reset_to_read_mark());
    assert_eq!(concat(queue.read_available()), b"abcdef");
}

#[test]
fn reset_after_append_keeps_new_data_behind() {
    let mut queue = queue_of(&[b"len:"]);
    let version = queue.version();

    queue.mark_read_position();
    queue.read_bytes(4).unwrap();
    queue.append(Bytes::from_static(b"42"));

    assert!(queue.reset_to_read_mark());
    assert_ne!(queue.version(), version);
    assert_eq!(concat(queue.read_available()), b"len:42");
}

// ============================================================================
// Byte Sinks
// ============================================================================

#[test]
fn extract_into_sinks() {
    let mut queue = queue_of(&[b"ab", b"cdef"]);

    let mut flat = BytesMut::new();
    assert!(queue.extract_into(3, &mut flat));
    assert_eq!(&flat[..], b"abc");

    let mut segments: Vec<Bytes> = Vec::new();
    assert!(!queue.extract_into(10, &mut segments));
    assert!(segments.is_empty());
    assert_eq!(queue.len(), 3);

    let mut other = FrameQueue::new();
    assert!(queue.extract_into(3, &mut other));
    assert!(queue.is_empty());
    assert_eq!(concat(other.read_available()), b"def");
}

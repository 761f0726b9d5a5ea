//! Ordered byte-segment queues with zero-copy framing.
//!
//! A [`FrameQueue`] holds the unread (or unsent) bytes of a connection as a
//! sequence of [`Bytes`] segments in arrival order. Framing reads split
//! segments without copying; the unconsumed remainder of a split segment
//! stays at the head of the queue.

mod index;

pub use index::Index;

use crate::error::Error;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;

// ============================================================================
// Byte Sinks
// ============================================================================

/// Destination for bytes extracted from a [`FrameQueue`].
pub trait ByteSink {
    fn put(&mut self, segment: Bytes);
}

impl ByteSink for Vec<Bytes> {
    fn put(&mut self, segment: Bytes) {
        self.push(segment);
    }
}

impl ByteSink for BytesMut {
    fn put(&mut self, segment: Bytes) {
        self.extend_from_slice(&segment);
    }
}

impl ByteSink for FrameQueue {
    fn put(&mut self, segment: Bytes) {
        self.append(segment);
    }
}

// ============================================================================
// Frame Queue
// ============================================================================

#[derive(Debug)]
struct ReadMark {
    extracted: Vec<Bytes>,
    version: u64,
    append_version: u64,
}

/// Ordered queue of byte segments.
///
/// Invariants: the concatenation of all segments is the pending byte
/// stream, empty segments are never stored, and [`version()`](Self::version)
/// changes on every structural mutation.
#[derive(Default)]
pub struct FrameQueue {
    segments: VecDeque<Bytes>,
    size: usize,
    version: u64,
    append_version: u64,
    index: Option<Index>,
    mark: Option<ReadMark>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of queued bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of queued segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Structural version. Unchanged version means no bytes were added or
    /// taken since it was last read.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The cached delimiter scanner, if a scan is in progress.
    pub fn cached_index(&self) -> Option<&Index> {
        self.index.as_ref()
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Appends a segment at the tail. Empty segments are ignored.
    ///
    /// Appending keeps the cached delimiter scan, so the next delimiter read
    /// resumes where the previous one stopped.
    pub fn append(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.size += segment.len();
        self.segments.push_back(segment);
        self.version += 1;
        self.append_version += 1;
    }

    /// Appends several segments in order.
    pub fn append_all<I>(&mut self, segments: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        for segment in segments {
            self.append(segment);
        }
    }

    /// Pushes segments back to the head, keeping their order. Used to return
    /// unconsumed remainders.
    pub fn add_first<I>(&mut self, segments: I)
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: DoubleEndedIterator,
    {
        let mut changed = false;
        for segment in segments.into_iter().rev() {
            if segment.is_empty() {
                continue;
            }
            self.size += segment.len();
            self.segments.push_front(segment);
            changed = true;
        }
        if changed {
            self.version += 1;
            self.index = None;
        }
    }

    /// Takes all segments and leaves the queue empty.
    ///
    /// Draining an empty queue returns nothing and leaves the version as is.
    pub fn drain(&mut self) -> Vec<Bytes> {
        if self.segments.is_empty() {
            return Vec::new();
        }
        let drained: Vec<Bytes> = self.segments.drain(..).collect();
        self.size = 0;
        self.changed_by_extraction(&drained);
        drained
    }

    /// Removes the head segment.
    pub fn remove_first(&mut self) -> Option<Bytes> {
        let segment = self.segments.pop_front()?;
        self.size -= segment.len();
        self.changed_by_extraction(std::slice::from_ref(&segment));
        Some(segment)
    }

    // ------------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------------

    /// Moves exactly `len` bytes into `sink`.
    ///
    /// Returns `false` and leaves the queue untouched if fewer than `len`
    /// bytes are queued.
    pub fn extract_into<S>(&mut self, len: usize, sink: &mut S) -> bool
    where
        S: ByteSink + ?Sized,
    {
        if len > self.size {
            return false;
        }
        for segment in self.split_front(len) {
            sink.put(segment);
        }
        true
    }

    /// Extracts exactly `len` bytes as segments, or `None` if fewer are queued.
    pub fn read_by_length(&mut self, len: usize) -> Option<Vec<Bytes>> {
        if len > self.size {
            return None;
        }
        Some(self.split_front(len))
    }

    /// Extracts exactly `len` bytes as one contiguous buffer.
    ///
    /// Zero-copy when the bytes lie in the head segment; copies otherwise.
    pub fn read_bytes(&mut self, len: usize) -> Option<Bytes> {
        if len > self.size {
            return None;
        }
        let mut parts = self.split_front(len);
        if parts.len() <= 1 {
            return Some(parts.pop().unwrap_or_default());
        }
        let mut joined = BytesMut::with_capacity(len);
        for part in parts {
            joined.extend_from_slice(&part);
        }
        Some(joined.freeze())
    }

    /// Takes everything that is queued.
    pub fn read_available(&mut self) -> Vec<Bytes> {
        self.drain()
    }

    /// Length of the data in front of `delimiter`.
    ///
    /// Returns `Ok(None)` while the delimiter hasn't arrived yet. `max_len`
    /// bounds the bytes consumed including the delimiter: a match beyond it
    /// or a scan that reached it without a match fails with
    /// [`Error::MaxReadSizeExceeded`].
    pub fn index_of(&mut self, delimiter: &[u8], max_len: usize) -> Result<Option<usize>, Error> {
        if delimiter.is_empty() {
            return Err(Error::EmptyDelimiter);
        }

        let mut index = match self.index.take() {
            Some(index) if index.delimiter() == delimiter => index,
            _ => Index::new(delimiter),
        };
        index.scan(self.segments.iter().map(|segment| segment.as_ref()));

        let result = match index.content_len() {
            Some(content_len) if index.read_bytes() <= max_len => Ok(Some(content_len)),
            _ if index.read_bytes() >= max_len => Err(Error::MaxReadSizeExceeded { max: max_len }),
            _ => Ok(None),
        };
        self.index = Some(index);
        result
    }

    /// Extracts the data in front of `delimiter` and discards the delimiter.
    pub fn read_by_delimiter(
        &mut self,
        delimiter: &[u8],
        max_len: usize,
    ) -> Result<Option<Vec<Bytes>>, Error> {
        let Some(content_len) = self.index_of(delimiter, max_len)? else {
            return Ok(None);
        };
        let content = self.split_front(content_len);
        self.split_front(delimiter.len());
        Ok(Some(content))
    }

    // ------------------------------------------------------------------------
    // Read Mark
    // ------------------------------------------------------------------------

    /// Starts recording extracted bytes so they can be pushed back with
    /// [`reset_to_read_mark()`](Self::reset_to_read_mark).
    pub fn mark_read_position(&mut self) {
        self.mark = Some(ReadMark {
            extracted: Vec::new(),
            version: self.version,
            append_version: self.append_version,
        });
    }

    /// Restores everything extracted since the mark. The mark stays set.
    ///
    /// Returns `false` if no mark is set.
    pub fn reset_to_read_mark(&mut self) -> bool {
        let Some(mark) = self.mark.take() else {
            return false;
        };
        self.add_first(mark.extracted);
        if self.append_version == mark.append_version {
            self.version = mark.version;
        }
        self.mark_read_position();
        true
    }

    pub fn remove_read_mark(&mut self) {
        self.mark = None;
    }

    pub fn is_marked(&self) -> bool {
        self.mark.is_some()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    // Caller guarantees `len <= self.size`.
    fn split_front(&mut self, len: usize) -> Vec<Bytes> {
        let mut parts = Vec::new();
        let mut remaining = len;

        while remaining > 0 {
            let Some(mut segment) = self.segments.pop_front() else {
                break;
            };
            if segment.len() <= remaining {
                remaining -= segment.len();
                parts.push(segment);
            } else {
                let head = segment.split_to(remaining);
                remaining = 0;
                self.segments.push_front(segment);
                parts.push(head);
            }
        }

        self.size -= len - remaining;
        if !parts.is_empty() {
            self.changed_by_extraction(&parts);
        }
        parts
    }

    fn changed_by_extraction(&mut self, extracted: &[Bytes]) {
        self.version += 1;
        self.index = None;
        if let Some(mark) = self.mark.as_mut() {
            mark.extracted.extend(extracted.iter().cloned());
        }
    }
}

impl fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameQueue")
            .field("size", &self.size)
            .field("segments", &self.segments.len())
            .field("version", &self.version)
            .field("marked", &self.mark.is_some())
            .finish()
    }
}

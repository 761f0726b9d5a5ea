use bytes::Bytes;

/// Resumable delimiter scanner state.
///
/// An `Index` remembers how many segments it has fully scanned, how many
/// bytes it has consumed and how much of the delimiter is partially matched
/// at the end of the last scanned segment. Scanning the same queue again
/// after an append resumes with the first unscanned segment.
///
/// Matching is naive: on a mismatch the partial match restarts at zero and
/// only the current byte is re-checked against the first delimiter byte.
/// Delimiters with a repeated prefix (e.g. `AAB`) can therefore miss a match
/// that starts inside an earlier partial match (`AAAB`).
#[derive(Debug, Clone)]
pub struct Index {
    delimiter: Bytes,
    delimiter_pos: usize,
    scanned_segments: usize,
    read_bytes: usize,
    found: bool,
}

impl Index {
    /// Creates a fresh scanner for `delimiter`. The delimiter must not be empty.
    pub fn new(delimiter: &[u8]) -> Self {
        debug_assert!(!delimiter.is_empty());
        Self {
            delimiter: Bytes::copy_from_slice(delimiter),
            delimiter_pos: 0,
            scanned_segments: 0,
            read_bytes: 0,
            found: false,
        }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Whether the full delimiter has been seen.
    pub fn is_found(&self) -> bool {
        self.found
    }

    /// Bytes consumed by the scan, including the delimiter once found.
    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    /// Length of the data in front of the delimiter, if it was found.
    pub fn content_len(&self) -> Option<usize> {
        self.found
            .then(|| self.read_bytes - self.delimiter.len())
    }

    /// Number of segments scanned to the end without finding the delimiter.
    pub fn scanned_segments(&self) -> usize {
        self.scanned_segments
    }

    /// Length of the delimiter prefix matched at the end of the scanned data.
    pub fn partial_match(&self) -> usize {
        self.delimiter_pos
    }

    /// Scans `segments`, skipping the ones a previous call already covered.
    ///
    /// Returns `true` once the delimiter has been found. A found index does
    /// not scan any further.
    pub fn scan<'a, I>(&mut self, segments: I) -> bool
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        if self.found {
            return true;
        }

        for segment in segments.into_iter().skip(self.scanned_segments) {
            if self.scan_segment(segment) {
                self.found = true;
                return true;
            }
            self.scanned_segments += 1;
        }
        false
    }

    fn scan_segment(&mut self, segment: &[u8]) -> bool {
        let delimiter_len = self.delimiter.len();

        for (i, &byte) in segment.iter().enumerate() {
            if byte == self.delimiter[self.delimiter_pos] {
                self.delimiter_pos += 1;
                if self.delimiter_pos == delimiter_len {
                    self.read_bytes += i + 1;
                    return true;
                }
            } else if self.delimiter_pos > 0 {
                self.delimiter_pos = 0;
                if byte == self.delimiter[0] {
                    self.delimiter_pos = 1;
                }
            }
        }

        self.read_bytes += segment.len();
        false
    }
}

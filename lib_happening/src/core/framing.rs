//! # Record Framing
//!
//! Turns the arbitrary chunks returned by socket reads into complete,
//! delimiter-stripped records. One `RecordFramer` lives per connection and
//! owns that connection's carry-over buffer.
//!
//! ## Rules
//! - The working buffer is the carry-over followed by the new chunk.
//! - Every fragment that is followed by `\r\n` is a complete record, empty
//!   fragments included (they fail parsing downstream like any malformed record).
//! - Whatever follows the last delimiter is incomplete and carried into the
//!   next read. A chunk ending in `\r` therefore stays pending until the `\n`
//!   arrives, and a chunk ending exactly on `\r\n` leaves nothing behind, so no
//!   empty trailing record is produced.
//! - Trailing NUL bytes are read padding: they are stripped and the pending
//!   fragment in front of them is treated as a complete record.
//! - A carry-over longer than `max_record_bytes` is discarded so a source that
//!   never sends a delimiter cannot grow the buffer without bound. The rest of
//!   that record is skipped too: nothing is framed again until the next `\r\n`.

use bytes::{Buf, Bytes, BytesMut};

use super::event::MSG_DELIMITER;

/// Default bound on a single pending record.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

/// Result of feeding one chunk.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FrameBatch {
    /// Complete records, in arrival order, without the delimiter.
    pub records: Vec<Bytes>,
    /// Number of pending fragments discarded for exceeding the size bound.
    pub oversize: usize,
}

/// Per-connection reassembly state.
#[derive(Debug)]
pub struct RecordFramer {
    carry: BytesMut,
    max_record_bytes: usize,
    discarding: bool,
}

impl RecordFramer {
    /// Creates a framer that never carries more than `max_record_bytes`.
    pub fn new(max_record_bytes: usize) -> Self {
        Self {
            carry: BytesMut::new(),
            max_record_bytes,
            discarding: false,
        }
    }

    /// Feeds one freshly read chunk and returns the records it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> FrameBatch {
        let (chunk, padded) = strip_padding(chunk);

        let mut working = std::mem::take(&mut self.carry);
        working.extend_from_slice(chunk);

        let mut batch = FrameBatch::default();
        if self.discarding {
            match find_delimiter(&working) {
                Some(pos) => {
                    working.advance(pos + MSG_DELIMITER.len());
                    self.discarding = false;
                }
                None => {
                    // Padding ends the dropped record as it ends any other.
                    if padded {
                        self.discarding = false;
                    } else {
                        self.hold_delimiter_prefix(working);
                    }
                    return batch;
                }
            }
        }

        while let Some(pos) = find_delimiter(&working) {
            let record = working.split_to(pos).freeze();
            working.advance(MSG_DELIMITER.len());
            batch.records.push(record);
        }

        if working.is_empty() {
            return batch;
        }

        if padded {
            batch.records.push(working.freeze());
        } else if working.len() > self.max_record_bytes {
            batch.oversize += 1;
            self.discarding = true;
            self.hold_delimiter_prefix(working);
        } else {
            self.carry = working;
        }

        batch
    }

    /// Keeps only a trailing `\r`, the possible first half of the delimiter
    /// that ends a record being skipped.
    fn hold_delimiter_prefix(&mut self, mut working: BytesMut) {
        if working.last() == Some(&MSG_DELIMITER[0]) {
            self.carry = working.split_off(working.len() - 1);
        }
    }

    /// Bytes held for an incomplete record.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// `true` while the remainder of an oversize record is being skipped.
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Drops and returns the incomplete record, if any. The unseen rest of an
    /// oversize record is not one.
    pub fn take_pending(&mut self) -> Option<Bytes> {
        if std::mem::take(&mut self.discarding) {
            self.carry.clear();
            return None;
        }
        if self.carry.is_empty() {
            None
        } else {
            Some(self.carry.split().freeze())
        }
    }
}

impl Default for RecordFramer {
    fn default() -> Self {
        Self::new(MAX_RECORD_BYTES)
    }
}

fn strip_padding(chunk: &[u8]) -> (&[u8], bool) {
    let end = chunk
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    (&chunk[..end], end < chunk.len())
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(MSG_DELIMITER.len())
        .position(|window| window == MSG_DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(batch: &FrameBatch) -> Vec<&[u8]> {
        batch.records.iter().map(|r| r.as_ref()).collect()
    }

    #[test]
    fn single_complete_record_has_no_empty_tail() {
        let mut framer = RecordFramer::default();
        let batch = framer.feed(b"node1|1000|heartbeat\r\n");

        assert_eq!(records(&batch), vec![&b"node1|1000|heartbeat"[..]]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn reassembles_a_record_split_across_reads() {
        let mut framer = RecordFramer::default();

        let first = framer.feed(b"node1|1000|hear");
        assert!(first.records.is_empty());
        assert_eq!(framer.pending(), 15);

        let second = framer.feed(b"tbeat\r\n");
        assert_eq!(records(&second), vec![&b"node1|1000|heartbeat"[..]]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn reassembles_across_many_reads() {
        let mut framer = RecordFramer::default();
        let wire = b"a|1|x\r\nbb|2|yy\r\nccc|3|zzz\r\n";
        let mut all = Vec::new();
        for byte in wire.iter() {
            all.extend(framer.feed(std::slice::from_ref(byte)).records);
        }

        let got: Vec<&[u8]> = all.iter().map(|r| r.as_ref()).collect();
        assert_eq!(got, vec![&b"a|1|x"[..], b"bb|2|yy", b"ccc|3|zzz"]);
    }

    #[test]
    fn delimiter_split_between_reads_is_held_back() {
        let mut framer = RecordFramer::default();

        let first = framer.feed(b"node1|1000|heartbeat\r");
        assert!(first.records.is_empty());

        let second = framer.feed(b"\nnode2|1001|boot\r\n");
        assert_eq!(
            records(&second),
            vec![&b"node1|1000|heartbeat"[..], b"node2|1001|boot"]
        );
    }

    #[test]
    fn several_records_and_a_partial_tail() {
        let mut framer = RecordFramer::default();
        let batch = framer.feed(b"a|1|x\r\nb|2|y\r\nc|3");

        assert_eq!(records(&batch), vec![&b"a|1|x"[..], b"b|2|y"]);
        assert_eq!(framer.take_pending().as_deref(), Some(&b"c|3"[..]));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn empty_records_between_delimiters_are_reported() {
        let mut framer = RecordFramer::default();
        let batch = framer.feed(b"a|1|x\r\n\r\n");

        assert_eq!(records(&batch), vec![&b"a|1|x"[..], b""]);
    }

    #[test]
    fn nul_padding_completes_the_pending_fragment() {
        let mut framer = RecordFramer::default();
        let batch = framer.feed(b"a|1|x\r\nb|2|y\0\0\0\0");

        assert_eq!(records(&batch), vec![&b"a|1|x"[..], b"b|2|y"]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn padding_only_chunk_produces_nothing() {
        let mut framer = RecordFramer::default();
        assert_eq!(framer.feed(&[0, 0, 0]), FrameBatch::default());
    }

    #[test]
    fn oversize_fragment_is_dropped() {
        let mut framer = RecordFramer::new(8);
        let batch = framer.feed(b"0123456789");

        assert!(batch.records.is_empty());
        assert_eq!(batch.oversize, 1);
        assert_eq!(framer.pending(), 0);
        assert!(framer.is_discarding());

        let next = framer.feed(b"abc\r\na|1|x\r\n");
        assert_eq!(records(&next), vec![&b"a|1|x"[..]]);
        assert!(!framer.is_discarding());
    }

    #[test]
    fn tail_of_an_oversize_record_never_becomes_a_record() {
        let mut framer = RecordFramer::new(8);
        assert_eq!(framer.feed(b"0123456789").oversize, 1);

        // Parses on its own, but it is the end of `0123456789ab|1|x`.
        let tail = framer.feed(b"ab|1|x\r\n");
        assert!(tail.records.is_empty());

        let next = framer.feed(b"c|2|y\r\n");
        assert_eq!(records(&next), vec![&b"c|2|y"[..]]);
    }

    #[test]
    fn skipping_spans_several_reads() {
        let mut framer = RecordFramer::new(4);
        assert_eq!(framer.feed(b"0123456789").oversize, 1);
        assert!(framer.feed(b"more|1|x").records.is_empty());
        assert!(framer.feed(b"still|2|y").records.is_empty());

        let next = framer.feed(b"z\r\nd|4|w\r\n");
        assert_eq!(records(&next), vec![&b"d|4|w"[..]]);
    }

    #[test]
    fn skipped_record_ends_on_a_delimiter_split_across_reads() {
        let mut framer = RecordFramer::new(4);
        assert_eq!(framer.feed(b"0123456789\r").oversize, 1);
        assert_eq!(framer.pending(), 1);

        let next = framer.feed(b"\na|1|x\r\n");
        assert_eq!(records(&next), vec![&b"a|1|x"[..]]);
    }

    #[test]
    fn end_of_stream_while_skipping_has_nothing_pending() {
        let mut framer = RecordFramer::new(4);
        framer.feed(b"0123456789\r");

        assert_eq!(framer.take_pending(), None);
        assert!(!framer.is_discarding());
    }
}

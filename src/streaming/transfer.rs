//! Data types moved during range streaming.

use crate::dht::{Range, Token};
use crate::error::CodecError;
use crate::types::Endpoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A row being streamed to a joining node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamedRow {
    /// Token the row's key hashes to.
    pub token: Token,

    /// The row key.
    pub key: Vec<u8>,

    /// The serialized row.
    pub value: Vec<u8>,
}

impl StreamedRow {
    /// Create a new row.
    pub fn new(token: Token, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            token,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }

    /// Position to resume after this row.
    pub fn cursor(&self) -> StreamCursor {
        StreamCursor {
            token: self.token,
            key: self.key.clone(),
        }
    }
}

/// Resume position within a range: rows are ordered by token, then key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamCursor {
    /// Token of the last row received.
    pub token: Token,

    /// Key of the last row received.
    pub key: Vec<u8>,
}

impl StreamCursor {
    /// Check if `row` comes after this position.
    pub fn is_before(&self, row: &StreamedRow) -> bool {
        (self.token, self.key.as_slice()) < (row.token, row.key.as_slice())
    }
}

/// A batch of rows from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBatch {
    /// The batch sequence number.
    pub sequence: u64,

    /// Rows in this batch, in cursor order.
    pub rows: Vec<StreamedRow>,

    /// Whether this is the last batch for the range.
    pub is_final: bool,
}

impl RowBatch {
    /// Create a new batch.
    pub fn new(sequence: u64, rows: Vec<StreamedRow>, is_final: bool) -> Self {
        Self {
            sequence,
            rows,
            is_final,
        }
    }

    /// Create an empty final batch.
    pub fn empty_final(sequence: u64) -> Self {
        Self::new(sequence, Vec::new(), true)
    }

    /// Get the number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Total payload size in bytes.
    pub fn byte_size(&self) -> usize {
        self.rows.iter().map(StreamedRow::size).sum()
    }

    /// Position to resume after this batch.
    pub fn cursor(&self) -> Option<StreamCursor> {
        self.rows.last().map(StreamedRow::cursor)
    }

    /// Encode for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// One range of one keyspace that must be received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamRequirement {
    /// The keyspace.
    pub keyspace: String,

    /// The range.
    pub range: Range,
}

impl StreamRequirement {
    /// Create a requirement.
    pub fn new(keyspace: impl Into<String>, range: Range) -> Self {
        Self {
            keyspace: keyspace.into(),
            range,
        }
    }
}

impl fmt::Display for StreamRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.range)
    }
}

/// Progress of one range transfer.
#[derive(Debug, Clone)]
pub struct StreamProgress {
    /// Fetch session this transfer belongs to.
    pub session_id: Uuid,

    /// What is being transferred.
    pub requirement: StreamRequirement,

    /// Where it is coming from.
    pub source: Endpoint,

    /// Rows applied so far.
    pub rows: u64,

    /// Payload bytes applied so far.
    pub bytes: u64,

    /// Batches received.
    pub batches: u64,

    /// Whether the transfer has finished, successfully or not.
    pub complete: bool,

    /// Error if the transfer failed.
    pub error: Option<String>,
}

impl StreamProgress {
    /// Create a new progress tracker.
    pub fn new(session_id: Uuid, requirement: StreamRequirement, source: Endpoint) -> Self {
        Self {
            session_id,
            requirement,
            source,
            rows: 0,
            bytes: 0,
            batches: 0,
            complete: false,
            error: None,
        }
    }

    /// Record an applied batch.
    pub fn update(&mut self, rows: u64, bytes: u64) {
        self.rows += rows;
        self.bytes += bytes;
        self.batches += 1;
    }

    /// Mark as complete.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// Mark as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.complete = true;
    }

    /// Check if the transfer finished without error.
    pub fn succeeded(&self) -> bool {
        self.complete && self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(token: u64, key: &str) -> StreamedRow {
        StreamedRow::new(Token::new(token), key.as_bytes(), b"value".to_vec())
    }

    #[test]
    fn test_row_batch() {
        let batch = RowBatch::new(1, vec![row(12, "a"), row(15, "bb")], false);

        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert_eq!(batch.byte_size(), 1 + 5 + 2 + 5);
        assert_eq!(batch.cursor(), Some(row(15, "bb").cursor()));

        let last = RowBatch::empty_final(2);
        assert!(last.is_final);
        assert!(last.cursor().is_none());
    }

    #[test]
    fn test_row_batch_wire_format() {
        let batch = RowBatch::new(7, vec![row(20, "k")], true);
        let bytes = batch.to_bytes().unwrap();
        assert_eq!(RowBatch::from_bytes(&bytes).unwrap(), batch);

        assert!(matches!(
            RowBatch::from_bytes(&bytes[..3]),
            Err(CodecError::Serialization(_))
        ));
    }

    #[test]
    fn test_cursor_ordering() {
        let cursor = row(20, "b").cursor();
        assert!(cursor.is_before(&row(20, "c")));
        assert!(cursor.is_before(&row(21, "a")));
        assert!(!cursor.is_before(&row(20, "b")));
        assert!(!cursor.is_before(&row(19, "z")));
    }

    #[test]
    fn test_stream_progress() {
        let requirement =
            StreamRequirement::new("users", Range::new(Token::new(10), Token::new(30)));
        assert_eq!(requirement.to_string(), "users/(10,30]");

        let mut progress = StreamProgress::new(
            Uuid::new_v4(),
            requirement,
            "10.0.0.2:7000".parse().unwrap(),
        );
        progress.update(10, 100);
        progress.update(5, 50);
        assert_eq!((progress.rows, progress.bytes, progress.batches), (15, 150, 2));
        assert!(!progress.succeeded());

        progress.mark_complete();
        assert!(progress.succeeded());

        progress.mark_failed("source down");
        assert!(!progress.succeeded());
    }
}

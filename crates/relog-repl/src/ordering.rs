//! Gap-free ordered log kept by a follower.
//!
//! Records may arrive out of sequence order. A record whose predecessor is
//! missing waits in a pending buffer; once the gap is filled the contiguous
//! run is committed in one step.

use std::collections::BTreeMap;

use crate::error::{ReplError, Result};

/// What happened to a delivered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The record and `appended - 1` buffered successors were committed.
    Committed {
        /// Records appended to the committed log by this call.
        appended: usize,
    },
    /// Predecessors are missing; the record waits in the buffer.
    Buffered,
    /// The sequence was already committed or buffered; nothing changed.
    Duplicate,
}

/// Committed records in sequence order plus the out-of-order buffer.
///
/// Invariant: `committed[i]` holds sequence `i + 1`, and every buffered
/// sequence is greater than `committed.len() + 1`.
#[derive(Debug, Default)]
pub struct OrderedLog {
    committed: Vec<String>,
    pending: BTreeMap<u32, String>,
}

impl OrderedLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next committed record must carry.
    pub fn next_sequence(&self) -> u64 {
        self.committed.len() as u64 + 1
    }

    /// Deliver the record with sequence `sequence`.
    pub fn commit(&mut self, sequence: u32, record: String) -> Result<CommitOutcome> {
        if sequence == 0 {
            return Err(ReplError::Validation {
                msg: "sequence numbers start at 1".to_string(),
            });
        }

        let next = self.next_sequence();
        let sequence_wide = u64::from(sequence);

        if sequence_wide < next {
            return Ok(CommitOutcome::Duplicate);
        }
        if sequence_wide > next {
            if self.pending.contains_key(&sequence) {
                return Ok(CommitOutcome::Duplicate);
            }
            self.pending.insert(sequence, record);
            return Ok(CommitOutcome::Buffered);
        }

        self.committed.push(record);
        let mut appended = 1;
        while let Ok(next) = u32::try_from(self.next_sequence()) {
            match self.pending.remove(&next) {
                Some(record) => {
                    self.committed.push(record);
                    appended += 1;
                }
                None => break,
            }
        }
        Ok(CommitOutcome::Committed { appended })
    }

    /// Committed records in sequence order.
    pub fn records(&self) -> &[String] {
        &self.committed
    }

    /// Number of committed records.
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    /// Whether nothing has been committed yet.
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Number of records waiting for a predecessor.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

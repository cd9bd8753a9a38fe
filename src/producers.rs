//! Server-side idempotent-producer sequencing table.
//!
//! One row per `(path, producer_id)`. The append path consults the table
//! under the owning stream's write lock, so ordering within a producer is
//! serialized here. At-least-once delivery from flaky clients must not
//! duplicate, and a flapping producer (new epoch) must be able to fence out
//! stragglers.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::StoreError;

/// Idempotence headers extracted from an append request.
#[derive(Debug, Clone)]
pub struct ProducerAppend {
    pub producer_id: String,
    pub epoch: u64,
    pub seq: u64,
    /// Set when the request carried the auto-claim opt-in header; allows a
    /// larger epoch to take over the row.
    pub auto_claim: bool,
}

/// Decision for an append carrying producer headers.
#[derive(Debug, Clone)]
pub enum ProducerDecision {
    /// The append is new; commit it and then record the offset.
    Append,
    /// Idempotent replay: nothing is appended, the previously assigned
    /// offset is returned.
    Duplicate { offset: String, last_seq: u64 },
}

#[derive(Debug, Clone)]
struct ProducerRow {
    epoch: u64,
    last_seq: u64,
    last_offset: String,
}

/// Deduplication and fencing state for all producers, keyed by
/// `(path, producer_id)`.
#[derive(Default)]
pub struct ProducerTable {
    rows: Mutex<HashMap<(String, String), ProducerRow>>,
}

impl ProducerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate an append request against the row.
    ///
    /// Row absent: any `seq >= 1` is accepted and claims the row's epoch.
    /// Otherwise: a lower epoch is fenced; a higher epoch is accepted only
    /// with the auto-claim opt-in (restarting the sequence); `seq <=
    /// last_seq` is an idempotent replay; `seq == last_seq + 1` appends;
    /// anything else is a gap.
    pub fn check(&self, path: &str, req: &ProducerAppend) -> Result<ProducerDecision, StoreError> {
        let rows = self.rows.lock();
        let row = match rows.get(&(path.to_string(), req.producer_id.clone())) {
            None => {
                if req.seq == 0 {
                    return Err(StoreError::SequenceConflict { expected: 1 });
                }
                return Ok(ProducerDecision::Append);
            }
            Some(row) => row,
        };

        if req.epoch < row.epoch {
            return Err(StoreError::Fenced {
                current_epoch: row.epoch,
            });
        }
        if req.epoch > row.epoch {
            if req.auto_claim {
                // Epoch takeover restarts the sequence.
                if req.seq == 0 {
                    return Err(StoreError::SequenceConflict { expected: 1 });
                }
                return Ok(ProducerDecision::Append);
            }
            return Err(StoreError::StaleEpoch {
                current_epoch: row.epoch,
            });
        }

        if req.seq <= row.last_seq {
            return Ok(ProducerDecision::Duplicate {
                offset: row.last_offset.clone(),
                last_seq: row.last_seq,
            });
        }
        if req.seq == row.last_seq + 1 {
            return Ok(ProducerDecision::Append);
        }
        Err(StoreError::SequenceConflict {
            expected: row.last_seq + 1,
        })
    }

    /// Record a committed append.
    pub fn commit(&self, path: &str, req: &ProducerAppend, offset: &str) {
        let mut rows = self.rows.lock();
        rows.insert(
            (path.to_string(), req.producer_id.clone()),
            ProducerRow {
                epoch: req.epoch,
                last_seq: req.seq,
                last_offset: offset.to_string(),
            },
        );
    }

    /// Drop all rows for a deleted stream.
    pub fn drop_path(&self, path: &str) {
        let mut rows = self.rows.lock();
        rows.retain(|(p, _), _| p != path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(epoch: u64, seq: u64) -> ProducerAppend {
        ProducerAppend {
            producer_id: "p".to_string(),
            epoch,
            seq,
            auto_claim: false,
        }
    }

    #[test]
    fn test_fresh_row_accepts_any_positive_seq() {
        let table = ProducerTable::new();
        assert!(matches!(
            table.check("/s", &req(1, 5)),
            Ok(ProducerDecision::Append)
        ));
        assert!(matches!(
            table.check("/s", &req(1, 0)),
            Err(StoreError::SequenceConflict { expected: 1 })
        ));
    }

    #[test]
    fn test_replay_returns_previous_offset() {
        let table = ProducerTable::new();
        let r = req(1, 1);
        table.commit("/s", &r, "0000000000000000_0000000000000001");

        match table.check("/s", &req(1, 1)).unwrap() {
            ProducerDecision::Duplicate { offset, last_seq } => {
                assert_eq!(offset, "0000000000000000_0000000000000001");
                assert_eq!(last_seq, 1);
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_gap_is_rejected_with_expected_seq() {
        let table = ProducerTable::new();
        table.commit("/s", &req(1, 2), "o");
        assert!(matches!(
            table.check("/s", &req(1, 4)),
            Err(StoreError::SequenceConflict { expected: 3 })
        ));
    }

    #[test]
    fn test_old_epoch_is_fenced() {
        let table = ProducerTable::new();
        table.commit("/s", &req(3, 1), "o");
        assert!(matches!(
            table.check("/s", &req(2, 2)),
            Err(StoreError::Fenced { current_epoch: 3 })
        ));
    }

    #[test]
    fn test_new_epoch_requires_auto_claim() {
        let table = ProducerTable::new();
        table.commit("/s", &req(1, 7), "o");

        assert!(matches!(
            table.check("/s", &req(2, 1)),
            Err(StoreError::StaleEpoch { current_epoch: 1 })
        ));

        let claim = ProducerAppend {
            auto_claim: true,
            ..req(2, 1)
        };
        assert!(matches!(
            table.check("/s", &claim),
            Ok(ProducerDecision::Append)
        ));
    }

    #[test]
    fn test_drop_path_forgets_rows() {
        let table = ProducerTable::new();
        table.commit("/s", &req(1, 1), "o");
        table.drop_path("/s");
        assert!(matches!(
            table.check("/s", &req(1, 9)),
            Ok(ProducerDecision::Append)
        ));
    }
}

use std::collections::VecDeque;

use log::error;
use thiserror::Error;

use super::request::RequestId;

// Accounting faults on the transfer log. A barrier fault means the
// local and peer views of the log diverged, which is a programming bug
// somewhere; the session must be torn down and fully resynced.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlError {
    #[error("transfer log full, capacity {0}")]
    Full(usize),
    #[error("barrier ack {reported} but no barrier is open")]
    NoBarrier { reported: u32 },
    #[error("invalid barrier number: found {found}, reported {reported}")]
    BarrierMismatch { found: u32, reported: u32 },
    #[error("epoch set size wrong: found {found}, reported {reported}")]
    SetSizeMismatch { found: u32, reported: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlEntry {
    Request(RequestId),
    // A mirrored write that was destroyed before its barrier ack; keeps
    // the epoch set-size accounting exact
    Completed { epoch_nr: u32 },
    Barrier { barrier_nr: u32 },
}

// Append-only log of in-flight requests interleaved with barrier
// markers, ordered by submission. Used for replay on reconnect and for
// barrier-ack accounting. Mutated only under the device request lock.
#[derive(Debug)]
pub struct TransferLog {
    entries: VecDeque<TlEntry>,
    capacity: usize,
}

impl TransferLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Attach a request after all existing entries. A full log is a
    // capacity bug: it is reported and the append refused, never
    // overwritten.
    pub fn append_request(&mut self, id: RequestId) -> Result<(), TlError> {
        if self.entries.len() >= self.capacity {
            error!("transfer log too small, refusing entry (capacity {})", self.capacity);
            return Err(TlError::Full(self.capacity));
        }
        self.entries.push_back(TlEntry::Request(id));
        Ok(())
    }

    // Append the barrier closing an epoch. Barrier markers are exempt
    // from the capacity refusal: losing one would desynchronize the
    // accounting for good.
    pub fn append_barrier(&mut self, barrier_nr: u32) {
        if self.entries.len() >= self.capacity {
            error!("transfer log over capacity at barrier {}", barrier_nr);
        }
        self.entries.push_back(TlEntry::Barrier { barrier_nr });
    }

    // The oldest not-yet-acked barrier, if any
    pub fn first_barrier(&self) -> Option<u32> {
        self.entries.iter().find_map(|e| match e {
            TlEntry::Barrier { barrier_nr } => Some(*barrier_nr),
            _ => None,
        })
    }

    // Entries ahead of the oldest barrier, which must carry the given
    // number. Fatal if the barrier order diverged from the wire.
    pub fn entries_before_barrier(&self, reported: u32) -> Result<Vec<TlEntry>, TlError> {
        let found = self
            .first_barrier()
            .ok_or(TlError::NoBarrier { reported })?;
        if found != reported {
            return Err(TlError::BarrierMismatch { found, reported });
        }
        Ok(self
            .entries
            .iter()
            .take_while(|e| !matches!(e, TlEntry::Barrier { .. }))
            .copied()
            .collect())
    }

    // Pop the acked barrier and every tombstone of its epoch ahead of
    // it. Live entries stay until their requests are destroyed.
    pub fn retire_barrier(&mut self, barrier_nr: u32) {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| matches!(e, TlEntry::Barrier { barrier_nr: nr } if *nr == barrier_nr))
        else {
            return;
        };
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for (i, entry) in self.entries.drain(..).enumerate() {
            if i == pos {
                continue;
            }
            if i < pos {
                if let TlEntry::Completed { epoch_nr } = entry {
                    if epoch_nr == barrier_nr {
                        continue;
                    }
                }
            }
            kept.push_back(entry);
        }
        self.entries = kept;
    }

    // Replace a request entry with an epoch tombstone (the request went
    // away before its barrier ack)
    pub fn tombstone_request(&mut self, id: RequestId, epoch_nr: u32) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| matches!(e, TlEntry::Request(other) if *other == id))
        {
            *entry = TlEntry::Completed { epoch_nr };
        }
    }

    // Drop a request entry entirely
    pub fn remove_request(&mut self, id: RequestId) {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| matches!(e, TlEntry::Request(other) if *other == id))
        {
            self.entries.remove(pos);
        }
    }

    // Drop stale barrier markers and tombstones, keeping live request
    // entries in order. Used when a failed session gives up on its
    // barrier bookkeeping for good.
    pub fn drop_barrier_state(&mut self) {
        self.entries
            .retain(|e| matches!(e, TlEntry::Request(_)));
    }

    // Drop only the tombstones: destroyed writes will not be resent, so
    // the peer will not count them again after a reconnect. Barrier
    // markers stay; their epochs are re-fenced during the replay.
    pub fn drop_tombstones(&mut self) {
        self.entries
            .retain(|e| !matches!(e, TlEntry::Completed { .. }));
    }

    // Un-acked barriers in log order
    pub fn barrier_numbers(&self) -> Vec<u32> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                TlEntry::Barrier { barrier_nr } => Some(*barrier_nr),
                _ => None,
            })
            .collect()
    }

    pub fn request_ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.entries.iter().filter_map(|e| match e {
            TlEntry::Request(id) => Some(*id),
            _ => None,
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_capacity() {
        let mut tl = TransferLog::new(2);
        tl.append_request(1).unwrap();
        tl.append_request(2).unwrap();
        assert_eq!(tl.append_request(3), Err(TlError::Full(2)));
        assert_eq!(tl.len(), 2);
    }

    #[test]
    fn test_barrier_order_check() {
        let mut tl = TransferLog::new(16);
        tl.append_request(1).unwrap();
        tl.append_barrier(7);
        tl.append_request(2).unwrap();
        tl.append_barrier(8);

        assert_eq!(tl.first_barrier(), Some(7));
        assert_eq!(
            tl.entries_before_barrier(8),
            Err(TlError::BarrierMismatch {
                found: 7,
                reported: 8
            })
        );
        let before = tl.entries_before_barrier(7).unwrap();
        assert_eq!(before, vec![TlEntry::Request(1)]);
    }

    #[test]
    fn test_no_barrier_is_fatal() {
        let tl = TransferLog::new(16);
        assert_eq!(
            tl.entries_before_barrier(3),
            Err(TlError::NoBarrier { reported: 3 })
        );
    }

    #[test]
    fn test_retire_barrier_keeps_live_entries() {
        let mut tl = TransferLog::new(16);
        tl.append_request(1).unwrap();
        tl.append_request(2).unwrap();
        tl.tombstone_request(2, 7);
        tl.append_barrier(7);
        tl.append_request(3).unwrap();

        tl.retire_barrier(7);
        // Request 1 not yet destroyed: stays. Tombstone and barrier gone.
        let ids: Vec<_> = tl.request_ids().collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(tl.first_barrier(), None);
    }

    #[test]
    fn test_drop_tombstones_keeps_barriers() {
        let mut tl = TransferLog::new(16);
        tl.append_request(1).unwrap();
        tl.tombstone_request(1, 4);
        tl.append_barrier(4);
        tl.append_request(2).unwrap();
        tl.append_barrier(5);

        tl.drop_tombstones();
        assert_eq!(tl.barrier_numbers(), vec![4, 5]);
        let ids: Vec<_> = tl.request_ids().collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_drop_barrier_state() {
        let mut tl = TransferLog::new(16);
        tl.append_request(1).unwrap();
        tl.append_barrier(4);
        tl.tombstone_request(1, 4);
        tl.append_request(2).unwrap();

        tl.drop_barrier_state();
        let ids: Vec<_> = tl.request_ids().collect();
        assert_eq!(ids, vec![2]);
    }
}

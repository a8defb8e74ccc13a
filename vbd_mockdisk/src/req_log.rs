// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Append-only, synchronized record of every inbound I/O request.
//!
//! The log is the ground truth tests assert against: call counts, arrival
//! order, and (for writes and unmaps) the exact payload bytes. Entries are
//! never mutated or removed once inserted.

use parking_lot::Mutex;
use vbd_protocol::IoRequest;

/// A single logged request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Monotonically increasing sequence number, contiguous from zero.
    pub seq: u64,
    /// The request as delivered by the transport.
    pub request: IoRequest,
    /// Copy of the payload associated with the request: the written bytes
    /// for writes, the raw descriptor array for unmaps, absent otherwise.
    pub payload: Option<Vec<u8>>,
}

/// Thread-safe append-only request log.
#[derive(Default)]
pub struct RequestLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl RequestLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry atomically.
    ///
    /// The sequence number is assigned under the same lock as the append, so
    /// concurrent callers can never interleave partial entries or lose one.
    pub fn add_entry(&self, request: IoRequest, payload: Option<Vec<u8>>) {
        let mut entries = self.entries.lock();
        let seq = entries.len() as u64;
        entries.push(LogEntry {
            seq,
            request,
            payload,
        });
    }

    /// Returns an ordered snapshot of the log at the time of the call.
    ///
    /// Appends that race with the snapshot are reflected only in later
    /// snapshots.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Number of entries logged so far.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbd_protocol::RequestCmd;
    use vbd_protocol::RequestType;

    fn flush_request(handle: u64) -> IoRequest {
        IoRequest {
            handle,
            request_type: RequestType::Flush,
            cmd: RequestCmd::Flush {
                block_address: 0,
                block_count: 1,
            },
        }
    }

    #[test]
    fn sequence_numbers_are_contiguous() {
        let log = RequestLog::new();
        for handle in 0..10 {
            log.add_entry(flush_request(handle), None);
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 10);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.seq, i as u64);
            assert_eq!(entry.request.handle, i as u64);
        }
    }

    #[test]
    fn snapshot_is_stable_under_later_appends() {
        let log = RequestLog::new();
        log.add_entry(flush_request(1), None);
        let snapshot = log.entries();
        log.add_entry(flush_request(2), None);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 100;

        let log = std::sync::Arc::new(RequestLog::new());
        let threads: Vec<_> = (0..THREADS)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        log.add_entry(flush_request(t * PER_THREAD + i), Some(vec![t as u8]));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let entries = log.entries();
        assert_eq!(entries.len(), (THREADS * PER_THREAD) as usize);
        // Sequence numbers are assigned under the append lock.
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.seq, i as u64);
        }
        // Per-thread arrival order is preserved.
        for t in 0..THREADS {
            let handles: Vec<_> = entries
                .iter()
                .filter(|e| e.payload.as_deref() == Some(&[t as u8]))
                .map(|e| e.request.handle)
                .collect();
            let mut sorted = handles.clone();
            sorted.sort_unstable();
            assert_eq!(handles, sorted);
        }
    }
}

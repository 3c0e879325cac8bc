//! Streaming record encoder over the buffer ring.
//!
//! Packs fixed-size input records into ring slots, submits a slot once it
//! holds as many records as its input and output halves allow, and hands
//! every output record to a callback in the order the inputs were sent.
//!
//! ```ignore
//! let mut stream = Stream::open(&mut ring, 8, 4, |out| results.push(out.to_vec()))?;
//! for sample in samples {
//!     stream.put(&sample);
//! }
//! stream.close()?;
//! ```

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use snnap_core::{NpuError, NpuPlatform, NpuResult};

use crate::ring::BufferRing;

/// A batching session borrowing the ring exclusively.
pub struct Stream<'r, P: NpuPlatform, F: FnMut(&[u8])> {
    ring: &'r mut BufferRing<P>,
    input_size: usize,
    output_size: usize,
    per_slot: usize,
    /// Records sent into each slot and not yet delivered.
    counts: Vec<usize>,
    /// Slot being filled, always the ring's write cursor.
    open: Option<usize>,
    /// A record was handed out by `write` and not yet sent.
    staged: bool,
    callback: F,
    /// Records of the slot at the read cursor already given to the callback.
    handed: usize,
    /// Inside the callback loop. Still set if the callback panicked.
    delivering: bool,
    sent: u64,
    delivered: u64,
    closed: bool,
}

/// Error from [`Stream::close`]. Holds the stream so the drain can be retried.
pub struct CloseError<S> {
    stream: S,
    error: NpuError,
}

impl<S> CloseError<S> {
    /// Why the drain stopped.
    pub fn error(&self) -> NpuError {
        self.error
    }

    /// Take the stream back, outstanding records intact.
    pub fn into_stream(self) -> S {
        self.stream
    }
}

impl<S> fmt::Debug for CloseError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<S> fmt::Display for CloseError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream close failed: {}", self.error)
    }
}

impl<S> From<CloseError<S>> for NpuError {
    fn from(err: CloseError<S>) -> Self {
        err.error
    }
}

impl<'r, P: NpuPlatform, F: FnMut(&[u8])> Stream<'r, P, F> {
    /// Start a stream of `input_size`-byte records producing
    /// `output_size`-byte results.
    ///
    /// Fails with [`NpuError::InvalidRecordSize`] if no record fits a slot
    /// and with [`NpuError::Busy`] if the ring still has slots in flight.
    pub fn open(
        ring: &'r mut BufferRing<P>,
        input_size: usize,
        output_size: usize,
        callback: F,
    ) -> NpuResult<Self> {
        let slot_size = ring.slot_size();
        let per_slot = match (
            slot_size.checked_div(input_size),
            slot_size.checked_div(output_size),
        ) {
            (Some(i), Some(o)) => i.min(o),
            _ => 0,
        };
        if per_slot == 0 {
            return Err(NpuError::InvalidRecordSize {
                input: input_size,
                output: output_size,
            });
        }
        if !ring.is_idle() {
            return Err(NpuError::Busy);
        }

        debug!("npu: stream open, {input_size}->{output_size} bytes, {per_slot} records/slot");
        Ok(Self {
            counts: vec![0; ring.slot_count()],
            ring,
            input_size,
            output_size,
            per_slot,
            open: None,
            staged: false,
            callback,
            handed: 0,
            delivering: false,
            sent: 0,
            delivered: 0,
            closed: false,
        })
    }

    /// Records that fit in one slot.
    pub fn records_per_slot(&self) -> usize {
        self.per_slot
    }

    /// Records sent but not yet delivered to the callback.
    pub fn pending(&self) -> u64 {
        self.sent - self.delivered
    }

    /// Records delivered to the callback so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// The ring underneath.
    pub fn ring(&self) -> &BufferRing<P> {
        &*self.ring
    }

    /// Buffer for the next input record.
    ///
    /// Opens a new slot when none is open, first draining the oldest slot if
    /// every slot is in flight. Calling `write` again before [`Stream::send`]
    /// returns the same record.
    pub fn write(&mut self) -> NpuResult<&mut [u8]> {
        let n = match self.open {
            Some(n) => n,
            None => {
                if !self.ring.can_write() {
                    self.drain_one()?;
                }
                let n = self.ring.write_cursor();
                self.ring.write_buf();
                self.open = Some(n);
                n
            }
        };
        self.staged = true;

        let at = self.counts[n] * self.input_size;
        Ok(&mut self.ring.writing_buf()[at..at + self.input_size])
    }

    /// Commit the record returned by the last [`Stream::write`].
    ///
    /// Submits the slot once it is full.
    pub fn send(&mut self) {
        let n = match self.open {
            Some(n) if self.staged => n,
            _ => panic!("npu: stream send without a preceding write"),
        };
        self.staged = false;
        self.counts[n] += 1;
        self.sent += 1;

        if self.counts[n] == self.per_slot {
            self.ring.send_buf();
            self.open = None;
        }
    }

    /// Write and send one record.
    pub fn put(&mut self, record: &[u8]) -> NpuResult<()> {
        assert_eq!(
            record.len(),
            self.input_size,
            "npu: stream record of {} bytes, expected {}",
            record.len(),
            self.input_size
        );
        self.write()?.copy_from_slice(record);
        self.send();
        Ok(())
    }

    /// Wait for the slot at the read cursor and deliver its records.
    ///
    /// Resumes after the last record handed out if a previous call was cut
    /// short by a panicking callback.
    fn drain_one(&mut self) -> NpuResult<()> {
        let n = self.ring.read_cursor();
        self.ring.wait_ready()?;

        let count = self.counts[n];
        let size = self.output_size;
        let output = self.ring.read_buf();
        self.delivering = true;
        for record in output[self.handed * size..count * size].chunks_exact(size) {
            self.handed += 1;
            self.delivered += 1;
            (self.callback)(record);
        }
        self.delivering = false;

        self.ring.consume_buf();
        self.counts[n] = 0;
        self.handed = 0;
        trace!("npu: stream drained {count} records from slot {n}");
        Ok(())
    }

    /// Submit the open slot and deliver every outstanding record.
    ///
    /// An open slot holding no sent record is given back instead. Afterwards
    /// the ring is idle. On error the stream stays usable and a later
    /// `barrier` picks up where this one stopped.
    pub fn barrier(&mut self) -> NpuResult<()> {
        if let Some(n) = self.open.take() {
            self.staged = false;
            if self.counts[n] > 0 {
                self.ring.send_buf();
            } else {
                self.ring.abandon_buf();
            }
        }

        let mut drained = 0;
        while self.counts[self.ring.read_cursor()] > 0 {
            self.drain_one()?;
            drained += 1;
        }
        if drained > 0 {
            debug!(
                "npu: stream barrier drained {drained} slots, {} records delivered",
                self.delivered
            );
        }
        Ok(())
    }

    /// Drain everything and end the stream.
    ///
    /// If the drain fails the stream comes back inside the error, still
    /// holding its undelivered records.
    pub fn close(mut self) -> Result<(), CloseError<Self>> {
        match self.barrier() {
            Ok(()) => {
                self.closed = true;
                Ok(())
            }
            Err(error) => Err(CloseError {
                stream: self,
                error,
            }),
        }
    }
}

impl<P: NpuPlatform, F: FnMut(&[u8])> Drop for Stream<'_, P, F> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.delivering {
            // Unwinding out of the callback
            error!(
                "npu: stream dropped inside its callback, {} records undelivered",
                self.pending()
            );
            return;
        }
        if let Err(e) = self.barrier() {
            error!("npu: dropped stream failed to drain: {e}");
        }
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use alloc::sync::Arc;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use snnap_core::{ReadyFlag, WaitPolicy};

    use super::*;
    use crate::sim::SimAccelerator;

    fn value(record: &[u8]) -> u64 {
        u64::from_le_bytes(record.try_into().unwrap())
    }

    type SimRing = BufferRing<Arc<SimAccelerator>>;

    fn identity(slots: usize, size: usize) -> (Arc<SimAccelerator>, SimRing) {
        let sim = SimAccelerator::identity(slots, size).unwrap();
        let ring = sim.ring().unwrap();
        (sim, ring)
    }

    #[test]
    fn partial_slot_is_flushed_in_order() {
        let (sim, mut ring) = identity(2, 32);
        let mut got = Vec::new();

        let mut stream = Stream::open(&mut ring, 8, 8, |r| got.push(value(r))).unwrap();
        assert_eq!(stream.records_per_slot(), 4);
        for v in 0..6u64 {
            stream.put(&v.to_le_bytes()).unwrap();
        }
        assert_eq!(stream.pending(), 6);
        stream.close().unwrap();

        assert_eq!(got, [0, 1, 2, 3, 4, 5]);
        assert_eq!(ring.stats().submitted, 2);
        assert!(ring.is_idle());
        assert_eq!(sim.invocations(), 2);
    }

    #[test]
    fn write_then_send() {
        let (_sim, mut ring) = identity(3, 16);
        let mut got = Vec::new();

        let mut stream = Stream::open(&mut ring, 4, 4, |r| got.push(r.to_vec())).unwrap();
        for v in 0..10u8 {
            stream.write().unwrap().fill(v);
            stream.send();
        }
        stream.close().unwrap();

        let want: Vec<_> = (0..10u8).map(|v| vec![v; 4]).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn rewriting_before_send_replaces_the_record() {
        let (_sim, mut ring) = identity(2, 16);
        let mut got = Vec::new();

        let mut stream = Stream::open(&mut ring, 8, 8, |r| got.push(value(r))).unwrap();
        stream.write().unwrap().copy_from_slice(&1u64.to_le_bytes());
        stream.write().unwrap().copy_from_slice(&2u64.to_le_bytes());
        stream.send();
        stream.close().unwrap();

        assert_eq!(got, [2]);
    }

    #[test]
    fn barrier_is_idempotent() {
        let (sim, mut ring) = identity(2, 32);
        let mut calls = 0;

        let mut stream = Stream::open(&mut ring, 8, 8, |_| calls += 1).unwrap();
        stream.put(&[0; 8]).unwrap();
        stream.barrier().unwrap();
        stream.barrier().unwrap();
        assert_eq!(stream.delivered(), 1);
        assert_eq!(stream.ring().stats().submitted, 1);
        stream.close().unwrap();

        assert_eq!(calls, 1);
        assert_eq!(sim.invocations(), 1);
    }

    #[test]
    fn barrier_without_records_is_a_no_op() {
        let (sim, mut ring) = identity(2, 32);
        let mut stream = Stream::open(&mut ring, 8, 8, |_| panic!("no output expected")).unwrap();
        stream.barrier().unwrap();
        stream.close().unwrap();

        assert_eq!(sim.pending(), 0);
        assert_eq!(ring.stats().submitted, 0);
    }

    #[test]
    fn unsent_write_is_abandoned() {
        let (sim, mut ring) = identity(2, 32);
        let mut stream = Stream::open(&mut ring, 8, 8, |_| panic!("no output expected")).unwrap();
        stream.write().unwrap().fill(7);
        stream.barrier().unwrap();
        assert!(stream.ring().is_idle());
        stream.close().unwrap();

        assert_eq!(sim.invocations(), 0);
    }

    #[test]
    fn full_ring_drains_oldest_slot() {
        let (sim, mut ring) = identity(2, 32);
        let mut got = Vec::new();

        let mut stream = Stream::open(&mut ring, 8, 8, |r| got.push(value(r))).unwrap();
        for v in 0..8u64 {
            stream.put(&v.to_le_bytes()).unwrap();
        }
        assert_eq!(stream.ring().outstanding(), 2);
        assert_eq!(stream.delivered(), 0);

        sim.stall(3);
        stream.put(&8u64.to_le_bytes()).unwrap();
        assert_eq!(stream.delivered(), 4);
        assert_eq!(sim.waits(), 4);
        stream.close().unwrap();

        assert_eq!(got, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn wedged_accelerator_times_out() {
        let (sim, mut ring) = identity(2, 32);
        ring.set_wait_policy(WaitPolicy::Polls(5));
        let mut got = Vec::new();

        let mut stream = Stream::open(&mut ring, 8, 8, |r| got.push(value(r))).unwrap();
        for v in 0..8u64 {
            stream.put(&v.to_le_bytes()).unwrap();
        }
        sim.wedge();
        assert_eq!(
            stream.put(&8u64.to_le_bytes()),
            Err(NpuError::Timeout { slot: 0 })
        );
        assert_eq!(stream.pending(), 8);

        sim.unwedge();
        stream.barrier().unwrap();
        assert_eq!(stream.delivered(), 8);
        stream.close().unwrap();

        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn failed_close_hands_the_stream_back() {
        let (sim, mut ring) = identity(2, 32);
        ring.set_wait_policy(WaitPolicy::Polls(5));
        let mut got = Vec::new();

        let mut stream = Stream::open(&mut ring, 8, 8, |r| got.push(value(r))).unwrap();
        for v in 0..3u64 {
            stream.put(&v.to_le_bytes()).unwrap();
        }
        sim.wedge();
        let err = stream.close().unwrap_err();
        assert_eq!(err.error(), NpuError::Timeout { slot: 0 });

        let stream = err.into_stream();
        assert_eq!(stream.pending(), 3);
        sim.unwedge();
        stream.close().unwrap();

        assert_eq!(got, [0, 1, 2]);
        assert!(ring.is_idle());
    }

    #[test]
    fn panicking_callback_is_not_called_again_while_unwinding() {
        let (_sim, mut ring) = identity(2, 32);
        let mut calls = Vec::new();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut stream = Stream::open(&mut ring, 8, 8, |r| {
                calls.push(value(r));
                assert_ne!(value(r), 1, "callback failed");
            })
            .unwrap();
            for v in 0..3u64 {
                stream.put(&v.to_le_bytes()).unwrap();
            }
            stream.barrier().unwrap();
        }));

        assert!(result.is_err());
        assert_eq!(calls, [0, 1]);
    }

    #[test]
    fn barrier_resumes_after_a_caught_callback_panic() {
        let (_sim, mut ring) = identity(2, 32);
        let mut got = Vec::new();
        let mut failed = false;

        let mut stream = Stream::open(&mut ring, 8, 8, |r| {
            let v = value(r);
            got.push(v);
            if v == 1 && !failed {
                failed = true;
                panic!("callback failed");
            }
        })
        .unwrap();
        for v in 0..6u64 {
            stream.put(&v.to_le_bytes()).unwrap();
        }
        assert!(catch_unwind(AssertUnwindSafe(|| stream.barrier())).is_err());
        assert_eq!(stream.delivered(), 2);
        stream.close().unwrap();

        assert_eq!(got, [0, 1, 2, 3, 4, 5]);
        assert!(ring.is_idle());
    }

    #[test]
    fn output_records_may_differ_in_size() {
        let sim = SimAccelerator::new(2, 16, ReadyFlag::Dedicated, |input, output| {
            for (i, pair) in input.chunks_exact(8).enumerate() {
                let a = u32::from_le_bytes(pair[..4].try_into().unwrap());
                let b = u32::from_le_bytes(pair[4..].try_into().unwrap());
                output[i * 4..i * 4 + 4].copy_from_slice(&(a + b).to_le_bytes());
            }
        })
        .unwrap();
        let mut ring = sim.ring().unwrap();
        let mut sums = Vec::new();

        let mut stream = Stream::open(&mut ring, 8, 4, |r| {
            sums.push(u32::from_le_bytes(r.try_into().unwrap()))
        })
        .unwrap();
        assert_eq!(stream.records_per_slot(), 2);
        for v in 0..5u32 {
            let record = stream.write().unwrap();
            record[..4].copy_from_slice(&v.to_le_bytes());
            record[4..].copy_from_slice(&(v * 10).to_le_bytes());
            stream.send();
        }
        stream.close().unwrap();

        assert_eq!(sums, [0, 11, 22, 33, 44]);
    }

    #[test]
    fn rejects_records_that_do_not_fit() {
        let (_sim, mut ring) = identity(2, 16);
        assert!(matches!(
            Stream::open(&mut ring, 0, 8, |_| {}),
            Err(NpuError::InvalidRecordSize { input: 0, output: 8 })
        ));
        assert!(matches!(
            Stream::open(&mut ring, 8, 32, |_| {}),
            Err(NpuError::InvalidRecordSize { input: 8, output: 32 })
        ));
    }

    #[test]
    fn open_requires_an_idle_ring() {
        let (_sim, mut ring) = identity(2, 16);
        ring.write_buf();
        ring.send_buf();
        assert!(matches!(
            Stream::open(&mut ring, 8, 8, |_| {}),
            Err(NpuError::Busy)
        ));
    }

    #[test]
    fn streams_reuse_the_ring_sequentially() {
        let (_sim, mut ring) = identity(2, 16);
        let mut total = 0;
        for _ in 0..3 {
            let mut stream = Stream::open(&mut ring, 4, 4, |_| total += 1).unwrap();
            for _ in 0..5 {
                stream.put(&[1; 4]).unwrap();
            }
            stream.close().unwrap();
        }
        assert_eq!(total, 15);
        assert!(ring.is_idle());
    }

    #[test]
    fn drop_drains() {
        let (_sim, mut ring) = identity(2, 32);
        let mut got = Vec::new();
        {
            let mut stream = Stream::open(&mut ring, 8, 8, |r| got.push(value(r))).unwrap();
            for v in 0..3u64 {
                stream.put(&v.to_le_bytes()).unwrap();
            }
        }
        assert_eq!(got, [0, 1, 2]);
        assert!(ring.is_idle());
    }

    #[test]
    #[should_panic(expected = "send without a preceding write")]
    fn send_without_write_is_fatal() {
        let (_sim, mut ring) = identity(2, 32);
        let mut stream = Stream::open(&mut ring, 8, 8, |_| {}).unwrap();
        stream.send();
    }

    #[test]
    #[should_panic(expected = "stream record of 3 bytes, expected 8")]
    fn put_checks_record_length() {
        let (_sim, mut ring) = identity(2, 32);
        let mut stream = Stream::open(&mut ring, 8, 8, |_| {}).unwrap();
        stream.put(&[0; 3]).unwrap();
    }
}

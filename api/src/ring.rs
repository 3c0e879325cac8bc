//! Buffer ring over the NPU window.
//!
//! Each slot moves through `Empty -> Writing -> Submitted -> Ready -> Empty`.
//! The driver owns every transition except `Submitted -> Ready`, which the
//! accelerator performs by setting the slot's ready flag.
//!
//! Writing and reading use independent cursors so the CPU can fill the next
//! slot while the accelerator still works on a previous one:
//!
//! ```ignore
//! // try-write
//! if ring.can_write() {
//!     ring.write_buf()[..4].copy_from_slice(&data);
//!     ring.send_buf();
//! }
//!
//! // blocking read
//! ring.block();
//! consume(ring.read_buf());
//! ring.consume_buf();
//! ```
//!
//! Calling an operation whose precondition does not hold means the caller
//! and the hardware disagree about the slot. That panics.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{Ordering, fence};

use bitflags::bitflags;
use snnap_core::{NpuError, NpuPlatform, NpuResult, NpuWindow, WaitPolicy, WindowConfig};

bitflags! {
    /// Driver-side slot flags. Output readiness lives in the window.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlotFlags: u8 {
        /// The slot's input is taken by the writer.
        const INPUT_FULL = 1 << 0;
        /// The accelerator has been invoked on the slot.
        const INVOKED = 1 << 1;
    }
}

/// Slot state as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free for the next write.
    Empty,
    /// Input is being written.
    Writing,
    /// Submitted, output not ready yet.
    Submitted,
    /// Output ready to be read.
    Ready,
}

/// Ring counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Slots handed to the accelerator.
    pub submitted: u64,
    /// Slots consumed after completion.
    pub consumed: u64,
}

/// N-way ring of input/output slot pairs.
pub struct BufferRing<P> {
    window: NpuWindow,
    platform: P,
    flags: Vec<SlotFlags>,
    write_cursor: usize,
    read_cursor: usize,
    wait: WaitPolicy,
    stats: RingStats,
}

impl<P: NpuPlatform> BufferRing<P> {
    /// Create a ring over `window` and reset every slot.
    pub fn new(window: NpuWindow, platform: P, wait: WaitPolicy) -> Self {
        let slot_count = window.slot_count();
        let mut ring = Self {
            window,
            platform,
            flags: vec![SlotFlags::empty(); slot_count],
            write_cursor: 0,
            read_cursor: 0,
            wait,
            stats: RingStats::default(),
        };
        ring.init();
        ring
    }

    /// Create a ring straight from a window configuration.
    ///
    /// # Safety
    /// See [`NpuWindow::new`].
    pub unsafe fn from_config(config: &WindowConfig, platform: P) -> NpuResult<Self> {
        let window = unsafe { NpuWindow::new(config)? };
        Ok(Self::new(window, platform, config.wait))
    }

    /// Reset cursors and flags, and clear every ready flag in the window.
    pub fn init(&mut self) {
        self.platform.reset();
        self.write_cursor = 0;
        self.read_cursor = 0;
        for (n, flags) in self.flags.iter_mut().enumerate() {
            *flags = SlotFlags::empty();
            self.window.set_ready(n, false);
        }
        self.platform.fence();

        info!(
            "NPU ring initialized: {} slots of {} bytes",
            self.window.slot_count(),
            self.window.slot_size()
        );
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.window.slot_count()
    }

    /// Bytes per slot.
    pub fn slot_size(&self) -> usize {
        self.window.slot_size()
    }

    /// Slot the next write goes to.
    pub fn write_cursor(&self) -> usize {
        self.write_cursor
    }

    /// Slot the next read comes from.
    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    /// Ring counters.
    pub fn stats(&self) -> RingStats {
        self.stats
    }

    /// The platform the ring signals through.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Current wait policy.
    pub fn wait_policy(&self) -> WaitPolicy {
        self.wait
    }

    /// Change how `wait_ready` waits.
    pub fn set_wait_policy(&mut self, wait: WaitPolicy) {
        self.wait = wait;
    }

    /// State of slot `n`.
    pub fn slot_state(&self, n: usize) -> SlotState {
        let flags = self.flags[n];
        if !flags.contains(SlotFlags::INPUT_FULL) {
            SlotState::Empty
        } else if !flags.contains(SlotFlags::INVOKED) {
            SlotState::Writing
        } else if self.window.is_ready(n) {
            SlotState::Ready
        } else {
            SlotState::Submitted
        }
    }

    /// Number of slots not yet consumed.
    pub fn outstanding(&self) -> usize {
        self.flags
            .iter()
            .filter(|f| f.contains(SlotFlags::INPUT_FULL))
            .count()
    }

    /// Whether every slot is empty.
    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    fn advance(&self, n: usize) -> usize {
        (n + 1) % self.window.slot_count()
    }

    /// Whether `write_buf` may be called.
    ///
    /// Only false once the writer came around the ring to a slot that was
    /// submitted but not consumed yet.
    pub fn can_write(&self) -> bool {
        !self.flags[self.write_cursor].contains(SlotFlags::INPUT_FULL)
    }

    /// Take the slot at the write cursor and return its input buffer.
    ///
    /// Precondition: `can_write()`.
    pub fn write_buf(&mut self) -> &mut [u8] {
        let n = self.write_cursor;
        assert!(
            self.can_write(),
            "npu: write_buf on slot {n} in state {:?}",
            self.slot_state(n)
        );
        self.flags[n] = SlotFlags::INPUT_FULL;
        trace!("npu: slot {n} writing");
        // SAFETY: the slot is ours until `send_buf`, and the returned borrow
        // ends before `send_buf` can run.
        unsafe { self.window.input_mut(n) }
    }

    /// Borrow the input buffer of the slot being written again.
    ///
    /// Precondition: the slot at the write cursor is `Writing`.
    pub fn writing_buf(&mut self) -> &mut [u8] {
        let n = self.write_cursor;
        assert!(
            self.flags[n] == SlotFlags::INPUT_FULL,
            "npu: writing_buf on slot {n} in state {:?}",
            self.slot_state(n)
        );
        // SAFETY: as in `write_buf`
        unsafe { self.window.input_mut(n) }
    }

    /// Hand the slot at the write cursor to the accelerator and move on.
    ///
    /// Precondition: the slot is `Writing`.
    pub fn send_buf(&mut self) {
        let n = self.write_cursor;
        assert!(
            self.flags[n] == SlotFlags::INPUT_FULL,
            "npu: send_buf on slot {n} in state {:?}",
            self.slot_state(n)
        );
        self.flags[n].insert(SlotFlags::INVOKED);

        // The accelerator must never see the invocation before the input.
        self.platform.fence();
        self.platform.notify();

        self.write_cursor = self.advance(n);
        self.stats.submitted += 1;
        trace!("npu: slot {n} submitted");
    }

    /// Give back a slot that was written but never submitted.
    ///
    /// Precondition: the slot at the write cursor is `Writing`.
    pub fn abandon_buf(&mut self) {
        let n = self.write_cursor;
        assert!(
            self.flags[n] == SlotFlags::INPUT_FULL,
            "npu: abandon_buf on slot {n} in state {:?}",
            self.slot_state(n)
        );
        self.flags[n] = SlotFlags::empty();
        trace!("npu: slot {n} abandoned");
    }

    /// Whether the slot at the read cursor has output ready.
    pub fn can_read(&self) -> bool {
        let n = self.read_cursor;
        if self.flags[n].contains(SlotFlags::INVOKED) && self.window.is_ready(n) {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    /// Output buffer of the slot at the read cursor.
    ///
    /// Precondition: `can_read()`.
    pub fn read_buf(&self) -> &[u8] {
        let n = self.read_cursor;
        assert!(
            self.can_read(),
            "npu: read_buf on slot {n} in state {:?}",
            self.slot_state(n)
        );
        // SAFETY: the accelerator is done with a ready slot
        unsafe { self.window.output(n) }
    }

    /// Free the slot at the read cursor and move on.
    ///
    /// Precondition: the slot is `Ready`.
    pub fn consume_buf(&mut self) {
        let n = self.read_cursor;
        assert!(
            self.slot_state(n) == SlotState::Ready,
            "npu: consume_buf on slot {n} in state {:?}",
            self.slot_state(n)
        );
        self.window.set_ready(n, false);
        self.flags[n] = SlotFlags::empty();
        self.read_cursor = self.advance(n);
        self.stats.consumed += 1;
        trace!("npu: slot {n} consumed");
    }

    fn expect_outstanding(&self, op: &str) -> usize {
        let n = self.read_cursor;
        assert!(
            self.flags[n].contains(SlotFlags::INPUT_FULL | SlotFlags::INVOKED),
            "npu: {op} on slot {n} in state {:?}",
            self.slot_state(n)
        );
        n
    }

    /// Wait until the slot at the read cursor is ready.
    ///
    /// Precondition: the slot is `Submitted` or `Ready`. Waits forever on a
    /// wedged accelerator; see [`BufferRing::block_timeout`].
    pub fn block(&self) {
        let n = self.expect_outstanding("block");
        while !self.window.is_ready(n) {
            self.platform.wait_for_notify();
        }
        fence(Ordering::Acquire);
    }

    /// Like [`BufferRing::block`], giving up after `max_waits` waits.
    pub fn block_timeout(&self, max_waits: u64) -> NpuResult<()> {
        let n = self.expect_outstanding("block_timeout");
        let mut waits = 0;
        while !self.window.is_ready(n) {
            if waits == max_waits {
                warn!("npu: slot {n} not ready after {waits} waits");
                return Err(NpuError::Timeout { slot: n });
            }
            self.platform.wait_for_notify();
            waits += 1;
        }
        fence(Ordering::Acquire);
        Ok(())
    }

    /// Wait for the slot at the read cursor according to the wait policy.
    pub fn wait_ready(&self) -> NpuResult<()> {
        match self.wait {
            WaitPolicy::Forever => {
                self.block();
                Ok(())
            }
            WaitPolicy::Polls(max_waits) => self.block_timeout(max_waits),
        }
    }
}

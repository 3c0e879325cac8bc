//! Simulated accelerator.
//!
//! Owns heap memory laid out exactly like the hardware window and plays the
//! accelerator's part of the protocol: every doorbell invokes the transform
//! on the next submitted slot, in ring order, then sets its ready flag.
//!
//! By default the simulator makes progress inside `wait_for_notify`, i.e.
//! whenever the driver parks. [`SimAccelerator::spawn`] runs it on its own
//! thread instead, as a real peer execution unit.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering, fence};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use event_listener::{Event, Listener};
use memory_addr::{VirtAddr, VirtAddrRange};
use snnap_core::{NpuPlatform, NpuResult, NpuWindow, ReadyFlag, WaitPolicy, WindowConfig};
use spin::Mutex;

use crate::ring::BufferRing;

/// What the accelerator computes: input slot to output slot.
pub type Transform = Box<dyn Fn(&[u8], &mut [u8]) + Send + Sync>;

/// Longest a parked waiter sleeps before re-checking on its own.
const PARK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct SimState {
    /// Doorbells rung but not serviced yet.
    doorbells: usize,
    /// Slot the next doorbell applies to.
    next_slot: usize,
    /// Upcoming service attempts that make no progress.
    stall: usize,
    wedged: bool,
    /// A fence happened since the last doorbell.
    fenced: bool,
    fences: u64,
    waits: u64,
    invocations: u64,
    unfenced_doorbells: u64,
}

/// Heap-backed accelerator implementing [`NpuPlatform`].
pub struct SimAccelerator {
    config: WindowConfig,
    window: NpuWindow,
    ibuf: NonNull<[u8]>,
    obuf: NonNull<[u8]>,
    transform: Transform,
    state: Mutex<SimState>,
    threaded: AtomicBool,
    shutdown: AtomicBool,
    doorbell: Event,
    completion: Event,
}

// SAFETY: the buffers are only reached through `window`, whose slots are
// partitioned between driver and accelerator by the ring protocol.
unsafe impl Send for SimAccelerator {}
unsafe impl Sync for SimAccelerator {}

fn alloc_region(len: usize) -> (NonNull<[u8]>, VirtAddrRange) {
    let region = NonNull::from(Box::leak(vec![0u8; len].into_boxed_slice()));
    let start = VirtAddr::from_usize(region.as_ptr() as *mut u8 as usize);
    (region, VirtAddrRange::from_start_size(start, len))
}

/// # Safety
/// `region` must come from `alloc_region` and be unused.
unsafe fn free_region(region: NonNull<[u8]>) {
    drop(unsafe { Box::from_raw(region.as_ptr()) });
}

impl SimAccelerator {
    /// Create an accelerator with `slot_count` slots of `slot_size` bytes.
    pub fn new(
        slot_count: usize,
        slot_size: usize,
        ready_flag: ReadyFlag,
        transform: impl Fn(&[u8], &mut [u8]) + Send + Sync + 'static,
    ) -> NpuResult<Arc<Self>> {
        let mut config = WindowConfig {
            input: VirtAddrRange::from_start_size(VirtAddr::from_usize(0), 0),
            output: VirtAddrRange::from_start_size(VirtAddr::from_usize(0), 0),
            slot_count,
            slot_size,
            ready_flag,
            wait: WaitPolicy::Forever,
        };
        let (input_bytes, output_bytes) = config.required_bytes()?;
        let (ibuf, input) = alloc_region(input_bytes);
        let (obuf, output) = alloc_region(output_bytes);
        config.input = input;
        config.output = output;

        // SAFETY: the regions are fresh and owned by the simulator
        let window = match unsafe { NpuWindow::new(&config) } {
            Ok(window) => window,
            Err(e) => {
                unsafe {
                    free_region(ibuf);
                    free_region(obuf);
                }
                return Err(e);
            }
        };

        let sim = Self {
            config,
            window,
            ibuf,
            obuf,
            transform: Box::new(transform),
            state: Mutex::new(SimState::default()),
            threaded: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            doorbell: Event::new(),
            completion: Event::new(),
        };
        Ok(Arc::new(sim))
    }

    /// An accelerator that copies input to output unchanged.
    pub fn identity(slot_count: usize, slot_size: usize) -> NpuResult<Arc<Self>> {
        Self::new(slot_count, slot_size, ReadyFlag::Dedicated, |input, output| {
            output.copy_from_slice(input)
        })
    }

    /// Window configuration pointing at the simulator's memory.
    pub fn config(&self) -> WindowConfig {
        self.config
    }

    /// Build the driver ring over this accelerator.
    pub fn ring(self: &Arc<Self>) -> NpuResult<BufferRing<Arc<Self>>> {
        // SAFETY: the memory lives as long as the Arc the ring holds
        unsafe { BufferRing::from_config(&self.config, self.clone()) }
    }

    /// Service one pending doorbell. Returns whether a slot completed.
    fn step(&self) -> bool {
        let mut state = self.state.lock();
        if state.wedged {
            return false;
        }
        if state.stall > 0 {
            state.stall -= 1;
            return false;
        }
        if state.doorbells == 0 {
            return false;
        }

        let n = state.next_slot;
        // SAFETY: slot `n` is submitted and not ready, so the driver keeps
        // its hands off both halves
        let (input, output) = unsafe { (self.window.input(n), self.window.output_mut(n)) };
        (self.transform)(input, output);
        fence(Ordering::Release);
        self.window.set_ready(n, true);

        state.doorbells -= 1;
        state.next_slot = (n + 1) % self.config.slot_count;
        state.invocations += 1;
        trace!("sim: slot {n} done");
        true
    }

    /// Service every pending doorbell. Returns how many slots completed.
    pub fn run_pending(&self) -> usize {
        let mut done = 0;
        while self.step() {
            done += 1;
        }
        done
    }

    /// Make the next `waits` service attempts a no-op.
    pub fn stall(&self, waits: usize) {
        self.state.lock().stall = waits;
    }

    /// Stop making progress until [`SimAccelerator::unwedge`].
    pub fn wedge(&self) {
        self.state.lock().wedged = true;
    }

    /// Resume after [`SimAccelerator::wedge`].
    pub fn unwedge(&self) {
        self.state.lock().wedged = false;
        self.doorbell.notify(usize::MAX);
    }

    /// Doorbells not serviced yet.
    pub fn pending(&self) -> usize {
        self.state.lock().doorbells
    }

    /// Slots completed so far.
    pub fn invocations(&self) -> u64 {
        self.state.lock().invocations
    }

    /// Fences issued by the driver.
    pub fn fences(&self) -> u64 {
        self.state.lock().fences
    }

    /// `wait_for_notify` calls made by the driver.
    pub fn waits(&self) -> u64 {
        self.state.lock().waits
    }

    /// Doorbells rung without a fence since the previous one.
    pub fn unfenced_doorbells(&self) -> u64 {
        self.state.lock().unfenced_doorbells
    }

    /// Whether slot `n`'s ready flag is set.
    pub fn is_ready(&self, n: usize) -> bool {
        self.window.is_ready(n)
    }

    /// Run the accelerator on its own thread until [`SimAccelerator::shutdown`].
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        self.threaded.store(true, Ordering::Release);
        let sim = self.clone();
        thread::spawn(move || sim.serve())
    }

    fn serve(&self) {
        debug!("sim: accelerator thread running");
        loop {
            let listener = self.doorbell.listen();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if self.step() {
                self.completion.notify(usize::MAX);
                continue;
            }
            // Stalls make no progress without a new doorbell, so bound the sleep
            let _ = listener.wait_timeout(PARK_INTERVAL);
        }
        debug!("sim: accelerator thread stopped");
    }

    /// Stop the thread started by [`SimAccelerator::spawn`].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.doorbell.notify(usize::MAX);
    }
}

impl NpuPlatform for SimAccelerator {
    fn fence(&self) {
        fence(Ordering::SeqCst);
        let mut state = self.state.lock();
        state.fences += 1;
        state.fenced = true;
    }

    fn notify(&self) {
        {
            let mut state = self.state.lock();
            if !state.fenced {
                state.unfenced_doorbells += 1;
            }
            state.fenced = false;
            state.doorbells += 1;
        }
        self.doorbell.notify(1);
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.doorbells = 0;
        state.next_slot = 0;
    }

    fn wait_for_notify(&self) {
        if self.threaded.load(Ordering::Acquire) {
            let listener = self.completion.listen();
            let _ = listener.wait_timeout(PARK_INTERVAL);
            self.state.lock().waits += 1;
        } else {
            self.state.lock().waits += 1;
            self.step();
        }
    }
}

impl Drop for SimAccelerator {
    fn drop(&mut self) {
        // SAFETY: the last Arc is gone, so no ring uses the regions
        unsafe {
            free_region(self.ibuf);
            free_region(self.obuf);
        }
    }
}

#[cfg(test)]
mod tests {
    use snnap_core::NpuError;

    use super::*;

    #[test]
    fn doorbells_are_serviced_in_ring_order() {
        let sim = SimAccelerator::identity(3, 4).unwrap();
        let mut ring = sim.ring().unwrap();
        for v in 1..=3u8 {
            ring.write_buf().fill(v);
            ring.send_buf();
        }
        assert_eq!(sim.pending(), 3);
        assert_eq!(sim.run_pending(), 3);
        for v in 1..=3u8 {
            assert_eq!(ring.read_buf(), &[v; 4]);
            ring.consume_buf();
        }
    }

    #[test]
    fn wedged_accelerator_makes_no_progress() {
        let sim = SimAccelerator::identity(2, 4).unwrap();
        let mut ring = sim.ring().unwrap();
        ring.write_buf();
        ring.send_buf();
        sim.wedge();
        assert_eq!(sim.run_pending(), 0);
        assert!(!ring.can_read());
        sim.unwedge();
        assert_eq!(sim.run_pending(), 1);
        assert!(ring.can_read());
    }

    #[test]
    fn config_points_at_owned_memory() {
        let sim = SimAccelerator::identity(2, 16).unwrap();
        let config = sim.config();
        assert_eq!(config.input.size(), 32);
        assert_eq!(config.output.size(), 34);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_layout() {
        assert!(SimAccelerator::identity(0, 16).is_err());
        let legacy = ReadyFlag::DataByte { offset: 4 };
        assert!(SimAccelerator::new(2, 4, legacy, |_, _| {}).is_err());
    }

    #[test]
    fn oversized_layout_fails_before_allocating() {
        assert_eq!(
            SimAccelerator::identity(2, usize::MAX).err(),
            Some(NpuError::InvalidConfig("slot layout overflows"))
        );
    }
}

//! Driver side of the SNNAP NPU: the buffer ring and the record stream on
//! top of it.
//!
//! With the `sim` feature (on by default) the crate also carries a simulated
//! accelerator that lays out heap memory like the board window, which is how
//! the ring and stream are exercised off target.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

pub mod ring;
#[cfg(feature = "sim")]
pub mod sim;
pub mod stream;

pub use ring::{BufferRing, RingStats, SlotFlags, SlotState};
#[cfg(feature = "sim")]
pub use sim::SimAccelerator;
pub use snnap_core::{
    BoardPlatform, NpuError, NpuPlatform, NpuResult, NpuWindow, ReadyFlag, WaitPolicy,
    WindowConfig,
};
pub use stream::{CloseError, Stream};

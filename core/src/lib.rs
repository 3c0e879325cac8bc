//! Hardware side of the SNNAP NPU driver.
//!
//! The accelerator shares a fixed memory window with the CPU: an input
//! region and an output region, each split into a few equal-size slots.
//! This crate describes that window ([`WindowConfig`], [`NpuWindow`]) and
//! the CPU primitives used to hand work over ([`NpuPlatform`]). The slot
//! state machine built on top lives in `snnap-api`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod platform;
pub mod window;

pub use config::{ReadyFlag, WaitPolicy, WindowConfig};
pub use error::{NpuError, NpuResult};
pub use platform::{BoardPlatform, NpuPlatform};
pub use window::NpuWindow;

//! SNNAP NPU driver.
//!
//! The board has exactly one buffer window, so the ring driving it is a
//! process-wide device set up once by [`init`]. Everything else is
//! re-exported from `snnap-core` and `snnap-api`.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

pub use memory_addr::{VirtAddr, VirtAddrRange};
pub use snnap_api::{BufferRing, CloseError, RingStats, SlotFlags, SlotState, Stream};
#[cfg(feature = "sim")]
pub use snnap_api::SimAccelerator;
pub use snnap_core::{
    BoardPlatform, NpuError, NpuPlatform, NpuResult, NpuWindow, ReadyFlag, WaitPolicy,
    WindowConfig, config,
};

use spin::{Mutex, Once};

/// The board ring, locked for exclusive use.
pub type NpuDevice = Mutex<BufferRing<BoardPlatform>>;

static NPU_DEVICE: Once<NpuDevice> = Once::new();

/// Set up the device over the board window described by `config`.
///
/// # Safety
/// The window must be mapped uncached (or otherwise coherent with the
/// accelerator) and used by nothing but the accelerator afterwards.
pub unsafe fn init(config: WindowConfig) -> NpuResult<&'static NpuDevice> {
    let mut created = false;
    let device = NPU_DEVICE.try_call_once(|| {
        created = true;
        // SAFETY: forwarded to the caller
        unsafe { BufferRing::from_config(&config, BoardPlatform) }.map(Mutex::new)
    })?;
    if !created {
        warn!("npu: device already initialized");
        return Err(NpuError::AlreadyInitialized);
    }
    info!(
        "npu: device ready at ibuf={:#x} obuf={:#x}",
        config.input.start.as_usize(),
        config.output.start.as_usize()
    );
    Ok(device)
}

/// The device, if [`init`] succeeded.
pub fn npu_device() -> Option<&'static NpuDevice> {
    NPU_DEVICE.get()
}

/// Run `f` with the device locked.
pub fn with_npu<R>(f: impl FnOnce(&mut BufferRing<BoardPlatform>) -> R) -> NpuResult<R> {
    let device = npu_device().ok_or(NpuError::NotInitialized)?;
    Ok(f(&mut device.lock()))
}

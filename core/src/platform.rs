//! Platform capabilities the ring needs from the CPU.
//!
//! The accelerator raises no interrupt. The driver orders its stores with
//! [`NpuPlatform::fence`], rings the accelerator with
//! [`NpuPlatform::notify`] and parks in [`NpuPlatform::wait_for_notify`]
//! between polls of the ready flag.

use alloc::sync::Arc;
use core::sync::atomic::{Ordering, fence};

/// CPU-side synchronization with the accelerator.
pub trait NpuPlatform {
    /// Make every prior store to the window visible to the accelerator.
    fn fence(&self);

    /// Tell the accelerator new input was submitted.
    fn notify(&self);

    /// Park until the accelerator might have made progress.
    ///
    /// May return spuriously. Callers always re-check the ready flag.
    fn wait_for_notify(&self);

    /// Called when the ring drops every slot and restarts from slot 0.
    ///
    /// Hardware with no per-slot memory of its own has nothing to do here.
    fn reset(&self) {}
}

impl<P: NpuPlatform + ?Sized> NpuPlatform for &P {
    fn fence(&self) {
        (**self).fence()
    }

    fn notify(&self) {
        (**self).notify()
    }

    fn wait_for_notify(&self) {
        (**self).wait_for_notify()
    }

    fn reset(&self) {
        (**self).reset()
    }
}

impl<P: NpuPlatform + ?Sized> NpuPlatform for Arc<P> {
    fn fence(&self) {
        (**self).fence()
    }

    fn notify(&self) {
        (**self).notify()
    }

    fn wait_for_notify(&self) {
        (**self).wait_for_notify()
    }

    fn reset(&self) {
        (**self).reset()
    }
}

/// 加速器所在 SoC 的平台操作
///
/// ARM 上使用 `dsb`/`sev`/`wfe`，加速器与 CPU 共享事件总线。
/// 其他架构上等待退化为 spin-loop 提示。
#[derive(Debug, Default, Clone, Copy)]
pub struct BoardPlatform;

impl NpuPlatform for BoardPlatform {
    #[inline]
    fn fence(&self) {
        fence(Ordering::SeqCst);
        cfg_if::cfg_if! {
            if #[cfg(any(target_arch = "arm", target_arch = "aarch64"))] {
                // 数据同步屏障
                unsafe { core::arch::asm!("dsb sy", options(nostack, preserves_flags)) };
            } else if #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))] {
                unsafe { core::arch::asm!("fence iorw, iorw", options(nostack)) };
            }
        }
    }

    #[inline]
    fn notify(&self) {
        cfg_if::cfg_if! {
            if #[cfg(any(target_arch = "arm", target_arch = "aarch64"))] {
                // 发送事件
                unsafe { core::arch::asm!("sev", options(nomem, nostack, preserves_flags)) };
            }
        }
    }

    #[inline]
    fn wait_for_notify(&self) {
        cfg_if::cfg_if! {
            if #[cfg(any(target_arch = "arm", target_arch = "aarch64"))] {
                // 等待事件，由加速器或任意 `sev` 唤醒
                unsafe { core::arch::asm!("wfe", options(nomem, nostack, preserves_flags)) };
            } else {
                core::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;

    #[derive(Default)]
    struct Counting {
        fences: Cell<u32>,
        notifies: Cell<u32>,
        waits: Cell<u32>,
        resets: Cell<u32>,
    }

    impl NpuPlatform for Counting {
        fn fence(&self) {
            self.fences.set(self.fences.get() + 1);
        }

        fn notify(&self) {
            self.notifies.set(self.notifies.get() + 1);
        }

        fn wait_for_notify(&self) {
            self.waits.set(self.waits.get() + 1);
        }

        fn reset(&self) {
            self.resets.set(self.resets.get() + 1);
        }
    }

    fn ring_once(p: impl NpuPlatform) {
        p.fence();
        p.notify();
        p.wait_for_notify();
        p.reset();
    }

    #[test]
    fn forwarding_impls_reach_the_platform() {
        let counting = Counting::default();
        ring_once(&counting);
        ring_once(&&counting);
        assert_eq!(counting.fences.get(), 2);
        assert_eq!(counting.notifies.get(), 2);
        assert_eq!(counting.waits.get(), 2);
        assert_eq!(counting.resets.get(), 2);
    }

    #[test]
    fn board_platform_runs_on_host() {
        ring_once(BoardPlatform);
        ring_once(Arc::new(BoardPlatform));
    }
}

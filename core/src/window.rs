//! 与加速器共享的缓冲区窗口
//!
//! ```text
//! input window                      output window
//! ┌──────────┬──────────┬───┐       ┌──────────┬──────────┬───┬───┬───┐
//! │  slot 0  │  slot 1  │...│       │  slot 0  │  slot 1  │...│ f0│ f1│...
//! └──────────┴──────────┴───┘       └──────────┴──────────┴───┴───┴───┘
//!                                   (f = 独立 ready 标志字节)
//! ```

use core::ptr::{read_volatile, write_volatile};
use core::slice;

use crate::config::{ReadyFlag, WindowConfig};
use crate::error::NpuResult;

/// 加速器填充 slot 之前的标志值
pub const FLAG_NOT_READY: u8 = 0;

/// 输出完成后加速器写入的标志值
pub const FLAG_READY: u8 = 1;

/// 窗口上的 slot 寻址和 ready 标志访问
pub struct NpuWindow {
    ibuf: *mut u8,
    obuf: *mut u8,
    slot_count: usize,
    slot_size: usize,
    ready_flag: ReadyFlag,
}

// SAFETY: 窗口是与设备共享的普通内存，独占访问由 ring 的持有者保证
unsafe impl Sync for NpuWindow {}
unsafe impl Send for NpuWindow {}

impl NpuWindow {
    /// 按校验过的配置创建窗口
    ///
    /// # Safety
    /// 两个窗口在 `WindowConfig::required_bytes` 给出的范围内
    /// 必须已映射且可读写，窗口存活期间除加速器外不得有其他访问者
    pub unsafe fn new(config: &WindowConfig) -> NpuResult<Self> {
        config.validate()?;
        debug!(
            "NPU window: ibuf={:#x}, obuf={:#x}, slots={}x{}, flag={:?}",
            config.input.start.as_usize(),
            config.output.start.as_usize(),
            config.slot_count,
            config.slot_size,
            config.ready_flag
        );
        Ok(Self {
            ibuf: config.input.start.as_mut_ptr(),
            obuf: config.output.start.as_mut_ptr(),
            slot_count: config.slot_count,
            slot_size: config.slot_size,
            ready_flag: config.ready_flag,
        })
    }

    /// slot 数量
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// 每个 slot 的字节数
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// ready 标志位置
    pub fn ready_flag(&self) -> ReadyFlag {
        self.ready_flag
    }

    /// 输入 slot `n` 的起始地址
    #[inline]
    pub fn ibuf(&self, n: usize) -> *mut u8 {
        assert!(n < self.slot_count, "input slot {n} out of range");
        self.ibuf.wrapping_add(self.slot_size * n)
    }

    /// 输出 slot `n` 的起始地址
    #[inline]
    pub fn obuf(&self, n: usize) -> *mut u8 {
        assert!(n < self.slot_count, "output slot {n} out of range");
        self.obuf.wrapping_add(self.slot_size * n)
    }

    fn obf(&self, n: usize) -> *mut u8 {
        match self.ready_flag {
            ReadyFlag::Dedicated => {
                assert!(n < self.slot_count, "ready flag {n} out of range");
                self.obuf.wrapping_add(self.slot_size * self.slot_count + n)
            }
            ReadyFlag::DataByte { offset } => self.obuf(n).wrapping_add(offset),
        }
    }

    /// 加速器是否已将 slot `n` 标记为就绪
    #[inline]
    pub fn is_ready(&self, n: usize) -> bool {
        // SAFETY: 由 `new` 的约定保证在输出窗口范围内
        unsafe { read_volatile(self.obf(n)) != FLAG_NOT_READY }
    }

    /// 写 slot `n` 的 ready 标志
    ///
    /// 驱动只负责清除，置位由加速器完成
    #[inline]
    pub fn set_ready(&self, n: usize, ready: bool) {
        let value = if ready { FLAG_READY } else { FLAG_NOT_READY };
        // SAFETY: 由 `new` 的约定保证在输出窗口范围内
        unsafe { write_volatile(self.obf(n), value) }
    }

    /// 输入 slot `n` 的可变切片
    ///
    /// # Safety
    /// 调用者必须独占该 slot: 加速器不会读取它，且不存在其他引用
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn input_mut(&self, n: usize) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ibuf(n), self.slot_size) }
    }

    /// 输入 slot `n` 的只读切片
    ///
    /// # Safety
    /// 不能存在该 slot 的可变引用
    pub unsafe fn input(&self, n: usize) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ibuf(n), self.slot_size) }
    }

    /// 输出 slot `n` 的只读切片
    ///
    /// # Safety
    /// 加速器必须已写完该 slot
    pub unsafe fn output(&self, n: usize) -> &[u8] {
        unsafe { slice::from_raw_parts(self.obuf(n), self.slot_size) }
    }

    /// 输出 slot `n` 的可变切片
    ///
    /// # Safety
    /// 仅供加速器一侧使用，且该 slot 已被调用、驱动尚未看到就绪
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn output_mut(&self, n: usize) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.obuf(n), self.slot_size) }
    }
}

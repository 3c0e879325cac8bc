//! NPU 缓冲区窗口配置
//!
//! 由板级初始化提供一次，ring 存活期间不再改变

use memory_addr::{VirtAddr, VirtAddrRange};

use crate::error::{NpuError, NpuResult};

// ============ 原始开发板布局 ============

/// 输入窗口基地址
pub const BOARD_INPUT_BASE: usize = 0xFFFF_0000;

/// 输出窗口基地址
pub const BOARD_OUTPUT_BASE: usize = 0xFFFF_8000;

/// 每个窗口的大小
pub const BOARD_WINDOW_SIZE: usize = 0x8000;

/// 输入/输出 slot 数量
pub const DEFAULT_SLOT_COUNT: usize = 2;

/// 每个 slot 的字节数
pub const DEFAULT_SLOT_SIZE: usize = 4096;

/// 旧版硬件复用为 ready 标志的输出字节
pub const LEGACY_READY_BYTE: usize = 3;

/// 加速器发布 slot "输出就绪" 的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyFlag {
    /// 每个 slot 一个独立标志字节，位于输出窗口最后一个 slot 之后
    Dedicated,
    /// 输出 slot 的第 `offset` 字节兼作标志。
    /// 该位置真实输出为 0 时会被读成 "未就绪"。
    DataByte {
        /// 标志在输出 slot 内的偏移
        offset: usize,
    },
}

/// ring 等待加速器的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// 一直等到 slot 就绪
    Forever,
    /// 等待这么多次仍未就绪则返回 [`NpuError::Timeout`]
    Polls(u64),
}

/// 共享缓冲区窗口布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// CPU 写入输入的区域
    pub input: VirtAddrRange,
    /// 加速器写入输出的区域
    pub output: VirtAddrRange,
    /// 每个区域的 slot 数量
    pub slot_count: usize,
    /// 每个 slot 的字节数 (输入输出相同)
    pub slot_size: usize,
    /// ready 标志位置
    pub ready_flag: ReadyFlag,
    /// `BufferRing::wait_ready` 使用的等待策略
    pub wait: WaitPolicy,
}

impl WindowConfig {
    /// 原始开发板布局，使用独立 ready 标志
    pub fn board_default() -> Self {
        Self {
            input: VirtAddrRange::from_start_size(
                VirtAddr::from_usize(BOARD_INPUT_BASE),
                BOARD_WINDOW_SIZE,
            ),
            output: VirtAddrRange::from_start_size(
                VirtAddr::from_usize(BOARD_OUTPUT_BASE),
                BOARD_WINDOW_SIZE,
            ),
            slot_count: DEFAULT_SLOT_COUNT,
            slot_size: DEFAULT_SLOT_SIZE,
            ready_flag: ReadyFlag::Dedicated,
            wait: WaitPolicy::Forever,
        }
    }

    /// 与原始开发板完全一致，ready 标志为第 4 个输出字节
    pub fn legacy_board() -> Self {
        Self {
            ready_flag: ReadyFlag::DataByte {
                offset: LEGACY_READY_BYTE,
            },
            ..Self::board_default()
        }
    }

    /// slot 在输入/输出窗口中需要的字节数 (含 ready 标志字节)
    ///
    /// 只检查与窗口本身无关的布局参数，可在分配窗口之前调用
    pub fn required_bytes(&self) -> NpuResult<(usize, usize)> {
        if self.slot_count == 0 {
            return Err(NpuError::InvalidConfig("slot count must be non-zero"));
        }
        if self.slot_size == 0 {
            return Err(NpuError::InvalidConfig("slot size must be non-zero"));
        }
        if let ReadyFlag::DataByte { offset } = self.ready_flag {
            if offset >= self.slot_size {
                return Err(NpuError::InvalidConfig("ready byte outside output slot"));
            }
        }

        let overflow = NpuError::InvalidConfig("slot layout overflows");
        let input = self.slot_count.checked_mul(self.slot_size).ok_or(overflow)?;
        let output_slot = match self.ready_flag {
            ReadyFlag::Dedicated => self.slot_size.checked_add(1).ok_or(overflow)?,
            ReadyFlag::DataByte { .. } => self.slot_size,
        };
        let output = self.slot_count.checked_mul(output_slot).ok_or(overflow)?;
        Ok((input, output))
    }

    /// 检查布局是否可用
    pub fn validate(&self) -> NpuResult<()> {
        let (input, output) = self.required_bytes()?;
        if self.input.size() < input {
            return Err(NpuError::InvalidConfig("input window too small"));
        }
        if self.output.size() < output {
            return Err(NpuError::InvalidConfig("output window too small"));
        }
        if self.input.overlaps(self.output) {
            return Err(NpuError::InvalidConfig("input and output windows overlap"));
        }
        if let WaitPolicy::Polls(0) = self.wait {
            return Err(NpuError::InvalidConfig("poll budget must be non-zero"));
        }
        Ok(())
    }
}

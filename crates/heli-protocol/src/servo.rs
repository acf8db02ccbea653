//! 舵机切换板负载解析与构建
//!
//! 所有脉宽均为微秒，大端 16 位。

use crate::ids::{SERVO_CHANNEL_COUNT, ServoMessageId};
use crate::{Frame, ProtocolError};
use bilge::prelude::*;

/// 辅助输入周期计数的时间单位（秒）
pub const AUX_TICK_SECONDS: f64 = 32.0e-6;

/// 脉宽有效窗口（开区间：`min < w < max`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PulseWindow {
    pub min: u16,
    pub max: u16,
}

impl Default for PulseWindow {
    fn default() -> Self {
        Self {
            min: 800,
            max: 2200,
        }
    }
}

impl PulseWindow {
    pub fn contains(&self, width: u16) -> bool {
        width > self.min && width < self.max
    }
}

/// 9 路脉宽（微秒）
///
/// 索引 0 对应通道 1。启动时全部为 0（尚未收到输入）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelSet(pub [u16; SERVO_CHANNEL_COUNT]);

impl ChannelSet {
    pub const fn new(widths: [u16; SERVO_CHANNEL_COUNT]) -> Self {
        Self(widths)
    }

    /// 所有通道设为同一脉宽
    pub const fn splat(width: u16) -> Self {
        Self([width; SERVO_CHANNEL_COUNT])
    }

    /// 按 1 起始的通道号读取
    pub fn channel(&self, number: usize) -> Option<u16> {
        number.checked_sub(1).and_then(|i| self.0.get(i).copied())
    }

    pub fn as_array(&self) -> &[u16; SERVO_CHANNEL_COUNT] {
        &self.0
    }

    /// 窗口内才写入，返回是否接受；越界值保留原值
    pub fn set_checked(&mut self, index: usize, width: u16, window: &PulseWindow) -> bool {
        match self.0.get_mut(index) {
            Some(slot) if window.contains(width) => {
                *slot = width;
                true
            },
            _ => false,
        }
    }

    /// PULSE_COMMAND 负载：9 组大端脉宽
    pub fn pulse_command_payload(&self) -> [u8; SERVO_CHANNEL_COUNT * 2] {
        let mut payload = [0u8; SERVO_CHANNEL_COUNT * 2];
        for (chunk, width) in payload.chunks_exact_mut(2).zip(self.0.iter()) {
            chunk.copy_from_slice(&width.to_be_bytes());
        }
        payload
    }

    /// PULSE_COMMAND 帧（id = 20, len = 18）
    pub fn pulse_command_frame(&self) -> Frame {
        Frame::from_array(ServoMessageId::PulseCommand.into(), &self.pulse_command_payload())
    }

    /// 合并 PULSE_INPUTS 负载
    ///
    /// 线上槽位 `i`（字节 `2i..2i+2`，`i` 从 1 开始）写入通道 `i`；
    /// 通道 8 随后由槽位 0（字节 `0..2`）覆盖。每个候选值都要经过窗口
    /// 检查，被拒绝的通道保留原值。返回被接受的通道数。
    pub fn apply_pulse_inputs(
        &mut self,
        payload: &[u8],
        window: &PulseWindow,
    ) -> Result<usize, ProtocolError> {
        if payload.len() < 2 {
            return Err(ProtocolError::InvalidLength {
                expected: 2,
                actual: payload.len(),
            });
        }

        let mut accepted = 0;
        let slots = (payload.len() / 2).min(SERVO_CHANNEL_COUNT);
        for slot in 1..slots {
            let width = u16::from_be_bytes([payload[slot * 2], payload[slot * 2 + 1]]);
            if self.set_checked(slot - 1, width, window) {
                accepted += 1;
            }
        }

        // 通道 8 不在自己的槽位上
        let ch8 = u16::from_be_bytes([payload[0], payload[1]]);
        if self.set_checked(7, ch8, window) {
            accepted += 1;
        }

        Ok(accepted)
    }
}

// ============================================================================
// STATUS
// ============================================================================

/// STATUS 负载 Byte 1
///
/// - Bit 0: 保留
/// - Bit 1-2: 命令通道状态
/// - Bit 3-7: 保留
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct StatusFlags {
    pub reserved0: bool,     // Bit 0
    pub command_channel: u2, // Bit 1-2: 命令通道状态
    pub reserved1: u5,       // Bit 3-7
}

/// 命令通道（切换通道）脉宽状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandChannelState {
    /// 无信号
    Absent,
    /// 1 ms
    Short,
    /// 1.5 ms
    Medium,
    /// 2 ms
    Long,
}

impl CommandChannelState {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 2 {
            return Err(ProtocolError::InvalidLength {
                expected: 2,
                actual: payload.len(),
            });
        }

        let flags = StatusFlags::from(u8::new(payload[1]));
        Ok(match flags.command_channel().value() {
            1 => Self::Short,
            2 => Self::Medium,
            3 => Self::Long,
            _ => Self::Absent,
        })
    }

    /// 对应的驾驶模式，信号缺失时为 `None`
    pub fn pilot_mode(self) -> Option<PilotMode> {
        match self {
            Self::Absent => None,
            Self::Short => Some(PilotMode::Manual),
            Self::Medium | Self::Long => Some(PilotMode::Auto),
        }
    }
}

/// 驾驶模式（由切换板命令通道决定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum PilotMode {
    #[default]
    Unknown = 0,
    Manual = 1,
    Auto = 2,
}

impl PilotMode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Manual,
            2 => Self::Auto,
            _ => Self::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for PilotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Manual => "Manual",
            Self::Auto => "Autonomous",
        };
        f.write_str(name)
    }
}

// ============================================================================
// AUXILIARY_INPUTS
// ============================================================================

/// AUXILIARY_INPUTS 负载 Byte 2（周期计数高位）
///
/// - Bit 0-5: 周期计数高 6 位
/// - Bit 6: 保留
/// - Bit 7: 计数溢出
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct AuxPeriodHigh {
    pub period_high: u6,  // Bit 0-5
    pub reserved: bool,   // Bit 6
    pub over_range: bool, // Bit 7
}

/// 转速测量
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuxMeasurement {
    /// 周期计数（32 µs 为单位）
    pub period_ticks: u16,
    /// 转速（Hz）
    pub speed_hz: f64,
}

impl AuxMeasurement {
    /// 解析 AUXILIARY_INPUTS
    ///
    /// 溢出或零周期时返回 `Ok(None)`（整条测量丢弃，不做截断）。
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::InvalidLength {
                expected: 4,
                actual: payload.len(),
            });
        }

        let high = AuxPeriodHigh::from(u8::new(payload[2]));
        if high.over_range() {
            return Ok(None);
        }

        let period_ticks = (u16::from(high.period_high().value()) << 8) | u16::from(payload[3]);
        if period_ticks == 0 {
            return Ok(None);
        }

        Ok(Some(Self {
            period_ticks,
            speed_hz: 1.0 / (f64::from(period_ticks) * AUX_TICK_SECONDS),
        }))
    }
}

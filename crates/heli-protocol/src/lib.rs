//! # Heli Protocol
//!
//! 直升机飞控串口设备协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `codec`: 帧编解码与双字节校验和（两种方言）
//! - `sync`: 双字节同步标记状态机
//! - `ids`: 消息 ID 与描述符常量
//! - `servo`: 舵机切换板（servo switch）负载解析与构建
//! - `gx3`: 3DM-GX3 导航传感器字段解析与命令构建
//!
//! ## 字节序
//!
//! 两种设备的多字节字段均为大端字节序（MSB 在前）。

pub mod codec;
pub mod gx3;
pub mod ids;
pub mod servo;
pub mod sync;

pub use codec::{ChecksumSeed, Dialect};
pub use ids::*;
pub use servo::{ChannelSet, PilotMode, PulseWindow};
pub use sync::{MarkerSync, SyncState};

use thiserror::Error;

/// 单帧负载的最大长度（长度字段为 1 字节）
pub const MAX_PAYLOAD_LEN: usize = 255;

/// 串口帧的统一抽象
///
/// `Frame` 只保存标记之后的内容：消息 ID 与负载。同步标记和校验和属于
/// 方言（[`Dialect`]），在编码/解码时添加或校验。
///
/// - **Copy trait**：固定 255 字节缓冲，无堆分配
/// - **未使用部分为 0**：`len` 之后的字节始终为 0
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// 消息 ID（GX3 方言中为描述符集）
    pub id: u8,

    data: [u8; MAX_PAYLOAD_LEN],

    len: u8,
}

impl Frame {
    /// 创建帧，负载超过 255 字节时返回 `PayloadTooLong`
    pub fn new(id: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLong { len: payload.len() });
        }

        let mut data = [0u8; MAX_PAYLOAD_LEN];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            id,
            data,
            len: payload.len() as u8,
        })
    }

    /// 由定长数组创建，长度在编译期检查
    pub fn from_array<const N: usize>(id: u8, payload: &[u8; N]) -> Self {
        const { assert!(N <= MAX_PAYLOAD_LEN) };

        let mut data = [0u8; MAX_PAYLOAD_LEN];
        data[..N].copy_from_slice(payload);

        Self {
            id,
            data,
            len: N as u8,
        }
    }

    /// 超过 255 字节的部分被截断
    pub fn new_truncated(id: u8, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_PAYLOAD_LEN);
        let mut data = [0u8; MAX_PAYLOAD_LEN];
        data[..len].copy_from_slice(&payload[..len]);

        Self {
            id,
            data,
            len: len as u8,
        }
    }

    /// 有效负载切片
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 有效负载长度
    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.payload() == other.payload()
    }
}

impl Eq for Frame {}

/// 协议解析错误类型
///
/// 前三个变体（`ChecksumMismatch`、`Truncated`、`PayloadTooLong`）是
/// 解码阶段可能返回的错误，见 [`CodecError`]。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Checksum mismatch: expected {expected:02X?}, got {actual:02X?}")]
    ChecksumMismatch { expected: [u8; 2], actual: [u8; 2] },

    #[error("Truncated frame: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Payload too long: {len} bytes (max 255)")]
    PayloadTooLong { len: usize },

    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Malformed field at offset {offset}: length byte {len}")]
    MalformedField { offset: usize, len: u8 },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u8 },
}

/// 解码错误（`ProtocolError` 的帧级子集）
pub type CodecError = ProtocolError;

/// 大端字节序转 u16
pub fn bytes_to_u16_be(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

/// 大端字节序转 f32
pub fn bytes_to_f32_be(bytes: [u8; 4]) -> f32 {
    f32::from_be_bytes(bytes)
}

/// 大端字节序转 f64
pub fn bytes_to_f64_be(bytes: [u8; 8]) -> f64 {
    f64::from_be_bytes(bytes)
}

/// 从切片 `offset` 处读取大端 f32（调用方保证长度）
pub(crate) fn read_f32_be(data: &[u8], offset: usize) -> f32 {
    bytes_to_f32_be([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// 从切片 `offset` 处读取大端 f64（调用方保证长度）
pub(crate) fn read_f64_be(data: &[u8], offset: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    bytes_to_f64_be(bytes)
}

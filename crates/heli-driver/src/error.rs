//! 驱动层错误类型定义

use heli_protocol::ProtocolError;
use heli_serial::SerialError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 串口传输错误
    #[error("Serial transport error: {0}")]
    Serial(#[from] SerialError),

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 驱动已禁用（传输打开失败或配置关闭）
    #[error("Driver disabled: {0}")]
    Disabled(String),

    /// 订阅通道已关闭
    #[error("Event channel closed")]
    ChannelClosed,

    /// 操作超时
    #[error("Operation timeout")]
    Timeout,

    /// 无效输入
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 写入重试耗尽
    #[error("Write failed after {attempts} attempts: {reason}")]
    WriteFailed { attempts: u32, reason: String },

    /// 线程创建失败
    #[error("Failed to spawn thread: {0}")]
    Spawn(String),

    /// 配置错误
    #[error("Invalid configuration: {0}")]
    Config(String),
}

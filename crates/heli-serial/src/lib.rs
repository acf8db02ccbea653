//! # Heli Serial Transport Layer
//!
//! 串口硬件抽象层，提供统一的字节流接口。
//!
//! - `serial`: 基于 `serialport` 的真实串口
//! - `mock`: 内存中的双向通道（`mock` feature）
//!
//! 读操作在超时后返回 [`SerialError::Timeout`]，调用方借此在两次读取
//! 之间检查自己的终止标志。

use std::time::Duration;
use thiserror::Error;

pub mod serial;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use serial::{SerialRx, SerialTransport, SerialTx};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockPeer, MockTransport};

/// 串口层统一错误类型
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("Serial port error: {0}")]
    Port(#[from] serialport::Error),
    #[error("Invalid serial configuration: {0}")]
    Config(String),
    #[error("Read timeout")]
    Timeout,
    #[error("Transport disconnected")]
    Disconnected,
}

impl SerialError {
    /// 超时之外的错误都会让读循环退出
    pub fn is_timeout(&self) -> bool {
        matches!(self, SerialError::Timeout)
    }
}

/// 接收半部
pub trait RxTransport: Send {
    /// 读取至少 1 个字节；读超时内没有数据时返回 `Err(Timeout)`
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError>;
}

/// 发送半部
pub trait TxTransport: Send {
    /// 写入全部字节
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError>;
}

/// 完整的双向传输
pub trait Transport: RxTransport + TxTransport {}

impl<T: RxTransport + TxTransport> Transport for T {}

/// 可拆分为独立收发半部的传输（每个设备一个收线程、一个发线程）
pub trait SplittableTransport: Transport {
    type Rx: RxTransport + 'static;
    type Tx: TxTransport + 'static;

    fn split(self) -> Result<(Self::Rx, Self::Tx), SerialError>;
}

/// 数据位/校验/停止位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameFormat {
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "8N1"))]
    EightNoneOne,
    #[cfg_attr(feature = "serde", serde(rename = "7E1"))]
    SevenEvenOne,
    #[cfg_attr(feature = "serde", serde(rename = "7O1"))]
    SevenOddOne,
}

impl std::str::FromStr for FrameFormat {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "8N1" => Ok(FrameFormat::EightNoneOne),
            "7E1" => Ok(FrameFormat::SevenEvenOne),
            "7O1" => Ok(FrameFormat::SevenOddOne),
            other => Err(SerialError::Config(format!(
                "unsupported frame format '{}'",
                other
            ))),
        }
    }
}

/// 串口配置
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SerialConfig {
    /// 设备路径，例如 `/dev/ttyS0`
    pub path: String,
    pub baud_rate: u32,
    pub frame_format: FrameFormat,
    pub hardware_flow_control: bool,
    /// 单次读取的超时（毫秒），决定读循环检查终止标志的间隔
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: String::from("/dev/ttyS0"),
            baud_rate: 115_200,
            frame_format: FrameFormat::EightNoneOne,
            hardware_flow_control: false,
            read_timeout_ms: 10,
        }
    }
}

impl SerialConfig {
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_format_from_str() {
        assert_eq!("8N1".parse::<FrameFormat>().unwrap(), FrameFormat::EightNoneOne);
        assert_eq!("7e1".parse::<FrameFormat>().unwrap(), FrameFormat::SevenEvenOne);
        assert_eq!("7O1".parse::<FrameFormat>().unwrap(), FrameFormat::SevenOddOne);
        assert!("9X2".parse::<FrameFormat>().is_err());
    }

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.frame_format, FrameFormat::EightNoneOne);
        assert!(!config.hardware_flow_control);
        assert_eq!(config.read_timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_serial_config_with_path() {
        let config = SerialConfig::with_path("/dev/ttyS1");
        assert_eq!(config.path, "/dev/ttyS1");
        assert_eq!(config.baud_rate, 115_200);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", SerialError::Timeout), "Read timeout");
        assert!(SerialError::Timeout.is_timeout());
        assert!(!SerialError::Disconnected.is_timeout());
    }
}

//! 基于 `serialport` 的串口传输

use crate::{
    FrameFormat, RxTransport, SerialConfig, SerialError, SplittableTransport, TxTransport,
};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use tracing::{debug, info};

impl FrameFormat {
    fn data_bits(self) -> DataBits {
        match self {
            FrameFormat::EightNoneOne => DataBits::Eight,
            FrameFormat::SevenEvenOne | FrameFormat::SevenOddOne => DataBits::Seven,
        }
    }

    fn parity(self) -> Parity {
        match self {
            FrameFormat::EightNoneOne => Parity::None,
            FrameFormat::SevenEvenOne => Parity::Even,
            FrameFormat::SevenOddOne => Parity::Odd,
        }
    }
}

/// 串口传输
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialTransport {
    /// 按配置打开串口并清空收发缓冲
    pub fn open(config: &SerialConfig) -> Result<Self, SerialError> {
        let flow_control = if config.hardware_flow_control {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };

        let port = serialport::new(config.path.as_str(), config.baud_rate)
            .data_bits(config.frame_format.data_bits())
            .parity(config.frame_format.parity())
            .stop_bits(StopBits::One)
            .flow_control(flow_control)
            .timeout(config.read_timeout())
            .open()
            .map_err(|source| SerialError::Open {
                path: config.path.clone(),
                source,
            })?;

        port.clear(ClearBuffer::All)?;

        info!(
            "Opened serial port: {} at {} baud ({:?})",
            config.path, config.baud_rate, config.frame_format
        );

        Ok(Self {
            port,
            path: config.path.clone(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

fn read_port(port: &mut dyn SerialPort, buf: &mut [u8]) -> Result<usize, SerialError> {
    match port.read(buf) {
        Ok(0) => Err(SerialError::Timeout),
        Ok(n) => Ok(n),
        Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
            Err(SerialError::Timeout)
        },
        Err(e) => Err(e.into()),
    }
}

fn write_port(port: &mut dyn SerialPort, bytes: &[u8]) -> Result<(), SerialError> {
    port.write_all(bytes)?;
    port.flush()?;
    Ok(())
}

impl RxTransport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        read_port(self.port.as_mut(), buf)
    }
}

impl TxTransport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        write_port(self.port.as_mut(), bytes)
    }
}

/// 串口接收半部
pub struct SerialRx {
    port: Box<dyn SerialPort>,
}

/// 串口发送半部
pub struct SerialTx {
    port: Box<dyn SerialPort>,
}

impl RxTransport for SerialRx {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        read_port(self.port.as_mut(), buf)
    }
}

impl TxTransport for SerialTx {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        write_port(self.port.as_mut(), bytes)
    }
}

impl SplittableTransport for SerialTransport {
    type Rx = SerialRx;
    type Tx = SerialTx;

    /// 复制底层文件描述符，收发各持一份
    fn split(self) -> Result<(SerialRx, SerialTx), SerialError> {
        let tx_port = self.port.try_clone()?;
        debug!("Split serial port {} into RX/TX halves", self.path);
        Ok((SerialRx { port: self.port }, SerialTx { port: tx_port }))
    }
}

//! 接收管线
//!
//! 每个设备一个 RX 线程：
//!
//! 1. 逐字节运行标记同步状态机，直到同步
//! 2. 读取 `message_id`、`length`、负载和 2 字节校验和
//! 3. 交给方言解码；校验失败则丢弃整帧，从第 1 步重新开始
//!    （已消费的字节不再回放）
//! 4. 按 `message_id` 查处理器表并调用
//!
//! 读超时时调用 `RxHooks::on_tick()`（看门狗），并检查终止标志。

use crate::lifecycle::{DriverLifecycle, LoopGuard};
use crate::metrics::DriverMetrics;
use heli_protocol::codec::{CHECKSUM_LEN, HEADER_LEN};
use heli_protocol::{Dialect, Frame, MarkerSync, ProtocolError};
use heli_serial::{RxTransport, SerialError};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// 单次读取的缓冲区大小
const READ_CHUNK: usize = 64;

/// 非致命读错误之后的退避
const IO_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// 处理器对一帧的归类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// 数据帧，已更新设备状态
    Data,
    /// 命令回复等控制帧
    Control,
    /// 有效但被忽略（例如初始化完成之前的数据）
    Ignored,
}

/// 帧处理器
pub type Handler<S> = fn(&S, &Frame) -> Result<Dispatch, ProtocolError>;

/// 按 `message_id` 索引的处理器表
pub struct HandlerTable<S> {
    handlers: [Option<Handler<S>>; 256],
}

impl<S> Default for HandlerTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> HandlerTable<S> {
    pub fn new() -> Self {
        Self {
            handlers: [None; 256],
        }
    }

    /// 注册处理器（同一 ID 重复注册时后者覆盖前者）
    pub fn with(mut self, id: impl Into<u8>, handler: Handler<S>) -> Self {
        self.handlers[id.into() as usize] = Some(handler);
        self
    }

    pub fn get(&self, id: u8) -> Option<Handler<S>> {
        self.handlers[id as usize]
    }
}

/// RX 循环对设备的回调
pub trait RxHooks: Send + Sync + 'static {
    /// 每次循环迭代调用一次，读超时时也会调用
    fn on_tick(&self) {}
}

/// `FrameReader::read_frame` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Frame),
    /// 校验失败，整帧被丢弃
    Corrupt(ProtocolError),
    /// 读取期间观察到终止标志
    Stopped,
}

/// 从字节流中切出帧
pub struct FrameReader<R> {
    rx: R,
    dialect: Dialect,
    sync: MarkerSync,
    buf: [u8; READ_CHUNK],
    start: usize,
    end: usize,
    frame: Vec<u8>,
}

impl<R: RxTransport> FrameReader<R> {
    pub fn new(rx: R, dialect: Dialect) -> Self {
        Self {
            rx,
            dialect,
            sync: MarkerSync::new(dialect.marker),
            buf: [0; READ_CHUNK],
            start: 0,
            end: 0,
            frame: Vec::with_capacity(Dialect::encoded_len(heli_protocol::MAX_PAYLOAD_LEN)),
        }
    }

    /// 取下一个字节；缓冲区空时读传输，每次读之前检查终止标志
    fn next_byte(
        &mut self,
        lifecycle: &DriverLifecycle,
        metrics: &DriverMetrics,
        on_idle: &mut dyn FnMut(),
    ) -> Result<Option<u8>, SerialError> {
        loop {
            if self.start < self.end {
                let byte = self.buf[self.start];
                self.start += 1;
                return Ok(Some(byte));
            }
            if !lifecycle.is_running() {
                return Ok(None);
            }
            match self.rx.read(&mut self.buf) {
                Ok(n) => {
                    metrics.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    self.start = 0;
                    self.end = n;
                },
                Err(SerialError::Timeout) => on_idle(),
                Err(e) => return Err(e),
            }
        }
    }

    /// 读取下一帧
    pub fn read_frame(
        &mut self,
        lifecycle: &DriverLifecycle,
        metrics: &DriverMetrics,
        on_idle: &mut dyn FnMut(),
    ) -> Result<ReadOutcome, SerialError> {
        // 1. 同步
        let mut consumed = 0u64;
        loop {
            let Some(byte) = self.next_byte(lifecycle, metrics, on_idle)? else {
                return Ok(ReadOutcome::Stopped);
            };
            consumed += 1;
            if self.sync.push(byte) {
                break;
            }
        }
        // 标记本身的两个字节不计入跳过
        let skipped = consumed.saturating_sub(2);
        if skipped > 0 {
            metrics.bytes_skipped.fetch_add(skipped, Ordering::Relaxed);
            if lifecycle.debug_enabled() {
                trace!("{}: skipped {} bytes before marker", lifecycle.name(), skipped);
            }
        }

        // 2-3. message_id + length
        self.frame.clear();
        for _ in 0..HEADER_LEN {
            let Some(byte) = self.next_byte(lifecycle, metrics, on_idle)? else {
                return Ok(ReadOutcome::Stopped);
            };
            self.frame.push(byte);
        }

        // 4-5. 负载 + 校验和
        let remaining = self.frame[1] as usize + CHECKSUM_LEN;
        for _ in 0..remaining {
            let Some(byte) = self.next_byte(lifecycle, metrics, on_idle)? else {
                return Ok(ReadOutcome::Stopped);
            };
            self.frame.push(byte);
        }

        // 6. 解码
        match self.dialect.decode(&self.frame) {
            Ok((frame, _)) => Ok(ReadOutcome::Frame(frame)),
            Err(e) => Ok(ReadOutcome::Corrupt(e)),
        }
    }
}

fn dispatch<S>(
    handlers: &HandlerTable<S>,
    device: &S,
    frame: &Frame,
    lifecycle: &DriverLifecycle,
    metrics: &DriverMetrics,
) {
    let Some(handler) = handlers.get(frame.id) else {
        metrics.unknown_messages.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{}: received unknown message id {:#04X} ({} bytes)",
            lifecycle.name(),
            frame.id,
            frame.len()
        );
        return;
    };

    match handler(device, frame) {
        Ok(kind) => {
            if lifecycle.debug_enabled() {
                trace!(
                    "{}: frame {:#04X} ({} bytes) -> {:?}",
                    lifecycle.name(),
                    frame.id,
                    frame.len(),
                    kind
                );
            }
        },
        Err(e) => {
            metrics.handler_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{}: dropped message {:#04X}: {}",
                lifecycle.name(),
                frame.id,
                e
            );
        },
    }
}

/// RX 循环主体
///
/// 退出条件：终止标志被置位，或传输断开（此时置位终止标志，发送循环随之退出）。
pub fn rx_loop<R, S>(
    rx: R,
    dialect: Dialect,
    handlers: HandlerTable<S>,
    device: Arc<S>,
    metrics: Arc<DriverMetrics>,
    guard: LoopGuard,
) where
    R: RxTransport,
    S: RxHooks,
{
    let lifecycle = guard.lifecycle().clone();
    let mut reader = FrameReader::new(rx, dialect);
    let mut on_idle = || device.on_tick();

    loop {
        // Acquire: 看到 false 时也能看到其他线程此前的全部写入
        if !lifecycle.is_running() {
            trace!("{}: RX thread: is_running flag is false, exiting", lifecycle.name());
            break;
        }

        let outcome = match reader.read_frame(&lifecycle, &metrics, &mut on_idle) {
            Ok(outcome) => outcome,
            Err(SerialError::Disconnected) => {
                error!(
                    "{}: RX thread: transport disconnected, setting is_running = false",
                    lifecycle.name()
                );
                lifecycle.terminate();
                break;
            },
            Err(e) => {
                error!("{}: RX thread: serial read error: {}", lifecycle.name(), e);
                std::thread::sleep(IO_ERROR_BACKOFF);
                continue;
            },
        };

        match outcome {
            ReadOutcome::Frame(frame) => {
                metrics.frames_valid.fetch_add(1, Ordering::Relaxed);
                dispatch(&handlers, device.as_ref(), &frame, &lifecycle, &metrics);
            },
            ReadOutcome::Corrupt(e) => {
                metrics.checksum_failures.fetch_add(1, Ordering::Relaxed);
                debug!("{}: discarded frame: {}", lifecycle.name(), e);
            },
            ReadOutcome::Stopped => {},
        }

        device.on_tick();
    }

    drop(guard);
}

//! 命令/应答
//!
//! `send_and_await` 先向“收到 ACK”事件注册一次性订阅，再写出命令，
//! 然后在有界时间内等待匹配的 ACK。先订阅后写入，设备回复得再快也不会丢。
//! 超时返回 `AckOutcome::TimedOut`，订阅随 `PendingAck` 一起释放。

use crate::DriverError;
use crate::events::{Observers, Subscription};
use crate::lifecycle::DriverLifecycle;
use crate::metrics::DriverMetrics;
use crate::scheduler::{WriteRetry, write_with_retry};
use crossbeam_channel::{Receiver, bounded};
use heli_protocol::gx3::{AckErrorCode, command_descriptor};
use heli_protocol::{Dialect, Frame};
use heli_serial::TxTransport;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{error, info, trace, warn};

/// 命令写入的重试策略（ACK 等待本身有超时，写入不能无限重试）
const COMMAND_WRITE_RETRY: WriteRetry = WriteRetry::Bounded {
    attempts: 3,
    backoff_ms: 10,
};

/// ACK 匹配键：描述符集 + 被确认的命令描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckKey {
    pub descriptor_set: u8,
    pub command: u8,
}

impl AckKey {
    /// 命令帧期望的 ACK
    pub fn for_command(frame: &Frame) -> Option<Self> {
        command_descriptor(frame).map(|command| AckKey {
            descriptor_set: frame.id,
            command,
        })
    }
}

/// RX 管线观察到的 ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEvent {
    pub key: AckKey,
    pub error_code: u8,
}

/// 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Success(u8),
    ErrorCode(u8),
    TimedOut,
}

impl AckOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AckOutcome::Success(_))
    }
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckOutcome::Success(_) => write!(f, "acknowledged"),
            AckOutcome::ErrorCode(code) => {
                write!(f, "error code {:#04X} ({:?})", code, AckErrorCode::from(*code))
            },
            AckOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// 一个未决的 ACK，只会被解决一次
pub struct PendingAck {
    expected: AckKey,
    created_at: Instant,
    rx: Receiver<u8>,
    _subscription: Subscription,
}

impl PendingAck {
    /// 在写出命令之前调用
    pub fn register(acks: &Observers<AckEvent>, expected: AckKey) -> Self {
        let (tx, rx) = bounded(1);
        let subscription = acks.subscribe(move |event: &AckEvent| {
            if event.key == expected {
                // 容量为 1：第一个匹配的 ACK 生效
                let _ = tx.try_send(event.error_code);
            }
        });
        Self {
            expected,
            created_at: Instant::now(),
            rx,
            _subscription: subscription,
        }
    }

    pub fn expected(&self) -> AckKey {
        self.expected
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// 最多阻塞 `timeout`
    pub fn wait(self, timeout: Duration) -> AckOutcome {
        match self.rx.recv_timeout(timeout) {
            Ok(0) => AckOutcome::Success(0),
            Ok(code) => AckOutcome::ErrorCode(code),
            Err(_) => AckOutcome::TimedOut,
        }
    }
}

/// 命令发送端：串行化写入，分发 ACK
pub struct CommandChannel {
    tx: Mutex<Box<dyn TxTransport>>,
    dialect: Dialect,
    acks: Observers<AckEvent>,
    lifecycle: Arc<DriverLifecycle>,
    metrics: Arc<DriverMetrics>,
}

impl CommandChannel {
    pub fn new(
        tx: Box<dyn TxTransport>,
        dialect: Dialect,
        lifecycle: Arc<DriverLifecycle>,
        metrics: Arc<DriverMetrics>,
    ) -> Self {
        Self {
            tx: Mutex::new(tx),
            dialect,
            acks: Observers::new(),
            lifecycle,
            metrics,
        }
    }

    pub fn acks(&self) -> &Observers<AckEvent> {
        &self.acks
    }

    /// RX 处理器收到 ACK 字段时调用
    pub fn publish_ack(&self, event: AckEvent) {
        trace!(
            "{}: ack for {:#04X}/{:#04X}: code {:#04X}",
            self.lifecycle.name(),
            event.key.descriptor_set,
            event.key.command,
            event.error_code
        );
        self.acks.notify(&event);
    }

    /// 只写不等
    pub fn send(&self, frame: &Frame) -> Result<(), DriverError> {
        let wire = self.dialect.encode(frame);
        let mut tx = self.tx.lock();
        write_with_retry(
            &mut **tx,
            &wire,
            COMMAND_WRITE_RETRY,
            &self.lifecycle,
            &self.metrics,
        )
    }

    /// 写出命令并等待匹配的 ACK
    pub fn send_and_await(
        &self,
        frame: &Frame,
        expected: AckKey,
        timeout: Duration,
    ) -> Result<AckOutcome, DriverError> {
        let pending = PendingAck::register(&self.acks, expected);
        self.send(frame)?;

        let outcome = pending.wait(timeout);
        let counter = match outcome {
            AckOutcome::Success(_) => &self.metrics.ack_successes,
            AckOutcome::ErrorCode(_) => &self.metrics.ack_failures,
            AckOutcome::TimedOut => &self.metrics.ack_timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    /// `send_and_await` 并记录一条带命令名的日志
    pub fn send_and_alert(
        &self,
        frame: &Frame,
        timeout: Duration,
        name: &str,
    ) -> Result<AckOutcome, DriverError> {
        let expected = AckKey::for_command(frame).ok_or_else(|| {
            DriverError::InvalidInput(format!("{} is not a command frame", name))
        })?;

        match self.send_and_await(frame, expected, timeout) {
            Ok(outcome @ AckOutcome::Success(_)) => {
                info!("{}: {} succeeded", self.lifecycle.name(), name);
                Ok(outcome)
            },
            Ok(outcome) => {
                warn!("{}: {} failed: {}", self.lifecycle.name(), name, outcome);
                Ok(outcome)
            },
            Err(e) => {
                error!("{}: {} could not be sent: {}", self.lifecycle.name(), name, e);
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heli_protocol::gx3;
    use heli_serial::{MockPeer, MockTransport, SplittableTransport};
    use std::thread;

    fn channel() -> (Arc<CommandChannel>, MockPeer) {
        let (transport, peer) = MockTransport::pair();
        let (_rx, tx) = transport.split().unwrap();
        let channel = CommandChannel::new(
            Box::new(tx),
            Dialect::GX3,
            DriverLifecycle::new("gx3", false),
            Arc::new(DriverMetrics::new()),
        );
        (Arc::new(channel), peer)
    }

    fn ping_key() -> AckKey {
        AckKey::for_command(&gx3::ping()).unwrap()
    }

    #[test]
    fn test_ack_key_for_command() {
        assert_eq!(
            ping_key(),
            AckKey {
                descriptor_set: 0x01,
                command: 0x01
            }
        );
        assert!(AckKey::for_command(&Frame::new(0x01, &[0x02]).unwrap()).is_none());
    }

    #[test]
    fn test_ack_published_before_wait_is_not_lost() {
        let acks = Observers::new();
        let pending = PendingAck::register(&acks, ping_key());
        acks.notify(&AckEvent {
            key: ping_key(),
            error_code: 0,
        });
        assert_eq!(pending.wait(Duration::from_millis(10)), AckOutcome::Success(0));
    }

    #[test]
    fn test_first_matching_ack_wins() {
        let acks = Observers::new();
        let pending = PendingAck::register(&acks, ping_key());
        let other = AckKey {
            descriptor_set: 0x0C,
            command: 0x08,
        };
        acks.notify(&AckEvent {
            key: other,
            error_code: 0,
        });
        acks.notify(&AckEvent {
            key: ping_key(),
            error_code: 3,
        });
        acks.notify(&AckEvent {
            key: ping_key(),
            error_code: 0,
        });
        assert_eq!(pending.wait(Duration::from_millis(10)), AckOutcome::ErrorCode(3));
    }

    #[test]
    fn test_timeout_unsubscribes() {
        let acks: Observers<AckEvent> = Observers::new();
        let pending = PendingAck::register(&acks, ping_key());
        assert_eq!(acks.len(), 1);

        let start = Instant::now();
        assert_eq!(pending.wait(Duration::from_millis(30)), AckOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(acks.is_empty());
    }

    #[test]
    fn test_send_and_await_success() {
        let (channel, peer) = channel();
        let responder = {
            let channel = channel.clone();
            thread::spawn(move || {
                let written = peer.recv_written(Duration::from_secs(1)).unwrap();
                assert_eq!(written[..2], [0x75, 0x65]);
                channel.publish_ack(AckEvent {
                    key: ping_key(),
                    error_code: 0,
                });
            })
        };

        let outcome = channel
            .send_and_await(&gx3::ping(), ping_key(), Duration::from_secs(1))
            .unwrap();
        responder.join().unwrap();

        assert_eq!(outcome, AckOutcome::Success(0));
        assert_eq!(channel.metrics.snapshot().ack_successes, 1);
    }

    #[test]
    fn test_send_and_alert_times_out_within_bound() {
        let (channel, peer) = channel();
        let timeout = Duration::from_millis(50);

        let start = Instant::now();
        let outcome = channel
            .send_and_alert(&gx3::set_to_idle(), timeout, "set to idle")
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(outcome, AckOutcome::TimedOut);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200), "{:?}", elapsed);
        assert_eq!(peer.drain_written().len(), 1);
        assert_eq!(channel.metrics.snapshot().ack_timeouts, 1);
    }

    #[test]
    fn test_send_fails_after_bounded_retries() {
        let (channel, peer) = channel();
        peer.fail_next_writes(5);
        let result = channel.send_and_await(&gx3::ping(), ping_key(), Duration::from_millis(10));
        assert!(matches!(result, Err(DriverError::WriteFailed { attempts: 3, .. })));
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(AckOutcome::Success(0).to_string(), "acknowledged");
        assert_eq!(AckOutcome::TimedOut.to_string(), "timed out");
        assert_eq!(
            AckOutcome::ErrorCode(3).to_string(),
            "error code 0x03 (InvalidParameter)"
        );
    }
}

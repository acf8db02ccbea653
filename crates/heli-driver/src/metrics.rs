//! 驱动性能指标
//!
//! 每个驱动一组原子计数器，可以在任何线程读取，不引入锁竞争。

use std::sync::atomic::{AtomicU64, Ordering};

/// 驱动实时指标
///
/// ```rust
/// use heli_driver::DriverMetrics;
/// use std::sync::atomic::Ordering;
///
/// let metrics = DriverMetrics::new();
/// metrics.frames_valid.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(metrics.snapshot().frames_valid, 1);
/// ```
#[derive(Debug, Default)]
pub struct DriverMetrics {
    /// 从传输读到的字节数
    pub bytes_read: AtomicU64,

    /// 同步期间跳过的字节数（噪声、残帧）
    pub bytes_skipped: AtomicU64,

    /// 校验通过的帧数
    pub frames_valid: AtomicU64,

    /// 校验失败被丢弃的帧数
    pub checksum_failures: AtomicU64,

    /// 处理器表中没有条目的帧数
    pub unknown_messages: AtomicU64,

    /// 处理器返回错误的帧数（负载过短等）
    pub handler_errors: AtomicU64,

    /// 成功写出的帧数
    pub frames_sent: AtomicU64,

    /// 写入失败次数（每次尝试计一次）
    pub write_failures: AtomicU64,

    pub ack_successes: AtomicU64,

    /// 设备回复了非零错误码
    pub ack_failures: AtomicU64,

    pub ack_timeouts: AtomicU64,
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取全部计数器
    ///
    /// 使用 `Ordering::Relaxed`：计数器之间可能有微小的时间差。
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_skipped: self.bytes_skipped.load(Ordering::Relaxed),
            frames_valid: self.frames_valid.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            unknown_messages: self.unknown_messages.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            ack_successes: self.ack_successes.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
        }
    }

    /// 重置所有计数器
    pub fn reset(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_skipped.store(0, Ordering::Relaxed);
        self.frames_valid.store(0, Ordering::Relaxed);
        self.checksum_failures.store(0, Ordering::Relaxed);
        self.unknown_messages.store(0, Ordering::Relaxed);
        self.handler_errors.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.write_failures.store(0, Ordering::Relaxed);
        self.ack_successes.store(0, Ordering::Relaxed);
        self.ack_failures.store(0, Ordering::Relaxed);
        self.ack_timeouts.store(0, Ordering::Relaxed);
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub bytes_read: u64,
    pub bytes_skipped: u64,
    pub frames_valid: u64,
    pub checksum_failures: u64,
    pub unknown_messages: u64,
    pub handler_errors: u64,
    pub frames_sent: u64,
    pub write_failures: u64,
    pub ack_successes: u64,
    pub ack_failures: u64,
    pub ack_timeouts: u64,
}

impl MetricsSnapshot {
    /// 校验失败率（百分比）
    ///
    /// 没有收到任何帧时返回 0.0。
    pub fn checksum_failure_rate(&self) -> f64 {
        let total = self.frames_valid + self.checksum_failures;
        if total == 0 {
            return 0.0;
        }
        (self.checksum_failures as f64 / total as f64) * 100.0
    }
}

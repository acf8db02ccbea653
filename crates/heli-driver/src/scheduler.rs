//! 固定频率发送调度
//!
//! 每个周期：`RateLimiter::wait()` → 在锁内读取输出状态并构建一帧 → 编码 →
//! `finished_critical_section()` → 写入传输。写入阻塞不计入限速器负载。
//!
//! 写失败按 `WriteRetry` 重试：
//! - `Forever`：只要驱动还在运行就一直重试，两次尝试之间退避
//! - `Bounded`：尝试 `attempts` 次后丢弃该帧并通知 `write_failed` 订阅者

use crate::DriverError;
use crate::events::Observers;
use crate::lifecycle::{DriverLifecycle, LoopGuard};
use crate::metrics::DriverMetrics;
use crate::rate::RateLimiter;
use heli_protocol::{Dialect, Frame};
use heli_serial::TxTransport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 写失败重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum WriteRetry {
    Forever { backoff_ms: u64 },
    Bounded { attempts: u32, backoff_ms: u64 },
}

impl Default for WriteRetry {
    fn default() -> Self {
        WriteRetry::Forever { backoff_ms: 5 }
    }
}

impl WriteRetry {
    fn backoff(self) -> Duration {
        match self {
            WriteRetry::Forever { backoff_ms } | WriteRetry::Bounded { backoff_ms, .. } => {
                Duration::from_millis(backoff_ms)
            },
        }
    }

    fn exhausted(self, attempts: u32) -> bool {
        match self {
            WriteRetry::Forever { .. } => false,
            WriteRetry::Bounded { attempts: max, .. } => attempts >= max,
        }
    }
}

/// 被丢弃的出站帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub driver: String,
    pub message_id: u8,
    pub attempts: u32,
    pub reason: String,
}

/// 按策略写入，直到成功、重试耗尽或驱动终止
pub fn write_with_retry<T: TxTransport + ?Sized>(
    tx: &mut T,
    bytes: &[u8],
    retry: WriteRetry,
    lifecycle: &DriverLifecycle,
    metrics: &DriverMetrics,
) -> Result<(), DriverError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match tx.write_all(bytes) {
            Ok(()) => {
                metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                if attempts > 1 {
                    debug!("{}: write succeeded after {} attempts", lifecycle.name(), attempts);
                }
                return Ok(());
            },
            Err(e) => {
                metrics.write_failures.fetch_add(1, Ordering::Relaxed);
                if attempts == 1 {
                    warn!("{}: error sending message: {}", lifecycle.name(), e);
                } else {
                    trace!("{}: write attempt {} failed: {}", lifecycle.name(), attempts, e);
                }

                if retry.exhausted(attempts) || !lifecycle.is_running() {
                    return Err(DriverError::WriteFailed {
                        attempts,
                        reason: e.to_string(),
                    });
                }
                let backoff = retry.backoff();
                if !backoff.is_zero() {
                    std::thread::sleep(backoff);
                }
            },
        }
    }
}

/// 发送循环的参数
pub struct SendContext {
    pub dialect: Dialect,
    pub limiter: RateLimiter,
    pub retry: WriteRetry,
    pub metrics: Arc<DriverMetrics>,
    pub write_failed: Observers<WriteFailure>,
}

/// TX 循环主体
///
/// `build` 每个周期调用一次；返回 `None` 表示本周期不发送。
pub fn send_loop<T, B>(mut tx: T, mut build: B, ctx: SendContext, guard: LoopGuard)
where
    T: TxTransport,
    B: FnMut() -> Option<Frame>,
{
    let lifecycle = guard.lifecycle().clone();
    let SendContext {
        dialect,
        mut limiter,
        retry,
        metrics,
        write_failed,
    } = ctx;
    let mut wire = Vec::with_capacity(Dialect::encoded_len(heli_protocol::MAX_PAYLOAD_LEN));

    loop {
        if !lifecycle.is_running() {
            trace!("{}: TX thread: is_running flag is false, exiting", lifecycle.name());
            break;
        }

        limiter.wait();

        let Some(frame) = build() else {
            limiter.finished_critical_section();
            continue;
        };
        wire.clear();
        dialect.encode_into(&frame, &mut wire);
        limiter.finished_critical_section();

        if lifecycle.debug_enabled() {
            trace!("{}: sending {:02X?}", lifecycle.name(), wire);
        }

        if let Err(e) = write_with_retry(&mut tx, &wire, retry, &lifecycle, &metrics)
            && lifecycle.is_running()
        {
            warn!(
                "{}: dropped outbound message {:#04X}: {}",
                lifecycle.name(),
                frame.id,
                e
            );
            let attempts = match e {
                DriverError::WriteFailed { attempts, .. } => attempts,
                _ => 1,
            };
            write_failed.notify(&WriteFailure {
                driver: lifecycle.name().to_string(),
                message_id: frame.id,
                attempts,
                reason: e.to_string(),
            });
        }
    }

    trace!(
        "{}: TX thread load {:.3}, {} overruns",
        lifecycle.name(),
        limiter.load(),
        limiter.overruns()
    );
    drop(guard);
}

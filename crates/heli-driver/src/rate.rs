//! 固定频率限速器
//!
//! `wait()` 睡眠到下一个锚点（`spin_sleep`，微秒级抖动）；
//! `finished_critical_section()` 标记本周期的有效工作结束，之后的阻塞
//! （例如串口写入）不计入负载。

use crate::DriverError;
use spin_sleep::SpinSleeper;
use std::time::{Duration, Instant};
use tracing::trace;

/// 负载的指数平滑系数
const LOAD_SMOOTHING: f64 = 0.1;

/// 固定频率限速器
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    next_tick: Instant,
    woke_at: Instant,
    load: Option<f64>,
    overruns: u64,
    sleeper: SpinSleeper,
}

impl RateLimiter {
    pub fn new(hz: f64) -> Result<Self, DriverError> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(DriverError::Config(format!(
                "Invalid rate: {} Hz (must be > 0)",
                hz
            )));
        }

        let period = Duration::try_from_secs_f64(1.0 / hz)
            .ok()
            .filter(|period| !period.is_zero())
            .ok_or_else(|| {
                DriverError::Config(format!("Invalid rate: {} Hz (period out of range)", hz))
            })?;

        let now = Instant::now();
        Ok(Self {
            period,
            next_tick: now,
            woke_at: now,
            load: None,
            overruns: 0,
            sleeper: SpinSleeper::default(),
        })
    }

    /// 阻塞到下一个周期
    ///
    /// 落后超过一个完整周期时记一次超限，并以当前时间重新对齐锚点。
    pub fn wait(&mut self) {
        let now = Instant::now();
        if self.next_tick > now {
            self.sleeper.sleep(self.next_tick - now);
        } else if now - self.next_tick > self.period {
            self.overruns += 1;
            trace!(
                "Rate limiter overrun: {:?} behind (period {:?})",
                now - self.next_tick,
                self.period
            );
            self.next_tick = now;
        }

        self.woke_at = Instant::now();
        self.next_tick += self.period;
    }

    /// 本周期的有效工作完成
    pub fn finished_critical_section(&mut self) {
        let sample = self.woke_at.elapsed().as_secs_f64() / self.period.as_secs_f64();
        self.load = Some(match self.load {
            None => sample,
            Some(load) => LOAD_SMOOTHING * sample + (1.0 - LOAD_SMOOTHING) * load,
        });
    }

    /// 平滑后的负载（工作时间 / 周期），尚无样本时为 0
    pub fn load(&self) -> f64 {
        self.load.unwrap_or(0.0)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

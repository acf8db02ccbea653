//! 设备健康状态机
//!
//! ```text
//! STARTUP            ─▶ INIT      begin_init()
//! STARTUP/INIT/ERROR ─▶ RUNNING   初始化完成后的第一个有效数据帧
//! RUNNING            ─▶ ERROR     看门狗超时
//! ```
//!
//! 所有模式写入都经过 `transition()`：它在转移锁内执行进入 RUNNING 的副作用
//! （每次转移恰好一次），写入模式，并同步通知 `mode_changed` 的订阅者。
//! 订阅者回调运行在持锁的发布者线程上，不能再驱动本状态机转移。
//!
//! 进入 ERROR 时清除“初始化完成”标志并发出重新初始化请求；重新初始化
//! 完成之前收到的数据帧不会让模式回到 RUNNING。

use crate::activity::ActivityMonitor;
use crate::events::Observers;
use crate::mode::{AtomicDeviceMode, DeviceMode};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 模式变化事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub from: DeviceMode,
    pub to: DeviceMode,
}

/// 重新初始化请求（发出即不管）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReinitRequest {
    /// 发出请求时的模式
    pub mode: DeviceMode,
}

fn is_allowed(from: DeviceMode, to: DeviceMode) -> bool {
    matches!(
        (from, to),
        (DeviceMode::Startup, DeviceMode::Init)
            | (
                DeviceMode::Startup | DeviceMode::Init | DeviceMode::Error,
                DeviceMode::Running
            )
            | (DeviceMode::Running, DeviceMode::Error)
    )
}

/// 设备健康状态机
pub struct HealthMonitor {
    name: String,
    mode: AtomicDeviceMode,
    transition_lock: Mutex<()>,
    init_complete: AtomicBool,
    init_in_progress: AtomicBool,
    watchdog: Duration,
    activity: ActivityMonitor,
    last_reinit_request: Mutex<Option<Instant>>,
    mode_changed: Observers<ModeChange>,
    reinit_requested: Observers<ReinitRequest>,
}

impl HealthMonitor {
    pub fn new(name: impl Into<String>, watchdog: Duration) -> Self {
        Self {
            name: name.into(),
            mode: AtomicDeviceMode::default(),
            transition_lock: Mutex::new(()),
            init_complete: AtomicBool::new(false),
            init_in_progress: AtomicBool::new(false),
            watchdog,
            activity: ActivityMonitor::new(),
            last_reinit_request: Mutex::new(None),
            mode_changed: Observers::new(),
            reinit_requested: Observers::new(),
        }
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode.get(Ordering::Acquire)
    }

    pub fn mode_changed(&self) -> &Observers<ModeChange> {
        &self.mode_changed
    }

    pub fn reinit_requested(&self) -> &Observers<ReinitRequest> {
        &self.reinit_requested
    }

    pub fn watchdog(&self) -> Duration {
        self.watchdog
    }

    /// 任何校验通过的数据帧都要登记（即使在 INIT 中被忽略）
    pub fn record_activity(&self) {
        self.activity.register_data();
    }

    pub fn time_since_last_data(&self) -> Duration {
        self.activity.time_since_last_data()
    }

    pub fn is_init_complete(&self) -> bool {
        self.init_complete.load(Ordering::Acquire)
    }

    pub fn is_init_in_progress(&self) -> bool {
        self.init_in_progress.load(Ordering::Acquire)
    }

    /// 初始化序列开始
    ///
    /// STARTUP 转为 INIT；ERROR 保持不变直到序列完成后收到数据。
    pub fn begin_init(&self) {
        self.init_in_progress.store(true, Ordering::Release);
        self.init_complete.store(false, Ordering::Release);
        if self.mode() == DeviceMode::Startup {
            self.transition(DeviceMode::Init, || {});
        }
    }

    /// 初始化序列结束（无论各命令是否得到确认）
    pub fn finish_init(&self) {
        // 看门狗从序列结束时重新计时
        self.activity.register_data();
        self.init_complete.store(true, Ordering::Release);
        self.init_in_progress.store(false, Ordering::Release);
        debug!("{}: initialization sequence complete", self.name);
    }

    /// 收到一个有效数据帧
    ///
    /// 初始化未完成时返回 `false`，调用方应丢弃该帧的内容。
    /// 若当前不在 RUNNING，则转入 RUNNING 并执行 `on_enter_running` 一次。
    pub fn on_data_frame(&self, on_enter_running: impl FnOnce()) -> bool {
        if !self.is_init_complete() {
            return false;
        }
        if self.mode() != DeviceMode::Running {
            self.transition(DeviceMode::Running, on_enter_running);
        }
        true
    }

    /// 看门狗检查，收循环每次迭代（包括读超时）调用
    pub fn tick(&self) {
        if self.is_init_in_progress() || !self.activity.is_silent(self.watchdog) {
            return;
        }

        match self.mode() {
            DeviceMode::Running => {
                warn!(
                    "{}: no data for {:?}, entering ERROR",
                    self.name,
                    self.activity.time_since_last_data()
                );
                if self.transition(DeviceMode::Error, || {}) {
                    self.request_reinit(DeviceMode::Error);
                }
            },
            // 重新初始化之后设备仍然沉默：按看门狗周期重复请求
            DeviceMode::Error => self.request_reinit_if_due(DeviceMode::Error),
            DeviceMode::Init if self.is_init_complete() => {
                self.request_reinit_if_due(DeviceMode::Init)
            },
            _ => {},
        }
    }

    fn request_reinit_if_due(&self, mode: DeviceMode) {
        let due = self
            .last_reinit_request
            .lock()
            .is_none_or(|at| at.elapsed() >= self.watchdog);
        if due {
            self.request_reinit(mode);
        }
    }

    fn request_reinit(&self, mode: DeviceMode) {
        *self.last_reinit_request.lock() = Some(Instant::now());
        info!("{}: requesting reinitialization", self.name);
        self.reinit_requested.notify(&ReinitRequest { mode });
    }

    /// 唯一的模式写入路径
    fn transition(&self, to: DeviceMode, on_enter_running: impl FnOnce()) -> bool {
        let _guard = self.transition_lock.lock();
        let from = self.mode.get(Ordering::Acquire);
        if from == to || !is_allowed(from, to) {
            debug!("{}: ignoring transition {} -> {}", self.name, from, to);
            return false;
        }

        if to == DeviceMode::Running {
            on_enter_running();
        }
        if to == DeviceMode::Error {
            self.init_complete.store(false, Ordering::Release);
        }

        self.mode.set(to, Ordering::Release);
        info!("{}: mode {} -> {}", self.name, from, to);
        self.mode_changed.notify(&ModeChange { from, to });
        true
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("init_complete", &self.is_init_complete())
            .field("watchdog", &self.watchdog)
            .finish()
    }
}

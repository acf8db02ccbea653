//! 驱动生命周期与注册表
//!
//! 每个驱动持有一个 `DriverLifecycle`：协作式终止标志 + 活跃循环计数。
//! 收/发循环在每次外层迭代检查 `is_running()`，并在线程内持有 `LoopGuard`，
//! 这样 `DriverRegistry::terminate_all()` 可以等待循环真正退出。
//!
//! 注册表由应用上下文持有（没有全局单例），`Registration` 被丢弃时自动注销。

use crate::DriverError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, spawn};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 单个驱动的运行状态
#[derive(Debug)]
pub struct DriverLifecycle {
    name: String,
    is_running: AtomicBool,
    active_loops: AtomicUsize,
    debug: bool,
}

impl DriverLifecycle {
    pub fn new(name: impl Into<String>, debug: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            is_running: AtomicBool::new(true),
            active_loops: AtomicUsize::new(0),
            debug,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 终止标志（Acquire，与 `terminate()` 的 Release 配对）
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// 请求所有循环退出（幂等）
    pub fn terminate(&self) {
        if self.is_running.swap(false, Ordering::AcqRel) {
            debug!("{}: termination requested", self.name);
        }
    }

    /// 是否输出逐帧 trace 日志
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    pub fn active_loops(&self) -> usize {
        self.active_loops.load(Ordering::Acquire)
    }

    /// 在 spawn 之前获取，随线程一起移动，线程退出时释放
    pub fn loop_guard(self: &Arc<Self>, role: &'static str) -> LoopGuard {
        self.active_loops.fetch_add(1, Ordering::AcqRel);
        LoopGuard {
            lifecycle: self.clone(),
            role,
        }
    }
}

/// 活跃循环计数的 RAII 句柄
#[derive(Debug)]
pub struct LoopGuard {
    lifecycle: Arc<DriverLifecycle>,
    role: &'static str,
}

impl LoopGuard {
    pub fn lifecycle(&self) -> &Arc<DriverLifecycle> {
        &self.lifecycle
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.lifecycle.active_loops.fetch_sub(1, Ordering::AcqRel);
        trace!("{}: {} loop exited", self.lifecycle.name, self.role);
    }
}

// ============================================================================
// 注册表
// ============================================================================

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    drivers: Mutex<Vec<(u64, Arc<DriverLifecycle>)>>,
}

/// 驱动注册表（克隆后共享同一张表）
#[derive(Clone, Default)]
pub struct DriverRegistry {
    inner: Arc<RegistryInner>,
}

/// 注册句柄，丢弃时从注册表移除
#[derive(Debug)]
pub struct Registration {
    registry: Weak<RegistryInner>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.drivers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// `terminate_all` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// 收到终止请求的驱动数
    pub terminated: usize,
    /// 宽限期结束时仍有循环在运行的驱动
    pub still_running: Vec<String>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.still_running.is_empty()
    }
}

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(5);

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册驱动（新驱动排在最前）
    #[must_use = "dropping the Registration deregisters the driver"]
    pub fn register(&self, lifecycle: Arc<DriverLifecycle>) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Registering driver {}", lifecycle.name());
        self.inner.drivers.lock().insert(0, (id, lifecycle));
        Registration {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.drivers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .drivers
            .lock()
            .iter()
            .map(|(_, d)| d.name().to_string())
            .collect()
    }

    /// 置位所有驱动的终止标志，然后在 `grace` 内等待它们的循环退出
    pub fn terminate_all(&self, grace: Duration) -> ShutdownReport {
        let start = Instant::now();
        let drivers: Vec<Arc<DriverLifecycle>> =
            self.inner.drivers.lock().iter().map(|(_, d)| d.clone()).collect();

        for driver in &drivers {
            driver.terminate();
        }
        info!("Terminating {} driver(s)", drivers.len());

        let deadline = start + grace;
        let still_running = loop {
            let running: Vec<String> = drivers
                .iter()
                .filter(|d| d.active_loops() > 0)
                .map(|d| d.name().to_string())
                .collect();
            if running.is_empty() || Instant::now() >= deadline {
                break running;
            }
            std::thread::sleep(SHUTDOWN_POLL_INTERVAL);
        };

        for name in &still_running {
            warn!("{}: loops still running after {:?}", name, grace);
        }

        ShutdownReport {
            terminated: drivers.len(),
            still_running,
            elapsed: start.elapsed(),
        }
    }
}

// ============================================================================
// 线程回收
// ============================================================================

/// 带超时的 join
pub(crate) trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();

        // 看门狗线程代为 join
        spawn(move || {
            let result = self.join();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

/// 启动一个循环线程，线程名为 `<driver>-<role>`
///
/// `LoopGuard` 在 spawn 之前获取，`terminate_all` 因此不会错过尚未开始运行的线程。
pub(crate) fn spawn_loop<F>(
    lifecycle: &Arc<DriverLifecycle>,
    role: &'static str,
    body: F,
) -> Result<JoinHandle<()>, DriverError>
where
    F: FnOnce(LoopGuard) + Send + 'static,
{
    let guard = lifecycle.loop_guard(role);
    std::thread::Builder::new()
        .name(format!("{}-{}", lifecycle.name(), role))
        .spawn(move || body(guard))
        .map_err(|e| DriverError::Spawn(e.to_string()))
}

/// 驱动 Drop 时使用：终止并回收收/发线程
pub(crate) fn shutdown_threads(
    lifecycle: &DriverLifecycle,
    threads: &mut Vec<(&'static str, JoinHandle<()>)>,
    timeout: Duration,
) {
    lifecycle.terminate();
    for (role, handle) in threads.drain(..) {
        if let Err(_e) = handle.join_timeout(timeout) {
            error!(
                "{}: {} thread panicked or failed to shut down within {:?}",
                lifecycle.name(),
                role,
                timeout
            );
        }
    }
}

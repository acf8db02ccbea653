//! 3DM-GX3 导航传感器驱动
//!
//! 单个 RX 线程解析两类帧：
//!
//! - 命令集（0x01/0x0C/0x0D/0x7F）的回复：提取 ACK 字段并发布给等待者
//! - 数据集（0x80 AHRS / 0x82 NAV）：更新位置、速度、姿态，驱动健康状态机
//!
//! 初始化序列在独立线程上通过命令/应答完成；看门狗触发的重新初始化请求
//! 在已有序列运行时被合并。设备没有周期性出站数据，因此没有 TX 线程。

use crate::DriverError;
use crate::ack::{AckEvent, AckKey, AckOutcome, CommandChannel};
use crate::config::Gx3Config;
use crate::events::{Observers, Subscription};
use crate::geo::{self, GeodeticPosition, euler_to_rotation};
use crate::health::{HealthMonitor, ModeChange};
use crate::lifecycle::{
    DriverLifecycle, DriverRegistry, Registration, shutdown_threads, spawn_loop,
};
use crate::metrics::{DriverMetrics, MetricsSnapshot};
use crate::mode::DeviceMode;
use crate::pipeline::{Dispatch, HandlerTable, RxHooks, rx_loop};
use heli_protocol::gx3::{self as cmd, AckField, DataField, FilterState, StreamDevice, parse_data};
use heli_protocol::{DescriptorSet, Dialect, Frame, ProtocolError};
use heli_serial::{SerialTransport, SplittableTransport};
use nalgebra::{Matrix3, Vector3};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// 注册表中的驱动名
pub const GX3_NAME: &str = "gx3";

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

fn to_vector(v: [f32; 3]) -> Vector3<f64> {
    Vector3::new(f64::from(v[0]), f64::from(v[1]), f64::from(v[2]))
}

/// RX 线程、初始化线程和外部读者共享的状态
///
/// 每个字段独立加锁；相关字段之间（例如位置与原点）不保证一致。
pub(crate) struct Gx3Shared {
    config: Gx3Config,
    lifecycle: Arc<DriverLifecycle>,
    health: HealthMonitor,
    commands: CommandChannel,

    position: Mutex<GeodeticPosition>,
    ned_origin: Mutex<GeodeticPosition>,
    velocity: Mutex<Vector3<f64>>,
    nav_euler: Mutex<Vector3<f64>>,
    nav_rate: Mutex<Vector3<f64>>,
    ahrs_euler: Mutex<Vector3<f64>>,
    ahrs_rate: Mutex<Vector3<f64>>,
    filter_state: Mutex<Option<FilterState>>,
    use_nav_attitude: AtomicBool,
    /// 已进入 RUNNING，原点等待第一个有效位置
    origin_pending: AtomicBool,

    status_message: Mutex<Option<String>>,
    status_messages: Observers<String>,

    reinit_running: AtomicBool,
    reinit_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Gx3Shared {
    fn new(config: Gx3Config, commands: CommandChannel, lifecycle: Arc<DriverLifecycle>) -> Self {
        Self {
            health: HealthMonitor::new(GX3_NAME, config.watchdog()),
            use_nav_attitude: AtomicBool::new(config.use_nav_attitude),
            config,
            lifecycle,
            commands,
            position: Mutex::new(GeodeticPosition::default()),
            ned_origin: Mutex::new(GeodeticPosition::default()),
            velocity: Mutex::new(Vector3::zeros()),
            nav_euler: Mutex::new(Vector3::zeros()),
            nav_rate: Mutex::new(Vector3::zeros()),
            ahrs_euler: Mutex::new(Vector3::zeros()),
            ahrs_rate: Mutex::new(Vector3::zeros()),
            filter_state: Mutex::new(None),
            origin_pending: AtomicBool::new(false),
            status_message: Mutex::new(None),
            status_messages: Observers::new(),
            reinit_running: AtomicBool::new(false),
            reinit_thread: Mutex::new(None),
        }
    }

    fn set_ned_origin(&self, origin: GeodeticPosition) {
        *self.ned_origin.lock() = origin;
        info!(
            "{}: Origin set to {:.7}, {:.7}, {:.2}",
            GX3_NAME,
            origin.latitude_deg(),
            origin.longitude_deg(),
            origin.height_m()
        );
    }

    fn set_status_message(&self, message: String) {
        self.status_messages.notify(&message);
        *self.status_message.lock() = Some(message);
    }

    fn apply(&self, field: DataField) {
        match field {
            DataField::AhrsEuler(v) => *self.ahrs_euler.lock() = to_vector(v),
            DataField::AhrsGyro(v) => *self.ahrs_rate.lock() = to_vector(v),
            DataField::NavPosition(p) if p.valid => {
                *self.position.lock() =
                    GeodeticPosition::new(p.latitude_deg, p.longitude_deg, p.height_m);
            },
            DataField::NavVelocity(v) if v.valid => *self.velocity.lock() = to_vector(v.value),
            DataField::NavEuler(v) if v.valid => *self.nav_euler.lock() = to_vector(v.value),
            DataField::NavAngularRate(v) if v.valid => *self.nav_rate.lock() = to_vector(v.value),
            DataField::FilterStatus { state, .. } => {
                let previous = self.filter_state.lock().replace(state);
                if previous != Some(state) {
                    debug!("{}: navigation filter state {:?}", GX3_NAME, state);
                }
            },
            _ => {},
        }
    }

    /// 启动重新初始化线程；已有序列在运行时合并，返回 `false`
    fn spawn_reinit(self: &Arc<Self>) -> bool {
        if self.reinit_running.swap(true, Ordering::AcqRel) {
            debug!("{}: reinitialization already running, request coalesced", GX3_NAME);
            return false;
        }

        let shared = self.clone();
        let spawned = spawn_loop(&self.lifecycle, "init", move |_guard| {
            shared.run_init_sequence();
            shared.reinit_running.store(false, Ordering::Release);
        });

        match spawned {
            Ok(handle) => {
                // 上一个线程已经结束，丢弃其句柄即可
                *self.reinit_thread.lock() = Some(handle);
                true
            },
            Err(e) => {
                error!("{}: failed to start initialization: {}", GX3_NAME, e);
                self.reinit_running.store(false, Ordering::Release);
                false
            },
        }
    }

    /// 初始化命令序列，全部得到确认时返回 `true`
    fn run_init_sequence(&self) -> bool {
        self.health.begin_init();
        info!("{}: running initialization sequence", GX3_NAME);

        let steps = [
            ("ping", cmd::ping()),
            ("set to idle", cmd::set_to_idle()),
            ("AHRS message format", cmd::ahrs_message_format(self.config.ahrs_decimation)),
            ("NAV message format", cmd::nav_message_format(self.config.nav_decimation)),
            ("vehicle dynamics mode", cmd::vehicle_dynamics_mode(self.config.dynamics_mode)),
            ("enable AHRS stream", cmd::enable_stream(StreamDevice::Ahrs, true)),
            ("enable NAV stream", cmd::enable_stream(StreamDevice::Nav, true)),
            ("resume", cmd::resume()),
        ];

        let mut all_acknowledged = true;
        for (name, frame) in steps {
            if !self.lifecycle.is_running() {
                debug!("{}: initialization aborted, driver terminating", GX3_NAME);
                all_acknowledged = false;
                break;
            }
            match self.commands.send_and_alert(&frame, self.config.ack_timeout(), name) {
                Ok(outcome) if outcome.is_success() => {},
                Ok(outcome) => {
                    all_acknowledged = false;
                    self.set_status_message(format!("GX3 {} {}", name, outcome));
                },
                Err(e) => {
                    all_acknowledged = false;
                    self.set_status_message(format!("GX3 {} could not be sent: {}", name, e));
                },
            }
        }

        self.health.finish_init();
        all_acknowledged
    }
}

impl RxHooks for Gx3Shared {
    fn on_tick(&self) {
        self.health.tick();
    }
}

// ============================================================================
// 处理器
// ============================================================================

fn handle_command_reply(shared: &Gx3Shared, frame: &Frame) -> Result<Dispatch, ProtocolError> {
    for ack in AckField::collect(frame.payload())? {
        shared.commands.publish_ack(AckEvent {
            key: AckKey {
                descriptor_set: frame.id,
                command: ack.command,
            },
            error_code: ack.error_code,
        });
    }
    Ok(Dispatch::Control)
}

fn handle_data(shared: &Gx3Shared, frame: &Frame) -> Result<Dispatch, ProtocolError> {
    let fields = parse_data(frame)?;
    shared.health.record_activity();

    if !shared.health.is_init_complete() {
        if shared.lifecycle.debug_enabled() {
            trace!("{}: ignoring data frame {:#04X} during init", GX3_NAME, frame.id);
        }
        return Ok(Dispatch::Ignored);
    }

    let has_fix = fields
        .iter()
        .any(|field| matches!(field, DataField::NavPosition(p) if p.valid));
    for field in fields {
        shared.apply(field);
    }

    // AHRS/GPS 帧也能进入 RUNNING，但原点只取本帧测得的位置
    let entered = shared.health.on_data_frame(|| {
        shared.origin_pending.store(true, Ordering::Release);
    });
    if has_fix && shared.origin_pending.swap(false, Ordering::AcqRel) {
        let current = *shared.position.lock();
        shared.set_ned_origin(current);
    }
    Ok(if entered { Dispatch::Data } else { Dispatch::Ignored })
}

fn handlers() -> HandlerTable<Gx3Shared> {
    HandlerTable::new()
        .with(DescriptorSet::CommandBase, handle_command_reply)
        .with(DescriptorSet::Command3dm, handle_command_reply)
        .with(DescriptorSet::CommandNavFilter, handle_command_reply)
        .with(DescriptorSet::CommandSys, handle_command_reply)
        .with(DescriptorSet::DataAhrs, handle_data)
        .with(DescriptorSet::DataGps, handle_data)
        .with(DescriptorSet::DataNav, handle_data)
}

// ============================================================================
// 驱动
// ============================================================================

/// 3DM-GX3-35 惯导
pub struct Gx3Imu {
    shared: Arc<Gx3Shared>,
    lifecycle: Arc<DriverLifecycle>,
    metrics: Arc<DriverMetrics>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
    enabled: bool,
    _reinit_subscription: Option<Subscription>,
    _registration: Option<Registration>,
}

impl Gx3Imu {
    /// 在给定传输上启动驱动并开始初始化序列
    pub fn start<T>(
        transport: T,
        config: &Gx3Config,
        registry: &DriverRegistry,
    ) -> Result<Self, DriverError>
    where
        T: SplittableTransport,
    {
        config.validate()?;
        let (rx, tx) = transport.split()?;

        let lifecycle = DriverLifecycle::new(GX3_NAME, config.debug);
        let metrics = Arc::new(DriverMetrics::new());
        let commands = CommandChannel::new(
            Box::new(tx),
            Dialect::GX3,
            lifecycle.clone(),
            metrics.clone(),
        );
        let shared = Arc::new(Gx3Shared::new(config.clone(), commands, lifecycle.clone()));

        // Weak：订阅存放在 shared 内部的观察者表中
        let weak: Weak<Gx3Shared> = Arc::downgrade(&shared);
        let reinit_subscription = shared.health.reinit_requested().subscribe(move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.spawn_reinit();
            }
        });
        let registration = registry.register(lifecycle.clone());

        let rx_thread = {
            let shared = shared.clone();
            let metrics = metrics.clone();
            spawn_loop(&lifecycle, "rx", move |guard| {
                rx_loop(rx, Dialect::GX3, handlers(), shared, metrics, guard)
            })?
        };

        shared.spawn_reinit();

        Ok(Self {
            shared,
            lifecycle,
            metrics,
            threads: vec![("rx", rx_thread)],
            enabled: true,
            _reinit_subscription: Some(reinit_subscription),
            _registration: Some(registration),
        })
    }

    /// 打开配置中的串口并启动；失败时返回禁用的驱动
    pub fn open(config: &Gx3Config, registry: &DriverRegistry) -> Self {
        if !config.enabled {
            info!("{}: disabled in configuration", GX3_NAME);
            return Self::disabled(config);
        }

        let transport = match SerialTransport::open(&config.serial) {
            Ok(transport) => transport,
            Err(e) => {
                error!("{}: {}; driver disabled", GX3_NAME, e);
                return Self::disabled(config);
            },
        };

        match Self::start(transport, config, registry) {
            Ok(driver) => driver,
            Err(e) => {
                error!("{}: failed to start: {}; driver disabled", GX3_NAME, e);
                Self::disabled(config)
            },
        }
    }

    /// 不连接硬件的驱动：模式停留在 STARTUP，命令返回 `Disabled`
    pub fn disabled(config: &Gx3Config) -> Self {
        let lifecycle = DriverLifecycle::new(GX3_NAME, config.debug);
        lifecycle.terminate();
        let metrics = Arc::new(DriverMetrics::new());
        let commands = CommandChannel::new(
            Box::new(NullTx),
            Dialect::GX3,
            lifecycle.clone(),
            metrics.clone(),
        );
        Self {
            shared: Arc::new(Gx3Shared::new(config.clone(), commands, lifecycle.clone())),
            lifecycle,
            metrics,
            threads: Vec::new(),
            enabled: false,
            _reinit_subscription: None,
            _registration: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn mode(&self) -> DeviceMode {
        self.shared.health.mode()
    }

    /// 最近一次初始化序列已经跑完（不论 ACK 是否全部成功）
    pub fn is_initialized(&self) -> bool {
        self.shared.health.is_init_complete()
    }

    /// 模式变化（在 RX 线程上按转移顺序同步回调）
    pub fn mode_changed(&self) -> &Observers<ModeChange> {
        self.shared.health.mode_changed()
    }

    pub fn subscribe_mode<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ModeChange) + Send + Sync + 'static,
    {
        self.shared.health.mode_changed().subscribe(callback)
    }

    pub fn position(&self) -> GeodeticPosition {
        *self.shared.position.lock()
    }

    pub fn ned_origin(&self) -> GeodeticPosition {
        *self.shared.ned_origin.lock()
    }

    /// 手动设置原点；之后的第一个位置不再覆盖它
    pub fn set_ned_origin(&self, origin: GeodeticPosition) {
        self.shared.origin_pending.store(false, Ordering::Release);
        self.shared.set_ned_origin(origin);
    }

    /// 相对原点的 NED 位置（米）
    pub fn ned_position(&self) -> Vector3<f64> {
        let position = self.position();
        position.ned_relative_to(&self.ned_origin())
    }

    /// NED 速度（m/s）
    pub fn ned_velocity(&self) -> Vector3<f64> {
        *self.shared.velocity.lock()
    }

    /// (roll, pitch, yaw)，弧度
    pub fn euler(&self) -> Vector3<f64> {
        if self.use_nav_attitude() {
            *self.shared.nav_euler.lock()
        } else {
            *self.shared.ahrs_euler.lock()
        }
    }

    /// 机体角速度（rad/s）
    pub fn euler_rate(&self) -> Vector3<f64> {
        if self.use_nav_attitude() {
            *self.shared.nav_rate.lock()
        } else {
            *self.shared.ahrs_rate.lock()
        }
    }

    /// 机体系 → NED
    pub fn rotation(&self) -> Matrix3<f64> {
        euler_to_rotation(&self.euler())
    }

    pub fn heading_rotation(&self) -> Matrix3<f64> {
        geo::heading_rotation(self.euler().z)
    }

    pub fn use_nav_attitude(&self) -> bool {
        self.shared.use_nav_attitude.load(Ordering::Acquire)
    }

    /// 选择姿态来源：导航滤波器或 AHRS
    pub fn set_use_nav_attitude(&self, use_nav: bool) {
        let previous = self.shared.use_nav_attitude.swap(use_nav, Ordering::AcqRel);
        if previous != use_nav {
            let source = if use_nav { "nav filter" } else { "ahrs" };
            info!("{}: Attitude source changed to {}", GX3_NAME, source);
        }
    }

    pub fn filter_state(&self) -> Option<FilterState> {
        *self.shared.filter_state.lock()
    }

    /// 取走最近一条给操作员的状态消息
    pub fn take_status_message(&self) -> Option<String> {
        self.shared.status_message.lock().take()
    }

    pub fn status_messages(&self) -> &Observers<String> {
        &self.shared.status_messages
    }

    /// 复位导航滤波器（阻塞至 ACK 或超时）
    pub fn reset_filter(&self) -> Result<AckOutcome, DriverError> {
        self.command(&cmd::reset_filter(), "reset navigation filter")
    }

    /// 用 AHRS 姿态和配置的磁偏角初始化导航滤波器
    pub fn init_filter(&self) -> Result<AckOutcome, DriverError> {
        let frame = cmd::init_attitude_from_ahrs(self.shared.config.magnetic_declination_rad);
        self.command(&frame, "initialize filter from AHRS")
    }

    fn command(&self, frame: &Frame, name: &str) -> Result<AckOutcome, DriverError> {
        if !self.enabled {
            return Err(DriverError::Disabled(GX3_NAME.to_string()));
        }
        self.shared
            .commands
            .send_and_alert(frame, self.shared.config.ack_timeout(), name)
    }

    /// 请求重新运行初始化序列；已在运行时返回 `false`
    pub fn reinitialize(&self) -> bool {
        if !self.enabled || !self.lifecycle.is_running() {
            return false;
        }
        self.shared.spawn_reinit()
    }

    pub fn time_since_last_data(&self) -> Duration {
        self.shared.health.time_since_last_data()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for Gx3Imu {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.reinit_thread.lock().take() {
            self.threads.push(("init", handle));
        }
        shutdown_threads(&self.lifecycle, &mut self.threads, SHUTDOWN_JOIN_TIMEOUT);
    }
}

impl std::fmt::Debug for Gx3Imu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gx3Imu")
            .field("enabled", &self.enabled)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

/// 禁用驱动的发送端
struct NullTx;

impl heli_serial::TxTransport for NullTx {
    fn write_all(&mut self, _bytes: &[u8]) -> Result<(), heli_serial::SerialError> {
        Err(heli_serial::SerialError::Disconnected)
    }
}

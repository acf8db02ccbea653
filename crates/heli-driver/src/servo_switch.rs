//! 舵机切换板驱动
//!
//! 切换板位于接收机和舵机之间：手动模式下透传驾驶员输入，自动模式下
//! 输出飞控的 PULSE_COMMAND。驱动包含：
//!
//! - RX 线程：STATUS（驾驶模式）、PULSE_INPUTS（接收机脉宽）、
//!   AUXILIARY_INPUTS（发动机转速）
//! - TX 线程：以固定频率发送当前输出脉宽

use crate::DriverError;
use crate::activity::ActivityMonitor;
use crate::config::ServoSwitchConfig;
use crate::events::{Observers, Subscription};
use crate::lifecycle::{
    DriverLifecycle, DriverRegistry, Registration, shutdown_threads, spawn_loop,
};
use crate::metrics::{DriverMetrics, MetricsSnapshot};
use crate::pipeline::{Dispatch, HandlerTable, RxHooks, rx_loop};
use crate::rate::RateLimiter;
use crate::scheduler::{SendContext, WriteFailure, send_loop};
use heli_protocol::servo::{AuxMeasurement, CommandChannelState};
use heli_protocol::{ChannelSet, Dialect, Frame, PilotMode, ProtocolError, PulseWindow, ServoMessageId};
use heli_serial::{SerialTransport, SplittableTransport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// 注册表中的驱动名
pub const SERVO_SWITCH_NAME: &str = "servo_switch";

/// Drop 时等待收发线程退出的时间
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// RX 线程写入、外部读取的设备状态（每个字段独立加锁）
pub(crate) struct ServoState {
    window: PulseWindow,
    debug: bool,
    inputs: Mutex<ChannelSet>,
    outputs: Mutex<ChannelSet>,
    pilot_mode: AtomicU8,
    engine_speed_hz: Mutex<Option<f64>>,
    activity: ActivityMonitor,
    pilot_mode_changed: Observers<PilotMode>,
}

impl ServoState {
    fn new(window: PulseWindow, debug: bool) -> Self {
        Self {
            window,
            debug,
            inputs: Mutex::new(ChannelSet::default()),
            outputs: Mutex::new(ChannelSet::default()),
            pilot_mode: AtomicU8::new(PilotMode::Unknown.as_u8()),
            engine_speed_hz: Mutex::new(None),
            activity: ActivityMonitor::new(),
            pilot_mode_changed: Observers::new(),
        }
    }

    fn pilot_mode(&self) -> PilotMode {
        PilotMode::from_u8(self.pilot_mode.load(Ordering::Acquire))
    }

    /// 只在模式真正变化时通知
    fn set_pilot_mode(&self, mode: PilotMode) {
        let previous = self.pilot_mode.swap(mode.as_u8(), Ordering::AcqRel);
        if previous != mode.as_u8() {
            info!("{}: Pilot mode changed to {}", SERVO_SWITCH_NAME, mode);
            self.pilot_mode_changed.notify(&mode);
        }
    }
}

impl RxHooks for ServoState {}

// ============================================================================
// 处理器
// ============================================================================

fn handle_status(state: &ServoState, frame: &Frame) -> Result<Dispatch, ProtocolError> {
    let channel = CommandChannelState::parse(frame.payload())?;
    state.activity.register_data();
    match channel.pilot_mode() {
        Some(mode) => state.set_pilot_mode(mode),
        None => warn!(
            "{}: Command channel state signal not present on servo switch",
            SERVO_SWITCH_NAME
        ),
    }
    Ok(Dispatch::Data)
}

fn handle_pulse_inputs(state: &ServoState, frame: &Frame) -> Result<Dispatch, ProtocolError> {
    let accepted = state
        .inputs
        .lock()
        .apply_pulse_inputs(frame.payload(), &state.window)?;
    state.activity.register_data();
    if state.debug {
        trace!("{}: pulse inputs, {} channel(s) accepted", SERVO_SWITCH_NAME, accepted);
    }
    Ok(Dispatch::Data)
}

fn handle_aux_inputs(state: &ServoState, frame: &Frame) -> Result<Dispatch, ProtocolError> {
    let measurement = AuxMeasurement::parse(frame.payload())?;
    state.activity.register_data();
    match measurement {
        Some(m) => *state.engine_speed_hz.lock() = Some(m.speed_hz),
        None => debug!(
            "{}: discarded engine speed measurement (over range or zero period)",
            SERVO_SWITCH_NAME
        ),
    }
    Ok(Dispatch::Data)
}

/// 板卡会上报但飞控不使用的消息
fn handle_unused(state: &ServoState, _frame: &Frame) -> Result<Dispatch, ProtocolError> {
    state.activity.register_data();
    Ok(Dispatch::Ignored)
}

fn handlers() -> HandlerTable<ServoState> {
    HandlerTable::new()
        .with(ServoMessageId::Status, handle_status)
        .with(ServoMessageId::PulseInputs, handle_pulse_inputs)
        .with(ServoMessageId::AuxiliaryInputs, handle_aux_inputs)
        .with(ServoMessageId::ChannelSource, handle_unused)
        .with(ServoMessageId::PulseOutputs, handle_unused)
        .with(ServoMessageId::SystemConfiguration, handle_unused)
}

// ============================================================================
// 驱动
// ============================================================================

/// 舵机切换板
///
/// 构造时启动收发线程并登记到注册表；Drop 时终止并回收线程。
pub struct ServoSwitch {
    state: Arc<ServoState>,
    lifecycle: Arc<DriverLifecycle>,
    metrics: Arc<DriverMetrics>,
    write_failed: Observers<WriteFailure>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
    enabled: bool,
    _registration: Option<Registration>,
}

impl ServoSwitch {
    /// 在给定传输上启动驱动
    pub fn start<T>(
        transport: T,
        config: &ServoSwitchConfig,
        registry: &DriverRegistry,
    ) -> Result<Self, DriverError>
    where
        T: SplittableTransport,
    {
        config.validate()?;
        let limiter = RateLimiter::new(config.send_rate_hz)?;
        let (rx, tx) = transport.split()?;

        let lifecycle = DriverLifecycle::new(SERVO_SWITCH_NAME, config.debug);
        let metrics = Arc::new(DriverMetrics::new());
        let state = Arc::new(ServoState::new(config.pulse_window, config.debug));
        let write_failed = Observers::new();
        let registration = registry.register(lifecycle.clone());

        let rx_thread = {
            let state = state.clone();
            let metrics = metrics.clone();
            spawn_loop(&lifecycle, "rx", move |guard| {
                rx_loop(rx, Dialect::SERVO_SWITCH, handlers(), state, metrics, guard)
            })?
        };

        let ctx = SendContext {
            dialect: Dialect::SERVO_SWITCH,
            limiter,
            retry: config.write_retry,
            metrics: metrics.clone(),
            write_failed: write_failed.clone(),
        };
        let outputs = state.clone();
        let tx_thread = match spawn_loop(&lifecycle, "tx", move |guard| {
            send_loop(
                tx,
                move || Some(outputs.outputs.lock().pulse_command_frame()),
                ctx,
                guard,
            )
        }) {
            Ok(handle) => handle,
            Err(e) => {
                lifecycle.terminate();
                return Err(e);
            },
        };

        debug!(
            "{}: started, sending at {} Hz",
            SERVO_SWITCH_NAME, config.send_rate_hz
        );

        Ok(Self {
            state,
            lifecycle,
            metrics,
            write_failed,
            threads: vec![("rx", rx_thread), ("tx", tx_thread)],
            enabled: true,
            _registration: Some(registration),
        })
    }

    /// 打开配置中的串口并启动；失败时返回禁用的驱动
    pub fn open(config: &ServoSwitchConfig, registry: &DriverRegistry) -> Self {
        if !config.enabled {
            info!("{}: disabled in configuration", SERVO_SWITCH_NAME);
            return Self::disabled(config);
        }

        let transport = match SerialTransport::open(&config.serial) {
            Ok(transport) => transport,
            Err(e) => {
                error!("{}: {}; driver disabled", SERVO_SWITCH_NAME, e);
                return Self::disabled(config);
            },
        };

        match Self::start(transport, config, registry) {
            Ok(driver) => driver,
            Err(e) => {
                error!("{}: failed to start: {}; driver disabled", SERVO_SWITCH_NAME, e);
                Self::disabled(config)
            },
        }
    }

    /// 不连接硬件的驱动：读接口返回初始值，写接口只更新内存
    pub fn disabled(config: &ServoSwitchConfig) -> Self {
        let lifecycle = DriverLifecycle::new(SERVO_SWITCH_NAME, config.debug);
        lifecycle.terminate();
        Self {
            state: Arc::new(ServoState::new(config.pulse_window, config.debug)),
            lifecycle,
            metrics: Arc::new(DriverMetrics::new()),
            write_failed: Observers::new(),
            threads: Vec::new(),
            enabled: false,
            _registration: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 收发线程是否仍在运行
    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// 接收机输入脉宽（微秒）
    pub fn raw_inputs(&self) -> ChannelSet {
        *self.state.inputs.lock()
    }

    /// 当前输出脉宽（微秒）
    pub fn raw_outputs(&self) -> ChannelSet {
        *self.state.outputs.lock()
    }

    /// 设置输出脉宽，下一个发送周期生效
    ///
    /// 任一通道不在有效窗口内时整体拒绝，原输出保持不变。
    pub fn set_raw_outputs(&self, outputs: ChannelSet) -> Result<(), DriverError> {
        let window = self.state.window;
        if let Some((i, width)) = outputs
            .as_array()
            .iter()
            .enumerate()
            .find(|(_, w)| !window.contains(**w))
        {
            return Err(DriverError::InvalidInput(format!(
                "channel {} pulse width {} outside ({}, {})",
                i + 1,
                width,
                window.min,
                window.max
            )));
        }
        *self.state.outputs.lock() = outputs;
        Ok(())
    }

    pub fn pilot_mode(&self) -> PilotMode {
        self.state.pilot_mode()
    }

    /// 最近一次有效的发动机转速（Hz）
    pub fn engine_speed_hz(&self) -> Option<f64> {
        *self.state.engine_speed_hz.lock()
    }

    /// 驾驶模式变化（在 RX 线程上同步回调）
    pub fn pilot_mode_changed(&self) -> &Observers<PilotMode> {
        &self.state.pilot_mode_changed
    }

    pub fn subscribe_pilot_mode<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PilotMode) + Send + Sync + 'static,
    {
        self.state.pilot_mode_changed.subscribe(callback)
    }

    /// `WriteRetry::Bounded` 下被丢弃的出站帧
    pub fn write_failed(&self) -> &Observers<WriteFailure> {
        &self.write_failed
    }

    pub fn time_since_last_data(&self) -> Duration {
        self.state.activity.time_since_last_data()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for ServoSwitch {
    fn drop(&mut self) {
        shutdown_threads(&self.lifecycle, &mut self.threads, SHUTDOWN_JOIN_TIMEOUT);
    }
}

impl std::fmt::Debug for ServoSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServoSwitch")
            .field("enabled", &self.enabled)
            .field("running", &self.lifecycle.is_running())
            .field("pilot_mode", &self.pilot_mode())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heli_serial::{MockPeer, MockTransport};
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn start() -> (ServoSwitch, MockPeer, DriverRegistry) {
        let (transport, peer) = MockTransport::pair();
        let registry = DriverRegistry::new();
        let driver = ServoSwitch::start(transport, &ServoSwitchConfig::default(), &registry).unwrap();
        (driver, peer, registry)
    }

    fn inject(peer: &MockPeer, id: ServoMessageId, payload: &[u8]) {
        let frame = Frame::new(id.into(), payload).unwrap();
        peer.inject(&Dialect::SERVO_SWITCH.encode(&frame));
    }

    fn status_payload(channel_state: u8) -> [u8; 2] {
        [0x00, channel_state << 1]
    }

    #[test]
    fn test_pilot_mode_notifies_only_on_change() {
        let (driver, peer, _registry) = start();
        let (_sub, modes) = driver.pilot_mode_changed().subscribe_channel(8);

        inject(&peer, ServoMessageId::Status, &status_payload(1));
        inject(&peer, ServoMessageId::Status, &status_payload(1));
        inject(&peer, ServoMessageId::Status, &status_payload(3));
        inject(&peer, ServoMessageId::Status, &status_payload(2));

        assert_eq!(modes.recv_timeout(Duration::from_secs(1)).unwrap(), PilotMode::Manual);
        assert_eq!(modes.recv_timeout(Duration::from_secs(1)).unwrap(), PilotMode::Auto);
        assert!(modes.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(driver.pilot_mode(), PilotMode::Auto);
    }

    #[test]
    fn test_absent_signal_keeps_mode() {
        let (driver, peer, _registry) = start();
        inject(&peer, ServoMessageId::Status, &status_payload(1));
        assert!(wait_until(Duration::from_secs(1), || driver.pilot_mode() == PilotMode::Manual));

        inject(&peer, ServoMessageId::Status, &status_payload(0));
        inject(&peer, ServoMessageId::AuxiliaryInputs, &[0, 0, 0x00, 0x10]);
        assert!(wait_until(Duration::from_secs(1), || driver.engine_speed_hz().is_some()));
        assert_eq!(driver.pilot_mode(), PilotMode::Manual);
    }

    #[test]
    fn test_pulse_inputs_channel_eight_from_first_slot() {
        let (driver, peer, _registry) = start();

        // 槽位 0 = 1600（通道 8），槽位 8 = 1400
        let mut payload = Vec::new();
        payload.extend_from_slice(&1600u16.to_be_bytes());
        for ch in 1..=8u16 {
            let width = if ch == 8 { 1400 } else { 1000 + ch * 10 };
            payload.extend_from_slice(&width.to_be_bytes());
        }
        inject(&peer, ServoMessageId::PulseInputs, &payload);

        assert!(wait_until(Duration::from_secs(1), || driver.raw_inputs().channel(1) == Some(1010)));
        let inputs = driver.raw_inputs();
        assert_eq!(inputs.channel(8), Some(1600));
        assert_eq!(inputs.channel(7), Some(1070));
        assert_eq!(inputs.channel(9), Some(0));
    }

    #[test]
    fn test_out_of_window_inputs_keep_previous_value() {
        let (driver, peer, _registry) = start();
        let frame = |ch1: u16| {
            let mut payload = vec![0u8, 0];
            payload.extend_from_slice(&ch1.to_be_bytes());
            payload
        };

        inject(&peer, ServoMessageId::PulseInputs, &frame(1500));
        assert!(wait_until(Duration::from_secs(1), || driver.raw_inputs().channel(1) == Some(1500)));

        inject(&peer, ServoMessageId::PulseInputs, &frame(700));
        inject(&peer, ServoMessageId::PulseInputs, &frame(2300));
        assert!(wait_until(Duration::from_secs(1), || driver.metrics().frames_valid == 3));
        assert_eq!(driver.raw_inputs().channel(1), Some(1500));
    }

    #[test]
    fn test_engine_speed_discarded_on_over_range() {
        let (driver, peer, _registry) = start();
        // 周期 0x0271 = 625 tick = 20 ms → 50 Hz
        inject(&peer, ServoMessageId::AuxiliaryInputs, &[0, 0, 0x02, 0x71]);
        assert!(wait_until(Duration::from_secs(1), || driver.engine_speed_hz().is_some()));
        let speed = driver.engine_speed_hz().unwrap();
        assert!((speed - 50.0).abs() < 1e-9, "{}", speed);

        inject(&peer, ServoMessageId::AuxiliaryInputs, &[0, 0, 0x82, 0x00]);
        assert!(wait_until(Duration::from_secs(1), || driver.metrics().frames_valid == 2));
        assert_eq!(driver.engine_speed_hz(), Some(speed));
    }

    #[test]
    fn test_sends_pulse_command_at_rate() {
        let (driver, peer, _registry) = start();
        driver.set_raw_outputs(ChannelSet::splat(1500)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        peer.drain_written();

        let mut expected = vec![0x81, 0xA1, 20, 18];
        for _ in 0..9 {
            expected.extend_from_slice(&[0x05, 0xDC]);
        }
        expected.extend_from_slice(&[0x0F, 0x44]);

        let start = Instant::now();
        let mut frames = 0;
        while start.elapsed() < Duration::from_millis(200) {
            if let Some(written) = peer.recv_written(Duration::from_millis(50)) {
                assert_eq!(written, expected);
                frames += 1;
            }
        }
        assert!((6..=13).contains(&frames), "{} frames in 200 ms", frames);
    }

    #[test]
    fn test_set_raw_outputs_rejects_out_of_window() {
        let (driver, _peer, _registry) = start();
        driver.set_raw_outputs(ChannelSet::splat(1500)).unwrap();

        let mut bad = ChannelSet::splat(1500);
        bad.0[4] = 2500;
        let err = driver.set_raw_outputs(bad).unwrap_err();
        assert!(err.to_string().contains("channel 5"), "{}", err);
        assert_eq!(driver.raw_outputs(), ChannelSet::splat(1500));
    }

    #[test]
    fn test_registry_and_drop() {
        let (driver, _peer, registry) = start();
        assert_eq!(registry.names(), vec![SERVO_SWITCH_NAME]);
        assert!(driver.is_running());

        drop(driver);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_start_rejects_unrepresentable_rate() {
        let (transport, _peer) = MockTransport::pair();
        let registry = DriverRegistry::new();
        let config = ServoSwitchConfig {
            send_rate_hz: 1e-30,
            ..ServoSwitchConfig::default()
        };

        let result = ServoSwitch::start(transport, &config, &registry);
        assert!(matches!(result, Err(DriverError::Config(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_open_failure_yields_disabled_driver() {
        let registry = DriverRegistry::new();
        let mut config = ServoSwitchConfig::default();
        config.serial.path = "/dev/does-not-exist-servo".to_string();

        let driver = ServoSwitch::open(&config, &registry);
        assert!(!driver.is_enabled());
        assert!(!driver.is_running());
        assert!(registry.is_empty());
        assert_eq!(driver.pilot_mode(), PilotMode::Unknown);
        assert!(driver.set_raw_outputs(ChannelSet::splat(1500)).is_ok());
    }
}

//! 地面站遥测调度
//!
//! 一个固定频率（默认 200 Hz）的循环：每个周期按各数据流自己的频率
//! 收集消息，组成一批交给 [`TelemetrySink`]。消息编码和网络发送由 sink
//! 负责。
//!
//! 模式变化、驾驶模式变化和给操作员的状态文本通过观察者进入队列，
//! 每个周期最多发出一条文本。

use crate::DriverError;
use crate::config::TelemetryConfig;
use crate::events::Subscription;
use crate::geo::GeodeticPosition;
use crate::gx3::Gx3Imu;
use crate::lifecycle::{
    DriverLifecycle, DriverRegistry, LoopGuard, Registration, shutdown_threads, spawn_loop,
};
use crate::mode::DeviceMode;
use crate::rate::RateLimiter;
use crate::servo_switch::ServoSwitch;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use heli_protocol::{ChannelSet, PilotMode};
use nalgebra::Vector3;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 注册表中的名称
pub const TELEMETRY_NAME: &str = "telemetry";

/// 待发送状态文本的队列容量
const STATUS_QUEUE_CAPACITY: usize = 64;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 第 `count` 个周期是否发送频率为 `stream_hz` 的数据流
///
/// `stream_hz` 为 0 或高于 `send_hz` 时永不发送。不能整除时实际频率
/// 为 `send_hz / (send_hz / stream_hz)`（整数除法）。
pub fn should_run(stream_hz: u32, send_hz: u32, count: u64) -> bool {
    if stream_hz == 0 || stream_hz > send_hz {
        return false;
    }
    count % u64::from(send_hz / stream_hz) == 0
}

/// 一条遥测消息
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryMessage {
    Heartbeat {
        imu_mode: DeviceMode,
        pilot_mode: PilotMode,
        uptime: Duration,
    },
    Attitude {
        euler: Vector3<f64>,
        rate: Vector3<f64>,
    },
    Position {
        position: GeodeticPosition,
        origin: GeodeticPosition,
        ned: Vector3<f64>,
        velocity: Vector3<f64>,
    },
    RcChannels {
        inputs: ChannelSet,
        outputs: ChannelSet,
        engine_speed_hz: Option<f64>,
    },
    StatusText(String),
}

/// 遥测出口（编码 + 发送）
pub trait TelemetrySink: Send + 'static {
    fn send(&mut self, batch: &[TelemetryMessage]) -> Result<(), DriverError>;
}

/// 遥测读取的设备
#[derive(Clone)]
pub struct TelemetrySources {
    pub servo: Arc<ServoSwitch>,
    pub imu: Arc<Gx3Imu>,
}

/// 把文本放进队列；队列满时丢弃
fn enqueue(queue: &Sender<String>, text: String) {
    if let Err(TrySendError::Full(text)) = queue.try_send(text) {
        debug!("{}: status queue full, dropped '{}'", TELEMETRY_NAME, text);
    }
}

/// 地面站遥测链路
pub struct TelemetryLink {
    lifecycle: Arc<DriverLifecycle>,
    status_tx: Sender<String>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
    _subscriptions: Vec<Subscription>,
    _registration: Registration,
}

impl TelemetryLink {
    pub fn start<K: TelemetrySink>(
        config: &TelemetryConfig,
        sources: TelemetrySources,
        sink: K,
        registry: &DriverRegistry,
    ) -> Result<Self, DriverError> {
        config.validate()?;
        let limiter = RateLimiter::new(f64::from(config.send_rate_hz))?;
        let (status_tx, status_rx) = bounded(STATUS_QUEUE_CAPACITY);

        let subscriptions = vec![
            {
                let queue = status_tx.clone();
                sources
                    .imu
                    .status_messages()
                    .subscribe(move |text: &String| enqueue(&queue, text.clone()))
            },
            {
                let queue = status_tx.clone();
                sources.imu.subscribe_mode(move |change| {
                    enqueue(&queue, format!("GX3 mode {} -> {}", change.from, change.to))
                })
            },
            {
                let queue = status_tx.clone();
                sources.servo.subscribe_pilot_mode(move |mode| {
                    enqueue(&queue, format!("Pilot mode changed to {}", mode))
                })
            },
        ];

        let lifecycle = DriverLifecycle::new(TELEMETRY_NAME, false);
        let registration = registry.register(lifecycle.clone());
        let rates = config.clone();
        let handle = spawn_loop(&lifecycle, "tx", move |guard| {
            telemetry_loop(rates, limiter, sources, sink, status_rx, guard)
        })?;

        Ok(Self {
            lifecycle,
            status_tx,
            threads: vec![("tx", handle)],
            _subscriptions: subscriptions,
            _registration: registration,
        })
    }

    /// 排队一条给操作员的文本（控制模式变化等）
    pub fn queue_status_text(&self, text: impl Into<String>) {
        enqueue(&self.status_tx, text.into());
    }

    /// 供其他线程排队文本的发送端
    pub fn status_sender(&self) -> Sender<String> {
        self.status_tx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

impl Drop for TelemetryLink {
    fn drop(&mut self) {
        shutdown_threads(&self.lifecycle, &mut self.threads, SHUTDOWN_JOIN_TIMEOUT);
    }
}

fn collect(
    config: &TelemetryConfig,
    sources: &TelemetrySources,
    count: u64,
    started: Instant,
    batch: &mut Vec<TelemetryMessage>,
) {
    let send_hz = config.send_rate_hz;
    let TelemetrySources { servo, imu } = sources;

    if should_run(config.heartbeat_hz, send_hz, count) {
        batch.push(TelemetryMessage::Heartbeat {
            imu_mode: imu.mode(),
            pilot_mode: servo.pilot_mode(),
            uptime: started.elapsed(),
        });
    }
    if should_run(config.attitude_hz, send_hz, count) {
        batch.push(TelemetryMessage::Attitude {
            euler: imu.euler(),
            rate: imu.euler_rate(),
        });
    }
    if should_run(config.rc_channels_hz, send_hz, count) {
        batch.push(TelemetryMessage::RcChannels {
            inputs: servo.raw_inputs(),
            outputs: servo.raw_outputs(),
            engine_speed_hz: servo.engine_speed_hz(),
        });
    }
    if should_run(config.position_hz, send_hz, count) {
        let position = imu.position();
        let origin = imu.ned_origin();
        batch.push(TelemetryMessage::Position {
            position,
            origin,
            ned: position.ned_relative_to(&origin),
            velocity: imu.ned_velocity(),
        });
    }
}

fn telemetry_loop<K: TelemetrySink>(
    config: TelemetryConfig,
    mut limiter: RateLimiter,
    sources: TelemetrySources,
    mut sink: K,
    status_rx: Receiver<String>,
    guard: LoopGuard,
) {
    let lifecycle = guard.lifecycle().clone();
    let started = Instant::now();
    let mut batch = Vec::new();
    let mut count: u64 = 0;

    loop {
        if !lifecycle.is_running() {
            trace!("{}: TX thread: is_running flag is false, exiting", TELEMETRY_NAME);
            break;
        }

        limiter.wait();

        batch.clear();
        collect(&config, &sources, count, started, &mut batch);
        // 每个周期最多一条文本
        if let Ok(text) = status_rx.try_recv() {
            batch.push(TelemetryMessage::StatusText(text));
        }
        limiter.finished_critical_section();

        if !batch.is_empty()
            && let Err(e) = sink.send(&batch)
        {
            warn!("{}: failed to send {} message(s): {}", TELEMETRY_NAME, batch.len(), e);
        }

        count = count.wrapping_add(1);
    }

    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Gx3Config, ServoSwitchConfig};
    use heli_serial::{MockPeer, MockTransport};

    struct ChannelSink(Sender<Vec<TelemetryMessage>>);

    impl TelemetrySink for ChannelSink {
        fn send(&mut self, batch: &[TelemetryMessage]) -> Result<(), DriverError> {
            self.0
                .send(batch.to_vec())
                .map_err(|_| DriverError::ChannelClosed)
        }
    }

    struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn send(&mut self, _batch: &[TelemetryMessage]) -> Result<(), DriverError> {
            Err(DriverError::ChannelClosed)
        }
    }

    fn sources(registry: &DriverRegistry) -> (TelemetrySources, MockPeer, MockPeer) {
        let (servo_transport, servo_peer) = MockTransport::pair();
        let (imu_transport, imu_peer) = MockTransport::pair();
        let servo = ServoSwitch::start(servo_transport, &ServoSwitchConfig::default(), registry)
            .unwrap();
        let imu_config = Gx3Config {
            ack_timeout_ms: 50,
            ..Gx3Config::default()
        };
        let imu = Gx3Imu::start(imu_transport, &imu_config, registry).unwrap();
        (
            TelemetrySources {
                servo: Arc::new(servo),
                imu: Arc::new(imu),
            },
            servo_peer,
            imu_peer,
        )
    }

    #[test]
    fn test_should_run() {
        assert!(should_run(1, 200, 0));
        assert!(!should_run(1, 200, 199));
        assert!(should_run(1, 200, 200));
        assert!(should_run(10, 200, 40));
        assert!(!should_run(10, 200, 41));
        assert!(should_run(200, 200, 7));
        assert!(!should_run(0, 200, 0));
        assert!(!should_run(300, 200, 0));
        // 200 / 3 = 66
        assert!(should_run(3, 200, 66));
        assert!(!should_run(3, 200, 67));
    }

    proptest::proptest! {
        /// 一秒内的发送次数不少于请求的频率，也不到两倍
        #[test]
        fn prop_should_run_never_undersends(send in 1u32..1000, stream_fraction in 0.0f64..1.0) {
            let stream = ((f64::from(send) * stream_fraction) as u32).max(1);
            let runs = (0..u64::from(send)).filter(|&c| should_run(stream, send, c)).count() as u32;
            proptest::prop_assert!(runs >= stream);
            proptest::prop_assert!(runs < 2 * stream);
        }
    }

    #[test]
    fn test_stream_rates() {
        let registry = DriverRegistry::new();
        let (sources, _servo_peer, _imu_peer) = sources(&registry);
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = TelemetryConfig {
            send_rate_hz: 100,
            heartbeat_hz: 10,
            attitude_hz: 50,
            position_hz: 0,
            rc_channels_hz: 20,
            ..TelemetryConfig::default()
        };

        let link = TelemetryLink::start(&config, sources, ChannelSink(tx), &registry).unwrap();
        std::thread::sleep(Duration::from_millis(500));
        drop(link);

        let mut heartbeats = 0;
        let mut attitudes = 0;
        let mut rc = 0;
        for batch in rx.try_iter() {
            for message in batch {
                match message {
                    TelemetryMessage::Heartbeat { .. } => heartbeats += 1,
                    TelemetryMessage::Attitude { .. } => attitudes += 1,
                    TelemetryMessage::RcChannels { .. } => rc += 1,
                    TelemetryMessage::Position { .. } => panic!("position stream is disabled"),
                    TelemetryMessage::StatusText(_) => {},
                }
            }
        }

        // 500 ms：约 5 / 25 / 10
        assert!((3..=7).contains(&heartbeats), "heartbeats {}", heartbeats);
        assert!((18..=28).contains(&attitudes), "attitudes {}", attitudes);
        assert!((7..=12).contains(&rc), "rc {}", rc);
        assert!(attitudes > rc && rc > heartbeats);
    }

    #[test]
    fn test_status_text_queued_from_observers() {
        let registry = DriverRegistry::new();
        let (sources, servo_peer, _imu_peer) = sources(&registry);
        let (tx, rx) = crossbeam_channel::unbounded();

        let link = TelemetryLink::start(
            &TelemetryConfig::default(),
            sources,
            ChannelSink(tx),
            &registry,
        )
        .unwrap();
        link.queue_status_text("Controller mode changed to attitude stabilization");

        let status = heli_protocol::Frame::new(10, &[0x00, 0x02]).unwrap();
        servo_peer.inject(&heli_protocol::Dialect::SERVO_SWITCH.encode(&status));

        let queued = "Controller mode changed to attitude stabilization".to_string();
        let pilot = "Pilot mode changed to Manual".to_string();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut texts: Vec<String> = Vec::new();
        while Instant::now() < deadline && !(texts.contains(&queued) && texts.contains(&pilot)) {
            if let Ok(batch) = rx.recv_timeout(Duration::from_millis(50)) {
                let in_batch = batch
                    .into_iter()
                    .filter_map(|m| match m {
                        TelemetryMessage::StatusText(text) => Some(text),
                        _ => None,
                    })
                    .collect::<Vec<_>>();
                assert!(in_batch.len() <= 1);
                texts.extend(in_batch);
            }
        }

        assert!(texts.contains(&queued), "{:?}", texts);
        assert!(texts.contains(&pilot), "{:?}", texts);
    }

    #[test]
    fn test_sink_failure_does_not_stop_loop() {
        let registry = DriverRegistry::new();
        let (sources, _servo_peer, _imu_peer) = sources(&registry);
        let link =
            TelemetryLink::start(&TelemetryConfig::default(), sources, FailingSink, &registry)
                .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(link.is_running());
        assert_eq!(registry.len(), 3);

        let report = registry.terminate_all(Duration::from_secs(3));
        assert!(report.is_clean(), "{:?}", report);
    }
}

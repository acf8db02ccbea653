//! 注册表与整机关闭测试

mod common;

use common::*;
use heli_driver::config::{AutopilotConfig, Gx3Config, ServoSwitchConfig};
use heli_driver::control::{AttitudeLaw, AttitudeReference, BadControl, Effort, TranslationLaw};
use heli_driver::{
    AppContext, ControlArbiter, ControllerMode, DriverError, DriverRegistry, Gx3Imu, ServoSwitch,
    TelemetryMessage, TelemetrySink,
};
use heli_serial::MockTransport;
use nalgebra::Vector3;
use std::time::Duration;

struct ChannelSink(crossbeam_channel::Sender<Vec<TelemetryMessage>>);

impl TelemetrySink for ChannelSink {
    fn send(&mut self, batch: &[TelemetryMessage]) -> Result<(), DriverError> {
        self.0.send(batch.to_vec()).map_err(|_| DriverError::ChannelClosed)
    }
}

struct Level;

impl AttitudeLaw for Level {
    fn step(&mut self, _reference: &AttitudeReference) -> Result<Effort, BadControl> {
        Ok([0.0; 6])
    }
}

struct NoFix;

impl TranslationLaw for NoFix {
    fn runnable(&self) -> bool {
        false
    }

    fn step(&mut self, _reference_ned: &Vector3<f64>) -> Result<AttitudeReference, BadControl> {
        Err(BadControl::new("no fix"))
    }
}

fn context() -> (
    AppContext,
    heli_serial::MockPeer,
    heli_serial::MockPeer,
    crossbeam_channel::Receiver<Vec<TelemetryMessage>>,
) {
    let mut config = AutopilotConfig::default();
    config.imu.ack_timeout_ms = 50;
    config.shutdown_grace_ms = 2000;

    let registry = DriverRegistry::new();
    let (servo_transport, servo_peer) = MockTransport::pair();
    let (imu_transport, imu_peer) = MockTransport::pair();
    let servo = ServoSwitch::start(servo_transport, &config.servo, &registry).unwrap();
    let imu = Gx3Imu::start(imu_transport, &config.imu, &registry).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let ctx = AppContext::with_drivers(&config, registry, servo, imu, ChannelSink(tx)).unwrap();
    (ctx, servo_peer, imu_peer, rx)
}

#[test]
fn test_terminate_all_stops_every_loop() {
    let (ctx, _servo_peer, imu_peer, _rx) = context();
    let _responder = spawn_gx3_responder(imu_peer.clone(), &[]);

    let mut names = ctx.registry().names();
    names.sort();
    assert_eq!(names, vec!["gx3", "servo_switch", "telemetry"]);
    assert!(wait_until(Duration::from_secs(2), || ctx.imu().is_initialized()));

    let report = ctx.shutdown();
    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.terminated, 3);
    assert!(!ctx.servo().is_running());
    assert!(!ctx.imu().is_running());
    assert!(!ctx.telemetry().unwrap().is_running());
}

#[test]
fn test_telemetry_reports_device_state() {
    let (ctx, servo_peer, imu_peer, rx) = context();
    let _responder = spawn_gx3_responder(imu_peer.clone(), &[]);
    assert!(wait_until(Duration::from_secs(2), || ctx.imu().is_initialized()));

    inject_servo(&servo_peer, heli_protocol::ServoMessageId::Status, &servo_status(1));
    imu_peer.inject(&gx3_nav_frame(45.0, 7.0, 250.0, [0.0; 3]));
    assert!(wait_until(Duration::from_secs(1), || ctx.imu().mode().is_running()));

    let mut saw_position = false;
    let mut texts = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let done = |saw_position: bool, texts: &[String]| {
        saw_position
            && texts.iter().any(|t| t == "Pilot mode changed to Manual")
            && texts.iter().any(|t| t.starts_with("GX3 mode") && t.ends_with("RUNNING"))
    };
    while std::time::Instant::now() < deadline && !done(saw_position, &texts) {
        let Ok(batch) = rx.recv_timeout(Duration::from_millis(50)) else {
            continue;
        };
        for message in batch {
            match message {
                TelemetryMessage::Position { position, .. } if position.latitude_deg() == 45.0 => {
                    saw_position = true
                },
                TelemetryMessage::StatusText(text) => texts.push(text),
                _ => {},
            }
        }
    }

    assert!(done(saw_position, &texts), "position {} texts {:?}", saw_position, texts);
    assert!(ctx.shutdown().is_clean());
}

#[test]
fn test_controller_fallback_reaches_telemetry() {
    let (mut ctx, _servo_peer, _imu_peer, rx) = context();
    let mut arbiter = ControlArbiter::new(Box::new(Level), Box::new(NoFix), Box::new(NoFix));
    ctx.watch_controller(&arbiter);

    arbiter.set_mode(ControllerMode::PositionHoldPid);
    let out = arbiter.step(&Vector3::zeros()).unwrap();
    assert_eq!(out.mode, ControllerMode::AttitudeStabilizationPid);

    let expected = format!("Controller mode changed to {}", ControllerMode::AttitudeStabilizationPid);
    assert!(wait_until(Duration::from_secs(2), || {
        rx.try_iter()
            .flatten()
            .any(|m| m == TelemetryMessage::StatusText(expected.clone()))
    }));
    assert!(ctx.shutdown().is_clean());
}

#[test]
fn test_disabled_devices_are_not_registered() {
    let registry = DriverRegistry::new();
    let servo = ServoSwitch::disabled(&ServoSwitchConfig::default());
    let imu = Gx3Imu::disabled(&Gx3Config::default());
    assert!(registry.is_empty());
    assert!(!servo.is_enabled());
    assert!(matches!(imu.reset_filter(), Err(DriverError::Disabled(_))));
    assert_eq!(registry.terminate_all(Duration::from_millis(10)).terminated, 0);
}

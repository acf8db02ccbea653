//! 集成测试共用的设备模拟工具

#![allow(dead_code)]

use heli_protocol::{Dialect, FIELD_ACK, Frame, ServoMessageId};
use heli_serial::MockPeer;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

// ============================================================================
// 舵机切换板
// ============================================================================

pub fn inject_servo(peer: &MockPeer, id: ServoMessageId, payload: &[u8]) {
    let frame = Frame::new(id.into(), payload).unwrap();
    peer.inject(&Dialect::SERVO_SWITCH.encode(&frame));
}

/// STATUS 负载，`channel_state` 为 2 bit 的命令通道状态
pub fn servo_status(channel_state: u8) -> [u8; 2] {
    [0x00, channel_state << 1]
}

/// PULSE_INPUTS 负载：槽位 0 为通道 8，槽位 1..=8 为通道 1..=8
pub fn servo_pulse_inputs(channels: [u16; 8]) -> Vec<u8> {
    let mut payload = channels[7].to_be_bytes().to_vec();
    for width in channels {
        payload.extend_from_slice(&width.to_be_bytes());
    }
    payload
}

/// 解码一次写入的 PULSE_COMMAND，返回 9 个脉宽
pub fn decode_pulse_command(wire: &[u8]) -> [u16; 9] {
    let (frame, _) = Dialect::SERVO_SWITCH.decode(&wire[2..]).unwrap();
    assert_eq!(frame.id, u8::from(ServoMessageId::PulseCommand));
    let mut widths = [0u16; 9];
    for (i, chunk) in frame.payload().chunks_exact(2).enumerate() {
        widths[i] = u16::from_be_bytes([chunk[0], chunk[1]]);
    }
    widths
}

// ============================================================================
// 3DM-GX3
// ============================================================================

/// 设备一侧：对每条命令回复 ACK，`nack` 中的命令回复错误码 3。
/// 500 ms 没有新命令后退出，返回收到的命令描述符。
pub fn spawn_gx3_responder(peer: MockPeer, nack: &'static [u8]) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut commands = Vec::new();
        while let Some(wire) = peer.recv_written(Duration::from_millis(500)) {
            let (frame, _) = Dialect::GX3.decode(&wire[2..]).unwrap();
            let command = frame.payload()[1];
            commands.push(command);
            let code = if nack.contains(&command) { 3 } else { 0 };
            let reply = Frame::new(frame.id, &[0x04, FIELD_ACK, command, code]).unwrap();
            peer.inject(&Dialect::GX3.encode(&reply));
        }
        commands
    })
}

/// NAV 数据帧：LLH 位置 + NED 速度
pub fn gx3_nav_frame(lat: f64, lon: f64, height: f64, velocity: [f32; 3]) -> Vec<u8> {
    let mut payload = vec![28, 0x01];
    payload.extend_from_slice(&lat.to_be_bytes());
    payload.extend_from_slice(&lon.to_be_bytes());
    payload.extend_from_slice(&height.to_be_bytes());
    payload.extend_from_slice(&1u16.to_be_bytes());

    payload.extend_from_slice(&[16, 0x02]);
    for v in velocity {
        payload.extend_from_slice(&v.to_be_bytes());
    }
    payload.extend_from_slice(&1u16.to_be_bytes());

    Dialect::GX3.encode(&Frame::new(0x82, &payload).unwrap())
}

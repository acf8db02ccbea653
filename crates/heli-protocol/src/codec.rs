//! 帧编解码模块
//!
//! 线上格式（两种方言相同）：
//!
//! ```text
//! | marker0 | marker1 | id | len | payload (len 字节) | ck0 | ck1 |
//! ```
//!
//! 校验和为双字节累加和（Fletcher 风格），每一步都按 8 位回绕：
//! `ck0 += byte; ck1 += ck0`。两种方言只在种子上不同。

use crate::{Frame, MAX_PAYLOAD_LEN, ProtocolError};

/// 帧头长度（id + len）
pub const HEADER_LEN: usize = 2;

/// 校验和长度
pub const CHECKSUM_LEN: usize = 2;

/// 校验和种子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumSeed {
    /// 舵机切换板：`(id + count, 2 * id + count)`，之后只累加负载
    IdAndCount,
    /// GX3：从 `(0, 0)` 开始，依次累加 id、len 和负载
    Zero,
}

impl ChecksumSeed {
    fn initial(self, id: u8, count: u8) -> [u8; 2] {
        match self {
            ChecksumSeed::IdAndCount => [
                id.wrapping_add(count),
                id.wrapping_mul(2).wrapping_add(count),
            ],
            ChecksumSeed::Zero => {
                let mut state = [0u8; 2];
                accumulate(&mut state, &[id, count]);
                state
            },
        }
    }
}

/// 累加递推：`word0 += byte; word1 += word0`（mod 256）
pub fn accumulate(state: &mut [u8; 2], bytes: &[u8]) {
    for &byte in bytes {
        state[0] = state[0].wrapping_add(byte);
        state[1] = state[1].wrapping_add(state[0]);
    }
}

/// 线上方言：同步标记 + 校验和种子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    /// 方言名称（用于日志）
    pub name: &'static str,
    /// 帧前的双字节同步标记
    pub marker: [u8; 2],
    /// 校验和种子
    pub seed: ChecksumSeed,
}

impl Dialect {
    /// 9 通道舵机切换板
    pub const SERVO_SWITCH: Dialect = Dialect {
        name: "servo-switch",
        marker: [0x81, 0xA1],
        seed: ChecksumSeed::IdAndCount,
    };

    /// 3DM-GX3 导航传感器
    pub const GX3: Dialect = Dialect {
        name: "gx3",
        marker: [0x75, 0x65],
        seed: ChecksumSeed::Zero,
    };

    /// 计算校验和
    ///
    /// `payload` 超过 255 字节时长度字段按 8 位截断；正常路径上
    /// [`Frame`] 已保证不会出现这种情况。
    pub fn checksum(&self, id: u8, payload: &[u8]) -> [u8; 2] {
        let mut state = self.seed.initial(id, payload.len() as u8);
        accumulate(&mut state, payload);
        state
    }

    /// 编码后完整帧长度（含标记与校验和）
    pub fn encoded_len(payload_len: usize) -> usize {
        2 + HEADER_LEN + payload_len + CHECKSUM_LEN
    }

    /// 编码：标记、id、len、负载、两个校验字节
    pub fn encode(&self, frame: &Frame) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(frame.len() as usize));
        self.encode_into(frame, &mut out);
        out
    }

    /// 编码到已有缓冲（追加，不清空）
    pub fn encode_into(&self, frame: &Frame, out: &mut Vec<u8>) {
        let payload = frame.payload();
        out.extend_from_slice(&self.marker);
        out.push(frame.id);
        out.push(frame.len());
        out.extend_from_slice(payload);
        out.extend_from_slice(&self.checksum(frame.id, payload));
    }

    /// 解码一帧
    ///
    /// `bytes` 从消息 ID 开始（同步标记已被消费）。成功时返回帧以及
    /// 消费的字节数（`4 + len`）。
    pub fn decode(&self, bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }

        let id = bytes[0];
        let len = bytes[1] as usize;
        let total = HEADER_LEN + len + CHECKSUM_LEN;
        if bytes.len() < total {
            return Err(ProtocolError::Truncated {
                needed: total,
                available: bytes.len(),
            });
        }

        let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
        let actual = [bytes[HEADER_LEN + len], bytes[HEADER_LEN + len + 1]];
        let expected = self.checksum(id, payload);
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        debug_assert!(len <= MAX_PAYLOAD_LEN);
        Ok((Frame::new(id, payload)?, total))
    }
}

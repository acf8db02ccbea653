//! 同步标记状态机
//!
//! 字节流中除了双字节标记外没有其他分隔符。`MarkerSync` 逐字节检查输入，
//! 在看到完整标记时返回 `true`，与帧内容无关。

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// 未看到任何标记字节
    #[default]
    None,
    /// 已看到 marker[0]，等待 marker[1]
    GotMarker1,
}

/// 双字节标记检测器
#[derive(Debug, Clone)]
pub struct MarkerSync {
    marker: [u8; 2],
    state: SyncState,
}

impl MarkerSync {
    pub fn new(marker: [u8; 2]) -> Self {
        Self {
            marker,
            state: SyncState::None,
        }
    }

    /// 输入一个字节，完成同步时返回 `true` 并复位到 `None`
    pub fn push(&mut self, byte: u8) -> bool {
        match self.state {
            SyncState::None => {
                if byte == self.marker[0] {
                    self.state = SyncState::GotMarker1;
                }
                false
            },
            SyncState::GotMarker1 => {
                if byte == self.marker[1] {
                    self.state = SyncState::None;
                    true
                } else {
                    // 连续的 marker[0] 保持在 GotMarker1
                    if byte != self.marker[0] {
                        self.state = SyncState::None;
                    }
                    false
                }
            },
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = SyncState::None;
    }
}

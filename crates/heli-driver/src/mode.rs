//! 设备运行模式
//!
//! `DeviceMode` 由健康状态机（`health` 模块）独占写入；其他代码只能读取。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 设备运行模式
///
/// - **Startup**: 驱动刚创建，尚未开始初始化
/// - **Init**: 初始化命令序列进行中
/// - **Running**: 初始化完成并收到了有效数据
/// - **Error**: 数据中断超过看门狗阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DeviceMode {
    #[default]
    Startup = 0,
    Init = 1,
    Running = 2,
    Error = 3,
}

impl DeviceMode {
    /// 无效值视为 Startup
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Init,
            2 => Self::Running,
            3 => Self::Error,
            _ => Self::Startup,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceMode::Startup => "STARTUP",
            DeviceMode::Init => "INIT",
            DeviceMode::Running => "RUNNING",
            DeviceMode::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// 原子版本，用于线程间共享
#[derive(Debug)]
pub struct AtomicDeviceMode {
    inner: AtomicU8,
}

impl AtomicDeviceMode {
    pub fn new(mode: DeviceMode) -> Self {
        Self {
            inner: AtomicU8::new(mode.as_u8()),
        }
    }

    pub fn get(&self, ordering: Ordering) -> DeviceMode {
        DeviceMode::from_u8(self.inner.load(ordering))
    }

    /// 仅供状态机的转移函数调用
    pub(crate) fn set(&self, mode: DeviceMode, ordering: Ordering) {
        self.inner.store(mode.as_u8(), ordering);
    }
}

impl Default for AtomicDeviceMode {
    fn default() -> Self {
        Self::new(DeviceMode::Startup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_mode_conversions() {
        for mode in [
            DeviceMode::Startup,
            DeviceMode::Init,
            DeviceMode::Running,
            DeviceMode::Error,
        ] {
            assert_eq!(DeviceMode::from_u8(mode.as_u8()), mode);
        }
        assert_eq!(DeviceMode::from_u8(200), DeviceMode::Startup);
        assert!(DeviceMode::Running.is_running());
        assert!(!DeviceMode::Error.is_running());
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceMode::Running.to_string(), "RUNNING");
        assert_eq!(DeviceMode::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_atomic_device_mode() {
        let mode = AtomicDeviceMode::default();
        assert_eq!(mode.get(Ordering::Relaxed), DeviceMode::Startup);
        mode.set(DeviceMode::Init, Ordering::Release);
        assert_eq!(mode.get(Ordering::Acquire), DeviceMode::Init);
    }
}

//! 消息 ID 常量定义和枚举
//!
//! - 舵机切换板：单字节消息 ID
//! - GX3：描述符集（帧 ID）+ 字段描述符（负载内）

use num_enum::{IntoPrimitive, TryFromPrimitive};

// ============================================================================
// 舵机切换板消息 ID
// ============================================================================

/// 舵机切换板消息 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ServoMessageId {
    // 上行（板 → 飞控）
    /// 命令通道状态
    Status = 10,
    /// 通道来源
    ChannelSource = 11,
    /// 当前输出脉宽
    PulseOutputs = 12,
    /// 接收机输入脉宽
    PulseInputs = 13,
    /// 辅助输入（发动机转速等）
    AuxiliaryInputs = 14,
    /// 系统配置
    SystemConfiguration = 15,

    // 下行（飞控 → 板）
    /// 输出脉宽指令
    PulseCommand = 20,
    /// 辅助输出
    AuxiliaryOutputs = 21,
    /// 立即锁定
    LockoutNow = 98,
}

impl ServoMessageId {
    /// 是否为板卡发出的消息
    pub fn is_inbound(self) -> bool {
        (self as u8) < 20
    }
}

/// 舵机切换板物理通道数
pub const SERVO_CHANNEL_COUNT: usize = 9;

// ============================================================================
// GX3 描述符集
// ============================================================================

/// GX3 描述符集（帧 ID）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DescriptorSet {
    /// 基础命令
    CommandBase = 0x01,
    /// 3DM 命令
    Command3dm = 0x0C,
    /// 导航滤波器命令
    CommandNavFilter = 0x0D,
    /// 系统命令
    CommandSys = 0x7F,
    /// AHRS 数据
    DataAhrs = 0x80,
    /// GPS 数据
    DataGps = 0x81,
    /// NAV 数据
    DataNav = 0x82,
}

impl DescriptorSet {
    /// 是否为命令集（其回复中携带 ACK 字段）
    pub fn is_command(self) -> bool {
        (self as u8) < 0x80
    }

    /// 是否为数据流集
    pub fn is_data(self) -> bool {
        !self.is_command()
    }
}

/// 命令回复中的 ACK/NACK 字段描述符
pub const FIELD_ACK: u8 = 0xF1;

/// 基础命令字段（描述符集 0x01）
pub mod base {
    pub const PING: u8 = 0x01;
    pub const SET_TO_IDLE: u8 = 0x02;
    pub const RESUME: u8 = 0x06;
}

/// 3DM 命令字段（描述符集 0x0C）
pub mod cmd_3dm {
    pub const AHRS_MESSAGE_FORMAT: u8 = 0x08;
    pub const GPS_MESSAGE_FORMAT: u8 = 0x09;
    pub const NAV_MESSAGE_FORMAT: u8 = 0x0A;
    pub const ENABLE_STREAM: u8 = 0x11;
}

/// 导航滤波器命令字段（描述符集 0x0D）
pub mod nav_filter {
    pub const RESET_FILTER: u8 = 0x01;
    pub const INIT_ATTITUDE_FROM_AHRS: u8 = 0x04;
    pub const VEHICLE_DYNAMICS_MODE: u8 = 0x10;
}

/// AHRS 数据字段（描述符集 0x80）
pub mod ahrs {
    pub const SCALED_GYRO: u8 = 0x05;
    pub const EULER_ANGLES: u8 = 0x0C;
}

/// NAV 数据字段（描述符集 0x82）
pub mod nav {
    pub const LLH_POSITION: u8 = 0x01;
    pub const NED_VELOCITY: u8 = 0x02;
    pub const EULER_ANGLES: u8 = 0x05;
    pub const COMPENSATED_ANGULAR_RATE: u8 = 0x0E;
    pub const FILTER_STATUS: u8 = 0x10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servo_ids_wire_values() {
        assert_eq!(u8::from(ServoMessageId::Status), 10);
        assert_eq!(u8::from(ServoMessageId::PulseInputs), 13);
        assert_eq!(u8::from(ServoMessageId::AuxiliaryInputs), 14);
        assert_eq!(u8::from(ServoMessageId::PulseCommand), 20);
        assert_eq!(u8::from(ServoMessageId::LockoutNow), 98);
    }

    #[test]
    fn test_servo_id_try_from() {
        assert_eq!(
            ServoMessageId::try_from(15).ok(),
            Some(ServoMessageId::SystemConfiguration)
        );
        assert!(ServoMessageId::try_from(16).is_err());
        assert!(ServoMessageId::try_from(0).is_err());
    }

    #[test]
    fn test_servo_id_direction() {
        assert!(ServoMessageId::Status.is_inbound());
        assert!(ServoMessageId::SystemConfiguration.is_inbound());
        assert!(!ServoMessageId::PulseCommand.is_inbound());
        assert!(!ServoMessageId::LockoutNow.is_inbound());
    }

    #[test]
    fn test_descriptor_set_classification() {
        assert!(DescriptorSet::CommandBase.is_command());
        assert!(DescriptorSet::CommandSys.is_command());
        assert!(DescriptorSet::DataAhrs.is_data());
        assert!(DescriptorSet::DataNav.is_data());
        assert_eq!(DescriptorSet::try_from(0x82).ok(), Some(DescriptorSet::DataNav));
        assert!(DescriptorSet::try_from(0x83).is_err());
    }
}

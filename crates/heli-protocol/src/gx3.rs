//! 3DM-GX3 字段解析与命令构建
//!
//! GX3 帧负载由若干字段组成：
//!
//! ```text
//! | field_len | field_descriptor | data (field_len - 2 字节) | ...
//! ```
//!
//! `field_len` 包含自身和描述符两个字节。命令回复中带有 ACK 字段
//! （描述符 `0xF1`，数据为 `[回显命令, 错误码]`）。

use crate::ids::{DescriptorSet, FIELD_ACK, ahrs, base, cmd_3dm, nav, nav_filter};
use crate::{Frame, ProtocolError, read_f32_be, read_f64_be};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

/// 消息格式命令中的函数选择子：使用新设置
pub const FUNCTION_USE_NEW: u8 = 0x01;

/// 负载中的单个字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub descriptor: u8,
    pub data: &'a [u8],
}

/// 字段迭代器
///
/// 遇到非法长度时产生一次错误并结束。
pub struct Fields<'a> {
    payload: &'a [u8],
    offset: usize,
    done: bool,
}

/// 遍历负载中的字段
pub fn fields(payload: &[u8]) -> Fields<'_> {
    Fields {
        payload,
        offset: 0,
        done: false,
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<Field<'a>, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.payload.len() {
            return None;
        }

        let offset = self.offset;
        let len = self.payload[offset];
        let end = offset + len as usize;
        if len < 2 || end > self.payload.len() {
            self.done = true;
            return Some(Err(ProtocolError::MalformedField { offset, len }));
        }

        self.offset = end;
        Some(Ok(Field {
            descriptor: self.payload[offset + 1],
            data: &self.payload[offset + 2..end],
        }))
    }
}

// ============================================================================
// ACK
// ============================================================================

/// ACK/NACK 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckField {
    /// 被确认的命令描述符
    pub command: u8,
    /// 0 表示成功
    pub error_code: u8,
}

impl AckField {
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }

    /// 提取负载中的全部 ACK 字段（非 ACK 字段忽略）
    pub fn collect(payload: &[u8]) -> Result<Vec<AckField>, ProtocolError> {
        let mut acks = Vec::new();
        for field in fields(payload) {
            let field = field?;
            if field.descriptor != FIELD_ACK {
                continue;
            }
            if field.data.len() < 2 {
                return Err(ProtocolError::InvalidLength {
                    expected: 2,
                    actual: field.data.len(),
                });
            }
            acks.push(AckField {
                command: field.data[0],
                error_code: field.data[1],
            });
        }
        Ok(acks)
    }
}

/// ACK 错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AckErrorCode {
    Ok = 0x00,
    UnknownCommand = 0x01,
    InvalidChecksum = 0x02,
    InvalidParameter = 0x03,
    CommandFailed = 0x04,
    CommandTimeout = 0x05,
    #[num_enum(catch_all)]
    Other(u8),
}

// ============================================================================
// 命令构建
// ============================================================================

/// 数据流设备选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StreamDevice {
    Ahrs = 0x01,
    Gps = 0x02,
    Nav = 0x03,
}

/// 导航滤波器的载具动力学模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum VehicleDynamicsMode {
    Portable = 0x01,
    Automotive = 0x02,
    #[default]
    Airborne = 0x03,
}

/// Ping
pub fn ping() -> Frame {
    Frame::from_array(DescriptorSet::CommandBase.into(), &[0x02, base::PING])
}

/// 停止数据流（空闲）
pub fn set_to_idle() -> Frame {
    Frame::from_array(DescriptorSet::CommandBase.into(), &[0x02, base::SET_TO_IDLE])
}

/// 恢复数据流
pub fn resume() -> Frame {
    Frame::from_array(DescriptorSet::CommandBase.into(), &[0x02, base::RESUME])
}

fn message_format(field_desc: u8, descriptors: &[u8], decimation: u16) -> Frame {
    let mut field = Vec::with_capacity(4 + descriptors.len() * 3);
    field.push((4 + descriptors.len() * 3) as u8);
    field.push(field_desc);
    field.push(FUNCTION_USE_NEW);
    field.push(descriptors.len() as u8);
    for &desc in descriptors {
        field.push(desc);
        field.extend_from_slice(&decimation.to_be_bytes());
    }
    Frame::new_truncated(DescriptorSet::Command3dm.into(), &field)
}

/// AHRS 数据格式：Euler 角 + 角速度
pub fn ahrs_message_format(decimation: u16) -> Frame {
    message_format(
        cmd_3dm::AHRS_MESSAGE_FORMAT,
        &[ahrs::EULER_ANGLES, ahrs::SCALED_GYRO],
        decimation,
    )
}

/// NAV 数据格式：位置、速度、姿态、角速度、滤波器状态
pub fn nav_message_format(decimation: u16) -> Frame {
    message_format(
        cmd_3dm::NAV_MESSAGE_FORMAT,
        &[
            nav::LLH_POSITION,
            nav::NED_VELOCITY,
            nav::EULER_ANGLES,
            nav::COMPENSATED_ANGULAR_RATE,
            nav::FILTER_STATUS,
        ],
        decimation,
    )
}

/// 开启/关闭连续数据流
pub fn enable_stream(device: StreamDevice, enable: bool) -> Frame {
    Frame::from_array(
        DescriptorSet::Command3dm.into(),
        &[
            0x05,
            cmd_3dm::ENABLE_STREAM,
            FUNCTION_USE_NEW,
            device.into(),
            enable as u8,
        ],
    )
}

/// 复位导航滤波器
pub fn reset_filter() -> Frame {
    Frame::from_array(
        DescriptorSet::CommandNavFilter.into(),
        &[0x02, nav_filter::RESET_FILTER],
    )
}

/// 用 AHRS 姿态初始化导航滤波器
pub fn init_attitude_from_ahrs(declination_rad: f32) -> Frame {
    let d = declination_rad.to_be_bytes();
    Frame::from_array(
        DescriptorSet::CommandNavFilter.into(),
        &[0x06, nav_filter::INIT_ATTITUDE_FROM_AHRS, d[0], d[1], d[2], d[3]],
    )
}

/// 设置载具动力学模式
pub fn vehicle_dynamics_mode(mode: VehicleDynamicsMode) -> Frame {
    Frame::from_array(
        DescriptorSet::CommandNavFilter.into(),
        &[
            0x04,
            nav_filter::VEHICLE_DYNAMICS_MODE,
            FUNCTION_USE_NEW,
            mode.into(),
        ],
    )
}

/// 命令帧中第一个字段的描述符（用于匹配 ACK）
pub fn command_descriptor(frame: &Frame) -> Option<u8> {
    frame.payload().get(1).copied()
}

// ============================================================================
// 数据字段
// ============================================================================

/// NAV 滤波器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum FilterState {
    Startup = 0x00,
    Initialization = 0x01,
    RunningValid = 0x02,
    RunningError = 0x03,
    #[num_enum(default)]
    Unknown = 0xFFFF,
}

/// LLH 位置（度 / 米）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LlhPosition {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub height_m: f64,
    pub valid: bool,
}

/// 三轴量 + 有效标志
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vector3Field {
    pub value: [f32; 3],
    pub valid: bool,
}

/// 解析后的数据字段
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataField {
    /// AHRS Euler 角（roll, pitch, yaw，弧度）
    AhrsEuler([f32; 3]),
    /// AHRS 角速度（rad/s）
    AhrsGyro([f32; 3]),
    /// NAV 位置
    NavPosition(LlhPosition),
    /// NAV NED 速度（m/s）
    NavVelocity(Vector3Field),
    /// NAV Euler 角（弧度）
    NavEuler(Vector3Field),
    /// NAV 补偿后角速度（rad/s）
    NavAngularRate(Vector3Field),
    /// NAV 滤波器状态
    FilterStatus {
        state: FilterState,
        dynamics_mode: u16,
        flags: u16,
    },
    /// 未解析的字段
    Unknown { set: u8, descriptor: u8 },
}

fn require(data: &[u8], len: usize) -> Result<(), ProtocolError> {
    if data.len() < len {
        return Err(ProtocolError::InvalidLength {
            expected: len,
            actual: data.len(),
        });
    }
    Ok(())
}

fn vec3(data: &[u8]) -> [f32; 3] {
    [read_f32_be(data, 0), read_f32_be(data, 4), read_f32_be(data, 8)]
}

fn valid_flag(data: &[u8], offset: usize) -> bool {
    u16::from_be_bytes([data[offset], data[offset + 1]]) & 0x0001 != 0
}

fn vec3_with_flag(data: &[u8]) -> Result<Vector3Field, ProtocolError> {
    require(data, 14)?;
    Ok(Vector3Field {
        value: vec3(data),
        valid: valid_flag(data, 12),
    })
}

impl DataField {
    /// 解析数据集 `set` 中的一个字段
    pub fn parse(set: u8, field: &Field<'_>) -> Result<Self, ProtocolError> {
        let data = field.data;
        let parsed = match (DescriptorSet::try_from(set).ok(), field.descriptor) {
            (Some(DescriptorSet::DataAhrs), ahrs::EULER_ANGLES) => {
                require(data, 12)?;
                DataField::AhrsEuler(vec3(data))
            },
            (Some(DescriptorSet::DataAhrs), ahrs::SCALED_GYRO) => {
                require(data, 12)?;
                DataField::AhrsGyro(vec3(data))
            },
            (Some(DescriptorSet::DataNav), nav::LLH_POSITION) => {
                require(data, 26)?;
                DataField::NavPosition(LlhPosition {
                    latitude_deg: read_f64_be(data, 0),
                    longitude_deg: read_f64_be(data, 8),
                    height_m: read_f64_be(data, 16),
                    valid: valid_flag(data, 24),
                })
            },
            (Some(DescriptorSet::DataNav), nav::NED_VELOCITY) => {
                DataField::NavVelocity(vec3_with_flag(data)?)
            },
            (Some(DescriptorSet::DataNav), nav::EULER_ANGLES) => {
                DataField::NavEuler(vec3_with_flag(data)?)
            },
            (Some(DescriptorSet::DataNav), nav::COMPENSATED_ANGULAR_RATE) => {
                DataField::NavAngularRate(vec3_with_flag(data)?)
            },
            (Some(DescriptorSet::DataNav), nav::FILTER_STATUS) => {
                require(data, 6)?;
                DataField::FilterStatus {
                    state: FilterState::from(u16::from_be_bytes([data[0], data[1]])),
                    dynamics_mode: u16::from_be_bytes([data[2], data[3]]),
                    flags: u16::from_be_bytes([data[4], data[5]]),
                }
            },
            _ => DataField::Unknown {
                set,
                descriptor: field.descriptor,
            },
        };
        Ok(parsed)
    }
}

/// 解析一帧数据中的所有字段
pub fn parse_data(frame: &Frame) -> Result<Vec<DataField>, ProtocolError> {
    fields(frame.payload())
        .map(|field| field.and_then(|f| DataField::parse(frame.id, &f)))
        .collect()
}

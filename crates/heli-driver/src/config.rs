//! 驱动配置
//!
//! 所有结构体都实现 `Default`；从 TOML 加载时缺失的键取默认值。
//!
//! # Example
//!
//! ```
//! use heli_driver::config::AutopilotConfig;
//!
//! let config: AutopilotConfig = toml::from_str(
//!     r#"
//!     [imu]
//!     watchdog_secs = 2.0
//!
//!     [servo.serial]
//!     path = "/dev/ttyUSB0"
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.servo.serial.path, "/dev/ttyUSB0");
//! assert_eq!(config.servo.send_rate_hz, 50.0);
//! ```

use crate::DriverError;
use crate::scheduler::WriteRetry;
use heli_protocol::PulseWindow;
use heli_protocol::gx3::VehicleDynamicsMode;
use heli_serial::SerialConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn positive_rate(name: &str, hz: f64) -> Result<(), DriverError> {
    if hz.is_finite() && hz > 0.0 {
        Ok(())
    } else {
        Err(DriverError::Config(format!("{} must be a positive rate, got {}", name, hz)))
    }
}

/// 频率换算成的周期必须能用 `Duration` 表示且不为零
fn representable_rate(name: &str, hz: f64) -> Result<(), DriverError> {
    positive_rate(name, hz)?;
    match Duration::try_from_secs_f64(1.0 / hz) {
        Ok(period) if !period.is_zero() => Ok(()),
        _ => Err(DriverError::Config(format!(
            "{} = {} Hz has no representable period",
            name, hz
        ))),
    }
}

/// 舵机切换板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoSwitchConfig {
    pub enabled: bool,
    /// 输出逐帧 trace 日志
    pub debug: bool,
    pub serial: SerialConfig,
    /// PULSE_COMMAND 发送频率
    pub send_rate_hz: f64,
    pub pulse_window: PulseWindow,
    pub write_retry: WriteRetry,
}

impl Default for ServoSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            serial: SerialConfig::with_path("/dev/ttyS0"),
            send_rate_hz: 50.0,
            pulse_window: PulseWindow::default(),
            write_retry: WriteRetry::default(),
        }
    }
}

impl ServoSwitchConfig {
    pub fn validate(&self) -> Result<(), DriverError> {
        representable_rate("servo.send_rate_hz", self.send_rate_hz)?;
        if self.pulse_window.min >= self.pulse_window.max {
            return Err(DriverError::Config(format!(
                "servo.pulse_window is empty: min {} >= max {}",
                self.pulse_window.min, self.pulse_window.max
            )));
        }
        Ok(())
    }
}

/// 3DM-GX3 导航传感器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gx3Config {
    pub enabled: bool,
    pub debug: bool,
    pub serial: SerialConfig,
    /// 无数据多久后进入 ERROR（秒）
    pub watchdog_secs: f64,
    /// 单条命令等待 ACK 的时间（毫秒）
    pub ack_timeout_ms: u64,
    /// AHRS 数据分频（基频 1000 Hz）
    pub ahrs_decimation: u16,
    /// NAV 数据分频（基频 100 Hz）
    pub nav_decimation: u16,
    /// 姿态取自导航滤波器（否则取 AHRS）
    pub use_nav_attitude: bool,
    /// 用 AHRS 初始化滤波器时的磁偏角（弧度）
    pub magnetic_declination_rad: f32,
    pub dynamics_mode: VehicleDynamicsMode,
}

impl Default for Gx3Config {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            serial: SerialConfig::with_path("/dev/ttyS1"),
            watchdog_secs: 1.0,
            ack_timeout_ms: 500,
            ahrs_decimation: 10,
            nav_decimation: 1,
            use_nav_attitude: true,
            magnetic_declination_rad: 0.0,
            dynamics_mode: VehicleDynamicsMode::Airborne,
        }
    }
}

impl Gx3Config {
    pub fn validate(&self) -> Result<(), DriverError> {
        positive_rate("imu.watchdog_secs", self.watchdog_secs)?;
        if Duration::try_from_secs_f64(self.watchdog_secs).is_err() {
            return Err(DriverError::Config(format!(
                "imu.watchdog_secs = {} is out of range",
                self.watchdog_secs
            )));
        }
        if self.ack_timeout_ms == 0 {
            return Err(DriverError::Config("imu.ack_timeout_ms must be > 0".to_string()));
        }
        if self.ahrs_decimation == 0 || self.nav_decimation == 0 {
            return Err(DriverError::Config("imu decimation must be >= 1".to_string()));
        }
        Ok(())
    }

    /// 调用前须先 `validate()`
    pub fn watchdog(&self) -> Duration {
        Duration::try_from_secs_f64(self.watchdog_secs).unwrap_or(Duration::from_secs(1))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// 地面站遥测
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// 调度循环频率，各数据流频率须整除它
    pub send_rate_hz: u32,
    pub heartbeat_hz: u32,
    pub attitude_hz: u32,
    pub position_hz: u32,
    pub rc_channels_hz: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_rate_hz: 200,
            heartbeat_hz: 1,
            attitude_hz: 10,
            position_hz: 10,
            rc_channels_hz: 5,
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.send_rate_hz == 0 {
            return Err(DriverError::Config("telemetry.send_rate_hz must be > 0".to_string()));
        }
        representable_rate("telemetry.send_rate_hz", f64::from(self.send_rate_hz))
    }
}

/// 整机配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    pub servo: ServoSwitchConfig,
    pub imu: Gx3Config,
    pub telemetry: TelemetryConfig,
    /// `terminate_all` 等待循环退出的宽限期（毫秒）
    pub shutdown_grace_ms: u64,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            servo: ServoSwitchConfig::default(),
            imu: Gx3Config::default(),
            telemetry: TelemetryConfig::default(),
            shutdown_grace_ms: 3000,
        }
    }
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<(), DriverError> {
        self.servo.validate()?;
        self.imu.validate()?;
        self.telemetry.validate()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

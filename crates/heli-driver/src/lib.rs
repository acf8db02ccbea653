//! # Heli Driver
//!
//! 飞控计算机的设备驱动引擎，包括：
//! - 接收流水线（帧同步、校验、按消息 ID 分发）
//! - 固定频率发送调度（写失败重试）
//! - 命令/ACK 匹配与超时
//! - 设备健康状态机（STARTUP → INIT → RUNNING ⇄ ERROR）
//! - 驱动注册表与统一关闭
//! - 舵机切换板、3DM-GX3 惯导、地面站遥测、控制模式仲裁
//!
//! 所有设备通过 [`AppContext`] 创建并注入，没有进程级单例。

pub mod ack;
pub mod activity;
pub mod config;
pub mod context;
pub mod control;
mod error;
pub mod events;
pub mod geo;
pub mod gx3;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod mode;
pub mod pipeline;
pub mod rate;
pub mod scheduler;
pub mod servo_switch;
pub mod telemetry;

pub use ack::{AckEvent, AckKey, AckOutcome, CommandChannel};
pub use config::{AutopilotConfig, Gx3Config, ServoSwitchConfig, TelemetryConfig};
pub use context::AppContext;
pub use control::{BadControl, ControlArbiter, ControllerMode, ControllerModeChange};
pub use error::DriverError;
pub use events::{Observers, Subscription};
pub use geo::GeodeticPosition;
pub use gx3::Gx3Imu;
pub use health::{HealthMonitor, ModeChange};
pub use lifecycle::{DriverLifecycle, DriverRegistry, ShutdownReport};
pub use metrics::{DriverMetrics, MetricsSnapshot};
pub use mode::{AtomicDeviceMode, DeviceMode};
pub use rate::RateLimiter;
pub use scheduler::{WriteFailure, WriteRetry};
pub use servo_switch::ServoSwitch;
pub use telemetry::{TelemetryLink, TelemetryMessage, TelemetrySink, TelemetrySources};

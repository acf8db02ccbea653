//! 应用上下文
//!
//! 持有驱动注册表和全部设备。设备由这里创建并注入给需要它们的组件，
//! 不存在进程级的全局实例。

use crate::DriverError;
use crate::config::AutopilotConfig;
use crate::control::ControlArbiter;
use crate::events::Subscription;
use crate::gx3::Gx3Imu;
use crate::lifecycle::{DriverRegistry, ShutdownReport};
use crate::servo_switch::ServoSwitch;
use crate::telemetry::{TelemetryLink, TelemetrySink, TelemetrySources};
use std::sync::Arc;
use tracing::info;

pub struct AppContext {
    config: AutopilotConfig,
    registry: DriverRegistry,
    servo: Arc<ServoSwitch>,
    imu: Arc<Gx3Imu>,
    telemetry: Option<TelemetryLink>,
    subscriptions: Vec<Subscription>,
}

impl AppContext {
    /// 按配置打开串口设备并启动遥测
    ///
    /// 设备打开失败不会让这里失败：对应驱动以禁用状态存在。
    pub fn start<K: TelemetrySink>(config: &AutopilotConfig, sink: K) -> Result<Self, DriverError> {
        config.validate()?;
        let registry = DriverRegistry::new();
        let servo = ServoSwitch::open(&config.servo, &registry);
        let imu = Gx3Imu::open(&config.imu, &registry);
        Self::with_drivers(config, registry, servo, imu, sink)
    }

    /// 用已经启动的驱动组装上下文
    pub fn with_drivers<K: TelemetrySink>(
        config: &AutopilotConfig,
        registry: DriverRegistry,
        servo: ServoSwitch,
        imu: Gx3Imu,
        sink: K,
    ) -> Result<Self, DriverError> {
        config.validate()?;
        let servo = Arc::new(servo);
        let imu = Arc::new(imu);

        let telemetry = if config.telemetry.enabled {
            let sources = TelemetrySources {
                servo: servo.clone(),
                imu: imu.clone(),
            };
            Some(TelemetryLink::start(&config.telemetry, sources, sink, &registry)?)
        } else {
            info!("telemetry: disabled in configuration");
            None
        };

        info!(
            "Started {} driver(s): {}",
            registry.len(),
            registry.names().join(", ")
        );

        Ok(Self {
            config: config.clone(),
            registry,
            servo,
            imu,
            telemetry,
            subscriptions: Vec::new(),
        })
    }

    pub fn config(&self) -> &AutopilotConfig {
        &self.config
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn servo(&self) -> &Arc<ServoSwitch> {
        &self.servo
    }

    pub fn imu(&self) -> &Arc<Gx3Imu> {
        &self.imu
    }

    pub fn telemetry(&self) -> Option<&TelemetryLink> {
        self.telemetry.as_ref()
    }

    /// 把控制模式变化转发到遥测状态文本
    pub fn watch_controller(&mut self, arbiter: &ControlArbiter) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let queue = telemetry.status_sender();
        let subscription = arbiter.subscribe_mode(move |change| {
            let _ = queue.try_send(format!("Controller mode changed to {}", change.to));
        });
        self.subscriptions.push(subscription);
    }

    /// 终止所有已注册的驱动，等待至多 `shutdown_grace_ms`
    pub fn shutdown(&self) -> ShutdownReport {
        let report = self.registry.terminate_all(self.config.shutdown_grace());
        if report.is_clean() {
            info!("All drivers stopped in {:?}", report.elapsed);
        }
        report
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("drivers", &self.registry.names())
            .field("servo", &self.servo)
            .field("imu", &self.imu)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

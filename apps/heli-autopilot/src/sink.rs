//! 把遥测批次写进日志的 sink
//!
//! 没有地面站链路时使用：状态文本按 info 输出，周期性数据按 debug/trace。

use heli_driver::{DriverError, TelemetryMessage, TelemetrySink};
use tracing::{debug, info, trace};

#[derive(Debug, Default)]
pub struct TracingSink {
    batches: u64,
}

impl TelemetrySink for TracingSink {
    fn send(&mut self, batch: &[TelemetryMessage]) -> Result<(), DriverError> {
        self.batches += 1;
        for message in batch {
            match message {
                TelemetryMessage::StatusText(text) => info!("[status] {}", text),
                TelemetryMessage::Heartbeat {
                    imu_mode,
                    pilot_mode,
                    uptime,
                } => debug!(
                    "[heartbeat] imu {} pilot {} uptime {:.1}s",
                    imu_mode,
                    pilot_mode,
                    uptime.as_secs_f64()
                ),
                TelemetryMessage::Position { position, ned, .. } => trace!(
                    "[position] {:.7} {:.7} {:.1} m ned ({:.2}, {:.2}, {:.2})",
                    position.latitude_deg(),
                    position.longitude_deg(),
                    position.height_m(),
                    ned.x,
                    ned.y,
                    ned.z
                ),
                other => trace!("{:?}", other),
            }
        }
        Ok(())
    }
}

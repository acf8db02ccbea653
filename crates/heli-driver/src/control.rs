//! 控制模式仲裁
//!
//! 位置保持（PID 或 SBF）产生姿态参考，姿态稳定（PID）产生各通道的控制量。
//! 位置控制器不可运行或报错时退回姿态稳定，并通过 `mode_changed` 通知。
//!
//! 控制律本身不在这里实现，只定义 [`TranslationLaw`] / [`AttitudeLaw`] 接口。

use crate::events::{Observers, Subscription};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

/// 控制通道数
pub const CONTROL_CHANNELS: usize = 6;
/// 横滚通道下标
pub const ROLL: usize = 0;
/// 俯仰通道下标
pub const PITCH: usize = 1;

/// 每个控制通道的控制量
pub type Effort = [f64; CONTROL_CHANNELS];

/// 控制律无法给出有效输出
#[derive(Error, Debug, Clone, PartialEq)]
#[error("bad control: {0}")]
pub struct BadControl(pub String);

impl BadControl {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// 控制模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerMode {
    #[default]
    AttitudeStabilizationPid,
    PositionHoldPid,
    PositionHoldSbf,
}

impl fmt::Display for ControllerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AttitudeStabilizationPid => "attitude stabilization (PID)",
            Self::PositionHoldPid => "position hold (PID)",
            Self::PositionHoldSbf => "position hold (SBF)",
        };
        f.write_str(name)
    }
}

/// 控制模式变化事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerModeChange {
    pub from: ControllerMode,
    pub to: ControllerMode,
}

/// 横滚/俯仰参考（弧度）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AttitudeReference {
    pub roll: f64,
    pub pitch: f64,
}

/// 位置控制律：NED 参考点 → 姿态参考
pub trait TranslationLaw: Send {
    fn runnable(&self) -> bool;
    fn step(&mut self, reference_ned: &Vector3<f64>) -> Result<AttitudeReference, BadControl>;
}

/// 姿态控制律：姿态参考 → 控制量
pub trait AttitudeLaw: Send {
    fn step(&mut self, reference: &AttitudeReference) -> Result<Effort, BadControl>;
}

/// 一次 `step` 的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlOutput {
    /// 实际生效的模式（可能已经回退）
    pub mode: ControllerMode,
    pub reference: AttitudeReference,
    pub effort: Effort,
}

/// 逐通道混合驾驶员输入与控制量
///
/// `out[i] = mix[i] * pilot[i] + (1 - mix[i]) * effort[i]`
pub fn mix_pilot_inputs(pilot: &[f64], effort: &[f64], mix: &[f64]) -> Result<Effort, BadControl> {
    if pilot.len() != CONTROL_CHANNELS
        || effort.len() != CONTROL_CHANNELS
        || mix.len() != CONTROL_CHANNELS
    {
        return Err(BadControl::new(
            "At least one of the vectors are not of length 6",
        ));
    }
    if mix.iter().any(|m| !(0.0..=1.0).contains(m)) {
        return Err(BadControl::new("Pilot mix values is out of range."));
    }

    let mut out = [0.0; CONTROL_CHANNELS];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = mix[i] * pilot[i] + (1.0 - mix[i]) * effort[i];
    }
    Ok(out)
}

/// 控制模式仲裁器
pub struct ControlArbiter {
    mode: ControllerMode,
    trim: AttitudeReference,
    pilot_mix: Effort,
    attitude_pid: Box<dyn AttitudeLaw>,
    translation_pid: Box<dyn TranslationLaw>,
    translation_sbf: Box<dyn TranslationLaw>,
    mode_changed: Observers<ControllerModeChange>,
}

impl ControlArbiter {
    pub fn new(
        attitude_pid: Box<dyn AttitudeLaw>,
        translation_pid: Box<dyn TranslationLaw>,
        translation_sbf: Box<dyn TranslationLaw>,
    ) -> Self {
        Self {
            mode: ControllerMode::default(),
            trim: AttitudeReference::default(),
            pilot_mix: [0.0; CONTROL_CHANNELS],
            attitude_pid,
            translation_pid,
            translation_sbf,
            mode_changed: Observers::new(),
        }
    }

    pub fn mode(&self) -> ControllerMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ControllerMode) {
        if mode == self.mode {
            return;
        }
        let change = ControllerModeChange {
            from: self.mode,
            to: mode,
        };
        self.mode = mode;
        info!("Controller mode changed to {}", mode);
        self.mode_changed.notify(&change);
    }

    pub fn mode_changed(&self) -> &Observers<ControllerModeChange> {
        &self.mode_changed
    }

    pub fn subscribe_mode<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ControllerModeChange) + Send + Sync + 'static,
    {
        self.mode_changed.subscribe(callback)
    }

    /// 姿态稳定模式下的横滚/俯仰参考
    pub fn set_trim(&mut self, trim: AttitudeReference) {
        self.trim = trim;
    }

    pub fn trim(&self) -> AttitudeReference {
        self.trim
    }

    pub fn pilot_mix(&self) -> Effort {
        self.pilot_mix
    }

    /// 设置横滚通道的驾驶员混合比，超出 [0, 1] 时忽略
    pub fn set_roll_mix(&mut self, mix: f64) -> Result<(), BadControl> {
        self.set_mix(ROLL, mix, "roll")
    }

    /// 设置俯仰通道的驾驶员混合比，超出 [0, 1] 时忽略
    pub fn set_pitch_mix(&mut self, mix: f64) -> Result<(), BadControl> {
        self.set_mix(PITCH, mix, "pitch")
    }

    fn set_mix(&mut self, channel: usize, mix: f64, axis: &str) -> Result<(), BadControl> {
        if !(0.0..=1.0).contains(&mix) {
            warn!("Invalid {} mix argument: {}", axis, mix);
            return Err(BadControl::new(format!("Invalid {} mix argument: {}", axis, mix)));
        }
        self.pilot_mix[channel] = mix;
        Ok(())
    }

    /// 用当前混合比混合驾驶员输入
    pub fn mix(&self, pilot: &Effort, effort: &Effort) -> Result<Effort, BadControl> {
        mix_pilot_inputs(pilot, effort, &self.pilot_mix)
    }

    /// 运行一个控制周期
    ///
    /// 位置控制器失败时本周期直接以姿态稳定补上。姿态控制器的错误原样返回。
    pub fn step(&mut self, reference_ned: &Vector3<f64>) -> Result<ControlOutput, BadControl> {
        let reference = match self.mode {
            ControllerMode::PositionHoldPid => self.translation_reference(reference_ned, false),
            ControllerMode::PositionHoldSbf => self.translation_reference(reference_ned, true),
            ControllerMode::AttitudeStabilizationPid => None,
        };

        let reference = match reference {
            Some(reference) => reference,
            None => self.trim,
        };
        let effort = self.attitude_pid.step(&reference)?;

        Ok(ControlOutput {
            mode: self.mode,
            reference,
            effort,
        })
    }

    /// 运行位置控制器；失败时切到姿态稳定并返回 `None`
    fn translation_reference(
        &mut self,
        reference_ned: &Vector3<f64>,
        sbf: bool,
    ) -> Option<AttitudeReference> {
        let (law, name) = if sbf {
            (&mut self.translation_sbf, "sbf")
        } else {
            (&mut self.translation_pid, "pid")
        };

        if !law.runnable() {
            warn!(
                "Control: translation {} controller reports it is not runnable. Switching to attitude control.",
                name
            );
            self.set_mode(ControllerMode::AttitudeStabilizationPid);
            return None;
        }

        match law.step(reference_ned) {
            Ok(reference) => Some(reference),
            Err(e) => {
                warn!(
                    "Caught error from translation {} controller ({}), switching to attitude stabilization",
                    name, e
                );
                self.set_mode(ControllerMode::AttitudeStabilizationPid);
                None
            },
        }
    }
}

impl fmt::Debug for ControlArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlArbiter")
            .field("mode", &self.mode)
            .field("trim", &self.trim)
            .field("pilot_mix", &self.pilot_mix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// 控制量 = [roll, pitch, 0, 0, 0, 0]
    struct EchoAttitude;

    impl AttitudeLaw for EchoAttitude {
        fn step(&mut self, reference: &AttitudeReference) -> Result<Effort, BadControl> {
            Ok([reference.roll, reference.pitch, 0.0, 0.0, 0.0, 0.0])
        }
    }

    struct FailingAttitude;

    impl AttitudeLaw for FailingAttitude {
        fn step(&mut self, _reference: &AttitudeReference) -> Result<Effort, BadControl> {
            Err(BadControl::new("saturated"))
        }
    }

    #[derive(Clone)]
    struct FakeTranslation {
        runnable: bool,
        fail: bool,
        calls: Arc<Mutex<usize>>,
    }

    impl FakeTranslation {
        fn ok() -> Self {
            Self {
                runnable: true,
                fail: false,
                calls: Arc::default(),
            }
        }
    }

    impl TranslationLaw for FakeTranslation {
        fn runnable(&self) -> bool {
            self.runnable
        }

        fn step(&mut self, reference_ned: &Vector3<f64>) -> Result<AttitudeReference, BadControl> {
            *self.calls.lock() += 1;
            if self.fail {
                return Err(BadControl::new("no position fix"));
            }
            Ok(AttitudeReference {
                roll: reference_ned.y * 0.01,
                pitch: -reference_ned.x * 0.01,
            })
        }
    }

    fn arbiter(pid: FakeTranslation, sbf: FakeTranslation) -> ControlArbiter {
        ControlArbiter::new(Box::new(EchoAttitude), Box::new(pid), Box::new(sbf))
    }

    #[test]
    fn test_attitude_stabilization_uses_trim() {
        let mut arbiter = arbiter(FakeTranslation::ok(), FakeTranslation::ok());
        arbiter.set_trim(AttitudeReference {
            roll: 0.02,
            pitch: -0.03,
        });

        let out = arbiter.step(&Vector3::new(10.0, 0.0, 0.0)).unwrap();
        assert_eq!(out.mode, ControllerMode::AttitudeStabilizationPid);
        assert_eq!(out.effort, [0.02, -0.03, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_position_hold_feeds_attitude_controller() {
        let pid = FakeTranslation::ok();
        let calls = pid.calls.clone();
        let mut arbiter = arbiter(pid, FakeTranslation::ok());
        arbiter.set_mode(ControllerMode::PositionHoldPid);

        let out = arbiter.step(&Vector3::new(10.0, 5.0, 0.0)).unwrap();
        assert_eq!(out.mode, ControllerMode::PositionHoldPid);
        assert!((out.reference.roll - 0.05).abs() < 1e-12);
        assert!((out.reference.pitch + 0.1).abs() < 1e-12);
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_not_runnable_falls_back() {
        let sbf = FakeTranslation {
            runnable: false,
            ..FakeTranslation::ok()
        };
        let calls = sbf.calls.clone();
        let mut arbiter = arbiter(FakeTranslation::ok(), sbf);
        arbiter.set_mode(ControllerMode::PositionHoldSbf);
        let (_sub, changes) = arbiter.mode_changed().subscribe_channel(4);

        let out = arbiter.step(&Vector3::zeros()).unwrap();
        assert_eq!(out.mode, ControllerMode::AttitudeStabilizationPid);
        assert_eq!(arbiter.mode(), ControllerMode::AttitudeStabilizationPid);
        assert_eq!(*calls.lock(), 0);
        assert_eq!(
            changes.try_recv().unwrap(),
            ControllerModeChange {
                from: ControllerMode::PositionHoldSbf,
                to: ControllerMode::AttitudeStabilizationPid,
            }
        );
    }

    #[test]
    fn test_bad_control_falls_back_to_trim() {
        let pid = FakeTranslation {
            fail: true,
            ..FakeTranslation::ok()
        };
        let mut arbiter = arbiter(pid, FakeTranslation::ok());
        arbiter.set_trim(AttitudeReference {
            roll: 0.01,
            pitch: 0.0,
        });
        arbiter.set_mode(ControllerMode::PositionHoldPid);

        let out = arbiter.step(&Vector3::new(3.0, 3.0, 0.0)).unwrap();
        assert_eq!(out.mode, ControllerMode::AttitudeStabilizationPid);
        assert_eq!(out.reference, arbiter.trim());

        // 回退后不再调用位置控制器
        let out = arbiter.step(&Vector3::new(3.0, 3.0, 0.0)).unwrap();
        assert_eq!(out.mode, ControllerMode::AttitudeStabilizationPid);
    }

    #[test]
    fn test_attitude_error_propagates() {
        let mut arbiter = ControlArbiter::new(
            Box::new(FailingAttitude),
            Box::new(FakeTranslation::ok()),
            Box::new(FakeTranslation::ok()),
        );
        assert_eq!(
            arbiter.step(&Vector3::zeros()),
            Err(BadControl::new("saturated"))
        );
    }

    #[test]
    fn test_set_mode_same_value_is_silent() {
        let mut arbiter = arbiter(FakeTranslation::ok(), FakeTranslation::ok());
        let (_sub, changes) = arbiter.mode_changed().subscribe_channel(4);
        arbiter.set_mode(ControllerMode::AttitudeStabilizationPid);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_mix_pilot_inputs() {
        let pilot = [1.0; 6];
        let effort = [0.0; 6];
        let mix = [0.0, 0.25, 0.5, 1.0, 0.0, 0.0];
        assert_eq!(
            mix_pilot_inputs(&pilot, &effort, &mix).unwrap(),
            [0.0, 0.25, 0.5, 1.0, 0.0, 0.0]
        );

        assert_eq!(
            mix_pilot_inputs(&pilot[..5], &effort, &mix),
            Err(BadControl::new("At least one of the vectors are not of length 6"))
        );
        let bad_mix = [0.0, 0.0, 1.5, 0.0, 0.0, 0.0];
        assert_eq!(
            mix_pilot_inputs(&pilot, &effort, &bad_mix),
            Err(BadControl::new("Pilot mix values is out of range."))
        );
        let nan_mix = [f64::NAN, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert!(mix_pilot_inputs(&pilot, &effort, &nan_mix).is_err());
    }

    #[test]
    fn test_mix_setters_validate() {
        let mut arbiter = arbiter(FakeTranslation::ok(), FakeTranslation::ok());
        arbiter.set_roll_mix(0.3).unwrap();
        assert!(arbiter.set_pitch_mix(-0.1).is_err());
        assert!(arbiter.set_pitch_mix(f64::INFINITY).is_err());
        assert_eq!(arbiter.pilot_mix(), [0.3, 0.0, 0.0, 0.0, 0.0, 0.0]);

        let mixed = arbiter.mix(&[1.0; 6], &[0.0; 6]).unwrap();
        assert!((mixed[ROLL] - 0.3).abs() < 1e-12);
        assert_eq!(mixed[PITCH], 0.0);
    }

    #[test]
    fn test_mode_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: ControllerMode,
        }
        let w: Wrapper = toml::from_str(r#"mode = "position_hold_sbf""#).unwrap();
        assert_eq!(w.mode, ControllerMode::PositionHoldSbf);
    }
}

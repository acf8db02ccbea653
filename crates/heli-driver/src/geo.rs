//! 大地坐标
//!
//! WGS84 椭球下的 LLH → ECEF → 局部 NED 转换，以及球面 haversine 距离。

use nalgebra::{Matrix3, Vector3};

/// WGS84 长半轴（米）
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 扁率
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// haversine 使用的地球平均半径（米）
pub const EARTH_MEAN_RADIUS_M: f64 = 6_371_000.0;
/// 未指定或无效时的精度（米）
pub const DEFAULT_ACCURACY_M: f64 = 100.0;

/// 地理位置（不可变值类型）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeodeticPosition {
    latitude_deg: f64,
    longitude_deg: f64,
    height_m: f64,
    accuracy_m: f64,
}

impl Default for GeodeticPosition {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

impl GeodeticPosition {
    /// 精度取默认值 100 m
    pub fn new(latitude_deg: f64, longitude_deg: f64, height_m: f64) -> Self {
        Self::with_accuracy(latitude_deg, longitude_deg, height_m, DEFAULT_ACCURACY_M)
    }

    /// `accuracy_m` ≤ 0 或非有限值时替换为 100 m
    pub fn with_accuracy(
        latitude_deg: f64,
        longitude_deg: f64,
        height_m: f64,
        accuracy_m: f64,
    ) -> Self {
        let accuracy_m = if accuracy_m.is_finite() && accuracy_m > 0.0 {
            accuracy_m
        } else {
            DEFAULT_ACCURACY_M
        };
        Self {
            latitude_deg,
            longitude_deg,
            height_m,
            accuracy_m,
        }
    }

    pub fn latitude_deg(&self) -> f64 {
        self.latitude_deg
    }

    pub fn longitude_deg(&self) -> f64 {
        self.longitude_deg
    }

    pub fn height_m(&self) -> f64 {
        self.height_m
    }

    pub fn accuracy_m(&self) -> f64 {
        self.accuracy_m
    }

    /// 地心地固坐标（米）
    pub fn ecef(&self) -> Vector3<f64> {
        let e2 = WGS84_F * (2.0 - WGS84_F);
        let lat = self.latitude_deg.to_radians();
        let lon = self.longitude_deg.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();

        let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
        Vector3::new(
            (n + self.height_m) * cos_lat * cos_lon,
            (n + self.height_m) * cos_lat * sin_lon,
            (n * (1.0 - e2) + self.height_m) * sin_lat,
        )
    }

    /// 相对 `origin` 的北-东-地坐标（米）
    pub fn ned_relative_to(&self, origin: &GeodeticPosition) -> Vector3<f64> {
        let lat = origin.latitude_deg.to_radians();
        let lon = origin.longitude_deg.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();

        #[rustfmt::skip]
        let ecef_to_ned = Matrix3::new(
            -sin_lat * cos_lon, -sin_lat * sin_lon,  cos_lat,
            -sin_lon,            cos_lon,            0.0,
            -cos_lat * cos_lon, -cos_lat * sin_lon, -sin_lat,
        );
        ecef_to_ned * (self.ecef() - origin.ecef())
    }

    /// haversine 大圆距离（米）
    ///
    /// `use_altitude` 为真时把本点高度加到地球半径上。
    pub fn distance_to(&self, other: &GeodeticPosition, use_altitude: bool) -> f64 {
        let lat1 = self.latitude_deg.to_radians();
        let lat2 = other.latitude_deg.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude_deg - self.longitude_deg).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        let radius = if use_altitude {
            EARTH_MEAN_RADIUS_M + self.height_m
        } else {
            EARTH_MEAN_RADIUS_M
        };
        radius * c
    }
}

/// 机体系 → NED 的旋转矩阵，`euler` = (roll, pitch, yaw)，弧度
pub fn euler_to_rotation(euler: &Vector3<f64>) -> Matrix3<f64> {
    let (sr, cr) = euler.x.sin_cos();
    let (sp, cp) = euler.y.sin_cos();
    let (sy, cy) = euler.z.sin_cos();

    #[rustfmt::skip]
    let ned_to_body = Matrix3::new(
        cy * cp,                  sy * cp,                  -sp,
        -sy * cr + cy * sp * sr,  cy * cr + sy * sp * sr,   cp * sr,
        sy * sr + cy * sp * cr,   -cy * sr + sy * sp * cr,  cp * cr,
    );
    ned_to_body.transpose()
}

/// 仅绕 z 轴的航向旋转
pub fn heading_rotation(yaw: f64) -> Matrix3<f64> {
    let (s, c) = yaw.sin_cos();
    #[rustfmt::skip]
    let rz = Matrix3::new(
        c,  -s,  0.0,
        s,   c,  0.0,
        0.0, 0.0, 1.0,
    );
    rz
}

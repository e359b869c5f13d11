//! Calibration results and their persisted JSON record.

use serde::{Deserialize, Serialize};

use crate::vision::CalibrationOutput;
use crate::work_unit::BaseParameters;

/// Near clip plane of the derived projection, in scene units.
pub const PERSPECTIVE_NEAR: f32 = 0.1;
/// Far clip plane of the derived projection, in scene units.
pub const PERSPECTIVE_FAR: f32 = 10000.0;

/// Row-major 4x4 matrix.
pub type Matrix4 = [[f32; 4]; 4];

/// Outcome of one calibration, delivered to the job's event receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub base: BaseParameters,
    pub success: bool,
    pub error: f32,
    pub fov_x: f32,
    pub fov_y: f32,
    pub focal_length_mm: f32,
    pub aspect_ratio: f32,
    pub sensor_size_mm: (f32, f32),
    pub principal_pixel_point: (f32, f32),
    pub resolution: (u32, u32),
    pub perspective_matrix: Matrix4,
    pub k1: f32,
    pub k2: f32,
    pub k3: f32,
    pub k4: f32,
    pub k5: f32,
    pub k6: f32,
    pub p1: f32,
    pub p2: f32,
    /// Number of images whose corners went into the solve.
    pub image_count: usize,
}

impl CalibrationResult {
    /// A failed result that still counts toward its job.
    pub fn failed(base: BaseParameters) -> Self {
        Self {
            base,
            success: false,
            error: 0.0,
            fov_x: 0.0,
            fov_y: 0.0,
            focal_length_mm: 0.0,
            aspect_ratio: 0.0,
            sensor_size_mm: (0.0, 0.0),
            principal_pixel_point: (0.0, 0.0),
            resolution: (0, 0),
            perspective_matrix: [[0.0; 4]; 4],
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            k4: 0.0,
            k5: 0.0,
            k6: 0.0,
            p1: 0.0,
            p2: 0.0,
            image_count: 0,
        }
    }

    /// Successful result at the given native resolution.
    pub fn solved(
        base: BaseParameters,
        output: &CalibrationOutput,
        native: (u32, u32),
        image_count: usize,
    ) -> Self {
        let principal = (output.principal_pixel_point_x, output.principal_pixel_point_y);
        Self {
            base,
            success: true,
            error: output.error,
            fov_x: output.fov_x,
            fov_y: output.fov_y,
            focal_length_mm: output.focal_length_mm,
            aspect_ratio: output.aspect_ratio,
            sensor_size_mm: (output.sensor_size_mm_x, output.sensor_size_mm_y),
            principal_pixel_point: principal,
            resolution: native,
            perspective_matrix: perspective_matrix(native, principal, output.focal_length_mm),
            k1: output.k1,
            k2: output.k2,
            k3: output.k3,
            k4: output.k4,
            k5: output.k5,
            k6: output.k6,
            p1: output.p1,
            p2: output.p2,
            image_count,
        }
    }

    pub fn to_record(&self) -> CalibrationRecord {
        CalibrationRecord {
            result: ResultRecord {
                jobid: self.base.job_id.to_string(),
                calibrationid: self.base.calibration_id.to_string(),
                friendlyname: self.base.friendly_name.clone(),
                zoomlevel: self.base.zoom_level,
                width: self.resolution.0,
                height: self.resolution.1,
                fovx: self.fov_x,
                fovy: self.fov_y,
                focallength: self.focal_length_mm,
                aspectratio: self.aspect_ratio,
                sensorsizemm: Vec2Record::new(self.sensor_size_mm.0, self.sensor_size_mm.1),
                principalpixelpoint: Vec2Record::new(
                    self.principal_pixel_point.0,
                    self.principal_pixel_point.1,
                ),
                resolution: Vec2Record::new(self.resolution.0 as f32, self.resolution.1 as f32),
                perspectivematrix: self.perspective_matrix.iter().flatten().copied().collect(),
                distortioncoefficients: vec![self.k1, self.k2, self.p1, self.p2, self.k3],
            },
        }
    }
}

/// Off-axis perspective projection for an image of `image_size` pixels.
///
/// Rows are `[nrl, 0, 0, 0]`, `[0, ntb, 0, 0]`, `[a, b, c, 1]`, `[0, 0, d, 0]`.
pub fn perspective_matrix(image_size: (u32, u32), principal: (f32, f32), focal_length: f32) -> Matrix4 {
    let n = PERSPECTIVE_NEAR;
    let f = PERSPECTIVE_FAR;
    let (w, h) = (image_size.0 as f32, image_size.1 as f32);
    let (px, py) = principal;

    let left = n * (-px) / focal_length;
    let right = n * (w - px) / focal_length;
    let bottom = n * (py - h) / focal_length;
    let top = n * py / focal_length;

    let a = -(right + left) / (right - left);
    let b = -(top + bottom) / (top - bottom);
    let c = n / (n - f);
    let d = -f * n / (n - f);

    let nrl = (2.0 * n) / (right - left);
    let ntb = (2.0 * n) / (top - bottom);

    [
        [nrl, 0.0, 0.0, 0.0],
        [0.0, ntb, 0.0, 0.0],
        [a, b, c, 1.0],
        [0.0, 0.0, d, 0.0],
    ]
}

/// On-disk JSON layout: `{ "result": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub result: ResultRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub jobid: String,
    pub calibrationid: String,
    pub friendlyname: String,
    pub zoomlevel: f32,
    pub width: u32,
    pub height: u32,
    pub fovx: f32,
    pub fovy: f32,
    pub focallength: f32,
    pub aspectratio: f32,
    pub sensorsizemm: Vec2Record,
    pub principalpixelpoint: Vec2Record,
    pub resolution: Vec2Record,
    pub perspectivematrix: Vec<f32>,
    pub distortioncoefficients: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2Record {
    pub x: f32,
    pub y: f32,
}

impl Vec2Record {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CalibrationId, JobId};

    fn base() -> BaseParameters {
        BaseParameters {
            job_id: JobId::new(),
            calibration_id: CalibrationId::new(),
            friendly_name: "zoom-0".to_string(),
            zoom_level: 0.25,
        }
    }

    #[test]
    fn test_centered_perspective_matrix() {
        let m = perspective_matrix((1920, 1080), (960.0, 540.0), 1000.0);

        // Centered principal point gives a symmetric frustum.
        assert!(m[2][0].abs() < 1e-6);
        assert!(m[2][1].abs() < 1e-6);
        assert!((m[0][0] - 2.0 * 1000.0 / 1920.0).abs() < 1e-4);
        assert!((m[1][1] - 2.0 * 1000.0 / 1080.0).abs() < 1e-4);
        assert_eq!(m[2][3], 1.0);

        let c = PERSPECTIVE_NEAR / (PERSPECTIVE_NEAR - PERSPECTIVE_FAR);
        let d = -PERSPECTIVE_FAR * PERSPECTIVE_NEAR / (PERSPECTIVE_NEAR - PERSPECTIVE_FAR);
        assert!((m[2][2] - c).abs() < 1e-6);
        assert!((m[3][2] - d).abs() < 1e-4);
        assert_eq!(m[3][3], 0.0);
    }

    #[test]
    fn test_off_axis_principal_point() {
        let m = perspective_matrix((1000, 1000), (400.0, 500.0), 500.0);
        // left = -0.08, right = 0.12
        assert!((m[2][0] - (-0.2)).abs() < 1e-5);
        assert!(m[2][1].abs() < 1e-5);
    }

    #[test]
    fn test_record_layout() {
        let output = CalibrationOutput {
            fov_x: 60.0,
            focal_length_mm: 4.5,
            principal_pixel_point_x: 960.0,
            principal_pixel_point_y: 540.0,
            k1: 0.1,
            k2: 0.2,
            p1: 0.3,
            p2: 0.4,
            k3: 0.5,
            k4: 0.6,
            ..Default::default()
        };
        let result = CalibrationResult::solved(base(), &output, (1920, 1080), 4);
        let json = serde_json::to_value(result.to_record()).unwrap();

        let record = &json["result"];
        assert_eq!(record["width"], 1920);
        assert_eq!(record["friendlyname"], "zoom-0");
        assert_eq!(record["perspectivematrix"].as_array().unwrap().len(), 16);
        assert_eq!(record["resolution"]["y"], 1080.0);

        let coeffs: Vec<f64> = record["distortioncoefficients"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        assert_eq!(coeffs.len(), 5);
        assert!((coeffs[4] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_failed_result() {
        let result = CalibrationResult::failed(base());
        assert!(!result.success);
        assert_eq!(result.image_count, 0);
    }
}

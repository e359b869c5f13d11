//! OpenCV-backed vision library.
//!
//! Searches with `find_chessboard_corners` (or the sector-based variant for
//! exhaustive searches) and solves with `calibrate_camera`.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};
use opencv::calib3d;
use opencv::core::{
    Mat, Point2d, Point2f, Point3f, Size, TermCriteria, TermCriteria_Type, Vector, CV_64F,
};
use opencv::imgproc;
use opencv::prelude::*;

use super::{sensor_size_from_diagonal, CalibrationOutput, VisionLibrary};
use crate::config::{CalibrationParameters, ChessboardSearchParameters};
use crate::error::VisionError;
use crate::work_unit::{GridSize, ResizeParameters};

fn cv_err(e: opencv::Error) -> VisionError {
    VisionError::SolveFailed(format!("OpenCV error: {}", e))
}

/// Vision library using OpenCV's calib3d module.
pub struct OpenCvVision {
    /// Sub-pixel refinement window half-size.
    pub sub_pix_window: i32,
    /// Iteration cap for refinement and solve.
    pub max_iterations: i32,
    /// Convergence epsilon for refinement and solve.
    pub epsilon: f64,
}

impl Default for OpenCvVision {
    fn default() -> Self {
        Self {
            sub_pix_window: 11,
            max_iterations: 30,
            epsilon: 0.001,
        }
    }
}

impl OpenCvVision {
    pub fn new() -> Self {
        Self::default()
    }

    fn criteria(&self) -> Result<TermCriteria, VisionError> {
        TermCriteria::new(
            TermCriteria_Type::COUNT as i32 | TermCriteria_Type::EPS as i32,
            self.max_iterations,
            self.epsilon,
        )
        .map_err(cv_err)
    }

    /// Grayscale, resize and flip into the search image.
    fn prepare(
        &self,
        resize: &ResizeParameters,
        search: &ChessboardSearchParameters,
        image: &RgbaImage,
    ) -> GrayImage {
        let mut gray = imageops::grayscale(image);

        if resize.resize_x > 0
            && resize.resize_y > 0
            && (resize.resize_x, resize.resize_y) != gray.dimensions()
        {
            gray = imageops::resize(&gray, resize.resize_x, resize.resize_y, FilterType::Triangle);
        }
        if search.flip_x {
            imageops::flip_horizontal_in_place(&mut gray);
        }
        if search.flip_y {
            imageops::flip_vertical_in_place(&mut gray);
        }

        gray
    }

    fn gray_to_mat(gray: &GrayImage) -> Result<Mat, VisionError> {
        let (_, height) = gray.dimensions();
        let flat = Mat::from_slice(gray.as_raw()).map_err(cv_err)?;
        let shaped = flat.reshape(1, height as i32).map_err(cv_err)?;
        shaped.try_clone().map_err(cv_err)
    }

    fn calibration_flags(calibration: &CalibrationParameters) -> i32 {
        let mut flags = 0;
        let toggles = [
            (calibration.use_initial_intrinsic_values, calib3d::CALIB_USE_INTRINSIC_GUESS),
            (calibration.keep_principal_pixel_position_fixed, calib3d::CALIB_FIX_PRINCIPAL_POINT),
            (calibration.keep_aspect_ratio_fixed, calib3d::CALIB_FIX_ASPECT_RATIO),
            (!calibration.lens_has_tangential_distortion, calib3d::CALIB_ZERO_TANGENT_DIST),
            (calibration.fix_radial_distortion_coefficient_k1, calib3d::CALIB_FIX_K1),
            (calibration.fix_radial_distortion_coefficient_k2, calib3d::CALIB_FIX_K2),
            (calibration.fix_radial_distortion_coefficient_k3, calib3d::CALIB_FIX_K3),
            (calibration.fix_radial_distortion_coefficient_k4, calib3d::CALIB_FIX_K4),
            (calibration.fix_radial_distortion_coefficient_k5, calib3d::CALIB_FIX_K5),
            (calibration.fix_radial_distortion_coefficient_k6, calib3d::CALIB_FIX_K6),
            (calibration.use_rational_model, calib3d::CALIB_RATIONAL_MODEL),
        ];
        for (enabled, flag) in toggles {
            if enabled {
                flags |= flag;
            }
        }
        flags
    }
}

impl VisionLibrary for OpenCvVision {
    fn detect_corners(
        &self,
        resize: &ResizeParameters,
        search: &ChessboardSearchParameters,
        image: &RgbaImage,
        debug: bool,
    ) -> Result<Vec<f32>, VisionError> {
        let gray = self.prepare(resize, search, image);
        let mat = Self::gray_to_mat(&gray)?;
        let pattern = Size::new(search.corner_count_x as i32, search.corner_count_y as i32);
        let mut corners = Vector::<Point2f>::new();

        let found = if search.exhaustive_search {
            calib3d::find_chessboard_corners_sb(
                &mat,
                pattern,
                &mut corners,
                calib3d::CALIB_CB_EXHAUSTIVE | calib3d::CALIB_CB_ACCURACY,
            )
            .map_err(cv_err)?
        } else {
            let found = calib3d::find_chessboard_corners(
                &mat,
                pattern,
                &mut corners,
                calib3d::CALIB_CB_ADAPTIVE_THRESH
                    | calib3d::CALIB_CB_NORMALIZE_IMAGE
                    | calib3d::CALIB_CB_FAST_CHECK,
            )
            .map_err(cv_err)?;

            if found {
                imgproc::corner_sub_pix(
                    &mat,
                    &mut corners,
                    Size::new(self.sub_pix_window, self.sub_pix_window),
                    Size::new(-1, -1),
                    self.criteria()?,
                )
                .map_err(cv_err)?;
            }
            found
        };

        if !found || corners.len() != pattern.area() as usize {
            if debug {
                log::debug!(
                    "Checkerboard {}x{} not found in {}x{} search image",
                    pattern.width,
                    pattern.height,
                    gray.width(),
                    gray.height()
                );
            }
            return Err(VisionError::PatternNotFound);
        }

        Ok(corners.iter().flat_map(|p| [p.x, p.y]).collect())
    }

    fn calibrate_lens(
        &self,
        resize: &ResizeParameters,
        calibration: &CalibrationParameters,
        corners: &[f32],
        square_size_mm: f32,
        grid: GridSize,
        image_count: usize,
        debug: bool,
    ) -> Result<CalibrationOutput, VisionError> {
        let per_image = grid.corner_count().saturating_mul(2);
        if per_image == 0 || image_count == 0 || corners.len() != per_image * image_count {
            return Err(VisionError::SolveFailed(format!(
                "Expected {} corner floats for {} images of a {} grid, got {}",
                per_image * image_count,
                image_count,
                grid,
                corners.len()
            )));
        }

        let board: Vector<Point3f> = (0..grid.rows)
            .flat_map(|y| (0..grid.cols).map(move |x| (x, y)))
            .map(|(x, y)| Point3f::new(x as f32 * square_size_mm, y as f32 * square_size_mm, 0.0))
            .collect();

        let mut object_points = Vector::<Vector<Point3f>>::new();
        let mut image_points = Vector::<Vector<Point2f>>::new();
        for chunk in corners.chunks_exact(per_image) {
            let points: Vector<Point2f> = chunk
                .chunks_exact(2)
                .map(|p| Point2f::new(p[0], p[1]))
                .collect();
            image_points.push(points);
            object_points.push(board.clone());
        }

        let image_size = Size::new(resize.native_x as i32, resize.native_y as i32);
        let mut camera_matrix = Mat::eye(3, 3, CV_64F)
            .and_then(|m| m.to_mat())
            .map_err(cv_err)?;
        if calibration.use_initial_intrinsic_values {
            *camera_matrix.at_2d_mut::<f64>(0, 2).map_err(cv_err)? =
                calibration.initial_principal_point_native_pixel_position_x as f64;
            *camera_matrix.at_2d_mut::<f64>(1, 2).map_err(cv_err)? =
                calibration.initial_principal_point_native_pixel_position_y as f64;
        }

        let mut dist_coeffs = Mat::default();
        let mut rvecs = Vector::<Mat>::new();
        let mut tvecs = Vector::<Mat>::new();

        let error = calib3d::calibrate_camera(
            &object_points,
            &image_points,
            image_size,
            &mut camera_matrix,
            &mut dist_coeffs,
            &mut rvecs,
            &mut tvecs,
            Self::calibration_flags(calibration),
            self.criteria()?,
        )
        .map_err(cv_err)?;

        let (sensor_x, sensor_y) = sensor_size_from_diagonal(
            calibration.sensor_diagonal_size_mm,
            resize.native_x,
            resize.native_y,
        );

        let mut fov_x = 0.0;
        let mut fov_y = 0.0;
        let mut focal_length = 0.0;
        let mut principal_mm = Point2d::default();
        let mut aspect_ratio = 0.0;
        calib3d::calibration_matrix_values(
            &camera_matrix,
            image_size,
            sensor_x as f64,
            sensor_y as f64,
            &mut fov_x,
            &mut fov_y,
            &mut focal_length,
            &mut principal_mm,
            &mut aspect_ratio,
        )
        .map_err(cv_err)?;

        let cx = *camera_matrix.at_2d::<f64>(0, 2).map_err(cv_err)?;
        let cy = *camera_matrix.at_2d::<f64>(1, 2).map_err(cv_err)?;

        let coeffs: Vec<f64> = dist_coeffs
            .data_typed::<f64>()
            .map(|d| d.to_vec())
            .map_err(cv_err)?;
        let coeff = |i: usize| coeffs.get(i).copied().unwrap_or(0.0) as f32;

        if debug {
            log::debug!(
                "Solved {} images with reprojection error {:.4} and {} distortion coefficients",
                image_count,
                error,
                coeffs.len()
            );
        }

        Ok(CalibrationOutput {
            error: error as f32,
            fov_x: fov_x as f32,
            fov_y: fov_y as f32,
            focal_length_mm: focal_length as f32,
            aspect_ratio: aspect_ratio as f32,
            sensor_size_mm_x: sensor_x,
            sensor_size_mm_y: sensor_y,
            principal_pixel_point_x: cx as f32,
            principal_pixel_point_y: cy as f32,
            resolution_x: resize.native_x,
            resolution_y: resize.native_y,
            k1: coeff(0),
            k2: coeff(1),
            p1: coeff(2),
            p2: coeff(3),
            k3: coeff(4),
            k4: coeff(5),
            k5: coeff(6),
            k6: coeff(7),
        })
    }
}

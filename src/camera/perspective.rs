//! Implements the perspective camera model with radial distortion.
//!
//! This module provides the [`PerspectiveCamera`] struct and its associated
//! methods for representing a pinhole camera with an optional two-coefficient
//! radial distortion polynomial. It adheres to the [`CameraModel`] trait
//! defined in the parent `camera` module ([`crate::camera`]). With both
//! distortion coefficients at zero this is a plain pinhole camera, which is
//! the form every undistorted view produced by this crate takes.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Represents a perspective camera with radial distortion.
///
/// This struct holds the intrinsic parameters (focal length, principal point),
/// image resolution and the two radial distortion coefficients `k1`, `k2`.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use undistort_tools::camera::perspective::PerspectiveCamera;
/// use undistort_tools::camera::{CameraModel, Intrinsics, Resolution};
///
/// let model = PerspectiveCamera::new(
///     Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 },
///     Resolution { width: 640, height: 480 },
///     [0.0, 0.0],
/// )
/// .unwrap();
///
/// // With zero distortion this is the plain pinhole projection.
/// let pixel = model.project(&Vector3::new(0.1, 0.2, 1.0)).unwrap();
/// assert!((pixel.x - 370.0).abs() < 1e-9);
/// assert!((pixel.y - 340.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveCamera {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The radial distortion coefficients `[k1, k2]`.
    pub distortions: [f64; 2],
}

impl PerspectiveCamera {
    /// Creates a new [`PerspectiveCamera`] and validates its parameters.
    ///
    /// # Errors
    ///
    /// Returns a [`CameraModelError`] if the intrinsics are invalid:
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    pub fn new(
        intrinsics: Intrinsics,
        resolution: Resolution,
        distortions: [f64; 2],
    ) -> Result<Self, CameraModelError> {
        let model = PerspectiveCamera {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// True when both radial coefficients are exactly zero.
    pub fn is_distortion_free(&self) -> bool {
        self.distortions == [0.0, 0.0]
    }
}

impl CameraModel for PerspectiveCamera {
    /// Projects a 3D point from camera coordinates to pixel coordinates.
    ///
    /// The point is first normalized to the image plane, the radial
    /// polynomial `1 + k1*r^2 + k2*r^4` is applied, and the distorted
    /// coordinates are mapped through the intrinsics:
    /// `u = fx * d * X/Z + cx`, `v = fy * d * Y/Z + cy`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: if the point's
    ///   Z-coordinate is too close to zero.
    fn project(&self, bearing: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        // If z is very small, the point is at the camera center
        if bearing.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let x_prime = bearing.x / bearing.z;
        let y_prime = bearing.y / bearing.z;

        let k1 = self.distortions[0];
        let k2 = self.distortions[1];
        let r2 = x_prime * x_prime + y_prime * y_prime;
        let distortion = 1.0 + r2 * (k1 + k2 * r2);

        let u = self.intrinsics.fx * distortion * x_prime + self.intrinsics.cx;
        let v = self.intrinsics.fy * distortion * y_prime + self.intrinsics.cy;

        Ok(Vector2::new(u, v))
    }

    /// Unprojects pixel coordinates to a unit bearing in camera coordinates.
    ///
    /// The distorted normalized radius is inverted with Newton's method on the
    /// scalar polynomial `r * (1 + k1*r^2 + k2*r^4)`, then the undistorted
    /// plane coordinates are lifted to a ray and normalized. With zero
    /// distortion the inversion is skipped entirely.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`]: if the radius inversion fails
    ///   to converge.
    fn unproject(&self, pixel: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let mx = (pixel.x - self.intrinsics.cx) / self.intrinsics.fx;
        let my = (pixel.y - self.intrinsics.cy) / self.intrinsics.fy;

        let (x, y) = if self.is_distortion_free() {
            (mx, my)
        } else {
            let k1 = self.distortions[0];
            let k2 = self.distortions[1];
            let rd = (mx * mx + my * my).sqrt();
            if rd < f64::EPSILON {
                (mx, my)
            } else {
                // Solve r * (1 + k1*r^2 + k2*r^4) = rd for the undistorted radius.
                const EPS: f64 = 1e-12;
                const MAX_ITERATIONS: u32 = 20;

                let mut r = rd;
                let mut converged = false;
                for _ in 0..MAX_ITERATIONS {
                    let r2 = r * r;
                    let f = r * (1.0 + r2 * (k1 + k2 * r2)) - rd;
                    if f.abs() < EPS {
                        converged = true;
                        break;
                    }
                    let df = 1.0 + r2 * (3.0 * k1 + 5.0 * k2 * r2);
                    if df.abs() < f64::EPSILON {
                        return Err(CameraModelError::NumericalError(
                            "Radial distortion derivative vanished".to_string(),
                        ));
                    }
                    r -= f / df;
                }
                if !converged {
                    return Err(CameraModelError::NumericalError(format!(
                        "Radius inversion did not converge after {} iterations",
                        MAX_ITERATIONS
                    )));
                }
                let scale = r / rd;
                (mx * scale, my * scale)
            }
        };

        let ray = Vector3::new(x, y, 1.0);
        Ok(ray.normalize())
    }

    /// Validates the intrinsic parameters of the camera model.
    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_resolution(&self.resolution)?;
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution.clone()
    }

    /// Returns the distortion coefficients in the order `[k1, k2]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn get_sample_model() -> PerspectiveCamera {
        PerspectiveCamera {
            intrinsics: Intrinsics {
                fx: 480.0,
                fy: 480.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution: Resolution {
                width: 640,
                height: 480,
            },
            distortions: [-0.15, 0.02],
        }
    }

    #[test]
    fn test_perspective_project_unproject() {
        let model = get_sample_model();

        let point_3d = Vector3::new(0.2, -0.1, 1.5);
        let norm_3d = point_3d.normalize();

        let pixel = model.project(&point_3d).unwrap();
        let unprojected = model.unproject(&pixel).unwrap();

        assert_relative_eq!(norm_3d.x, unprojected.x, epsilon = 1e-9);
        assert_relative_eq!(norm_3d.y, unprojected.y, epsilon = 1e-9);
        assert_relative_eq!(norm_3d.z, unprojected.z, epsilon = 1e-9);
    }

    #[test]
    fn test_perspective_distortion_free_is_pinhole() {
        let mut model = get_sample_model();
        model.distortions = [0.0, 0.0];
        assert!(model.is_distortion_free());

        let pixel = model.project(&Vector3::new(0.1, 0.2, 1.0)).unwrap();
        assert_relative_eq!(pixel.x, 480.0 * 0.1 + 320.0, epsilon = 1e-9);
        assert_relative_eq!(pixel.y, 480.0 * 0.2 + 240.0, epsilon = 1e-9);

        let bearing = model.unproject(&pixel).unwrap();
        assert_relative_eq!(bearing.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_perspective_point_at_camera_center() {
        let model = get_sample_model();
        let result = model.project(&Vector3::new(0.1, 0.1, 0.0));
        assert!(matches!(result, Err(CameraModelError::PointAtCameraCenter)));
    }

    #[test]
    fn test_perspective_distortion_shifts_pixels() {
        let model = get_sample_model();
        let mut undistorted = get_sample_model();
        undistorted.distortions = [0.0, 0.0];

        // Barrel distortion (negative k1) pulls off-center points inward.
        let point_3d = Vector3::new(0.4, 0.3, 1.0);
        let distorted_px = model.project(&point_3d).unwrap();
        let straight_px = undistorted.project(&point_3d).unwrap();

        let center = Vector2::new(320.0, 240.0);
        assert!((distorted_px - center).norm() < (straight_px - center).norm());
    }

    #[test]
    fn test_perspective_new_rejects_bad_focal() {
        let result = PerspectiveCamera::new(
            Intrinsics {
                fx: 0.0,
                fy: 480.0,
                cx: 320.0,
                cy: 240.0,
            },
            Resolution {
                width: 640,
                height: 480,
            },
            [0.0, 0.0],
        );
        assert!(matches!(
            result,
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
    }
}

//! Implements the Brown-Conrady camera model with radial and tangential
//! distortion, the common model for calibrated wide-angle SLR-style lenses.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Brown-Conrady camera: pinhole intrinsics plus three radial (`k1`, `k2`,
/// `k3`) and two tangential (`p1`, `p2`) distortion coefficients, stored in
/// the order `[k1, k2, p1, p2, k3]`.
#[derive(Clone, Serialize, Deserialize)]
pub struct BrownCamera {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The distortion coefficients `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

impl BrownCamera {
    pub fn new(
        intrinsics: Intrinsics,
        resolution: Resolution,
        distortions: [f64; 5],
    ) -> Result<Self, CameraModelError> {
        let model = BrownCamera {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Effective focal length in pixels, the mean of the two axes.
    pub fn effective_focal(&self) -> f64 {
        0.5 * (self.intrinsics.fx + self.intrinsics.fy)
    }
}

impl fmt::Debug for BrownCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BrownCamera [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for BrownCamera {
    /// Projects a 3D point to pixel coordinates, applying radial and
    /// tangential distortion on the normalized image plane.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: if the point's
    ///   Z-coordinate is too close to zero.
    fn project(&self, bearing: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if bearing.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let [k1, k2, p1, p2, k3] = self.distortions;

        let x = bearing.x / bearing.z;
        let y = bearing.y / bearing.z;

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

        let x_distorted = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let y_distorted = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

        let u = self.intrinsics.fx * x_distorted + self.intrinsics.cx;
        let v = self.intrinsics.fy * y_distorted + self.intrinsics.cy;

        Ok(Vector2::new(u, v))
    }

    /// Unprojects pixel coordinates to a unit bearing by inverting the
    /// distortion with Newton's method on the normalized image plane.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`]: if the Jacobian becomes
    ///   singular or the iteration does not converge.
    fn unproject(&self, pixel: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;

        let x_distorted = (pixel.x - self.intrinsics.cx) / self.intrinsics.fx;
        let y_distorted = (pixel.y - self.intrinsics.cy) / self.intrinsics.fy;
        let target = Vector2::new(x_distorted, y_distorted);

        // Initial guess: the distorted point itself.
        let mut point = target;

        const EPS: f64 = 1e-10;
        const MAX_ITERATIONS: u32 = 100;

        let mut converged = false;
        for _ in 0..MAX_ITERATIONS {
            let x = point.x;
            let y = point.y;
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;

            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

            let estimate = Vector2::new(
                x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
                y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
            );
            let error = estimate - target;
            if error.norm() < EPS {
                converged = true;
                break;
            }

            // Jacobian of the distortion map at the current estimate.
            let dr_dx = 2.0 * x;
            let dr_dy = 2.0 * y;
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;
            let d_radial_dx = d_radial * dr_dx;
            let d_radial_dy = d_radial * dr_dy;

            let j00 = radial + x * d_radial_dx + 2.0 * p1 * y + p2 * (dr_dx + 4.0 * x);
            let j01 = x * d_radial_dy + 2.0 * p1 * x + p2 * dr_dy;
            let j10 = y * d_radial_dx + p1 * dr_dx + 2.0 * p2 * y;
            let j11 = radial + y * d_radial_dy + p1 * (dr_dy + 4.0 * y) + 2.0 * p2 * x;

            let jacobian = Matrix2::new(j00, j01, j10, j11);
            let Some(inv_jacobian) = jacobian.try_inverse() else {
                return Err(CameraModelError::NumericalError(
                    "Jacobian is singular".to_string(),
                ));
            };

            let delta = inv_jacobian * error;
            point -= delta;

            if delta.norm() < EPS {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(CameraModelError::NumericalError(format!(
                "Unprojection did not converge after {} iterations",
                MAX_ITERATIONS
            )));
        }

        let ray = Vector3::new(point.x, point.y, 1.0);
        Ok(ray.normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_resolution(&self.resolution)?;
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution.clone()
    }

    /// Returns the distortion coefficients in the order `[k1, k2, p1, p2, k3]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

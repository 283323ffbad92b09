//! Equidistant fisheye camera models: the two-coefficient variant and the
//! four-coefficient OpenCV (Kannala-Brandt) variant. Both map the incidence
//! angle theta through an odd polynomial, which keeps them defined beyond a
//! 180 degree field of view.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-10;
const MAX_ITERATIONS: u32 = 100;

/// Solve `theta * poly(theta^2) = rd` for theta with Newton's method.
///
/// `coeffs` are the polynomial coefficients (k1, k2, ...) applied to rising
/// odd powers of theta above the linear term.
fn invert_theta_polynomial(rd: f64, coeffs: &[f64]) -> Result<f64, CameraModelError> {
    let mut theta = rd;
    for _ in 0..MAX_ITERATIONS {
        let theta2 = theta * theta;

        let mut f = theta;
        let mut df = 1.0;
        let mut power = theta2;
        for (i, k) in coeffs.iter().enumerate() {
            f += k * theta * power;
            df += (2 * i + 3) as f64 * k * power;
            power *= theta2;
        }
        f -= rd;

        if f.abs() < EPS {
            return Ok(theta);
        }
        if df.abs() < f64::EPSILON {
            return Err(CameraModelError::NumericalError(
                "Theta polynomial derivative vanished".to_string(),
            ));
        }
        theta -= f / df;
    }
    Err(CameraModelError::NumericalError(format!(
        "Theta inversion did not converge after {} iterations",
        MAX_ITERATIONS
    )))
}

fn project_theta_polynomial(
    bearing: &Vector3<f64>,
    intrinsics: &Intrinsics,
    coeffs: &[f64],
) -> Result<Vector2<f64>, CameraModelError> {
    if bearing.norm() < f64::EPSILON.sqrt() {
        return Err(CameraModelError::PointAtCameraCenter);
    }

    let r = (bearing.x * bearing.x + bearing.y * bearing.y).sqrt();
    if r < f64::EPSILON {
        if bearing.z > 0.0 {
            return Ok(Vector2::new(intrinsics.cx, intrinsics.cy));
        }
        // Looking exactly backwards: the azimuth is undefined.
        return Err(CameraModelError::PointAtCameraCenter);
    }

    let theta = r.atan2(bearing.z);
    let theta2 = theta * theta;

    let mut d = theta;
    let mut power = theta2;
    for k in coeffs {
        d += k * theta * power;
        power *= theta2;
    }

    let u = intrinsics.fx * d * bearing.x / r + intrinsics.cx;
    let v = intrinsics.fy * d * bearing.y / r + intrinsics.cy;
    Ok(Vector2::new(u, v))
}

fn unproject_theta_polynomial(
    pixel: &Vector2<f64>,
    intrinsics: &Intrinsics,
    coeffs: &[f64],
) -> Result<Vector3<f64>, CameraModelError> {
    let mx = (pixel.x - intrinsics.cx) / intrinsics.fx;
    let my = (pixel.y - intrinsics.cy) / intrinsics.fy;

    let rd = (mx * mx + my * my).sqrt();
    if rd < f64::EPSILON {
        return Ok(Vector3::new(0.0, 0.0, 1.0));
    }

    let theta = invert_theta_polynomial(rd, coeffs)?;
    let (sin_theta, cos_theta) = theta.sin_cos();
    Ok(Vector3::new(
        sin_theta * mx / rd,
        sin_theta * my / rd,
        cos_theta,
    ))
}

/// Equidistant fisheye camera with two radial coefficients:
/// `r = f * theta * (1 + k1*theta^2 + k2*theta^4)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FisheyeCamera {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// The radial coefficients `[k1, k2]`.
    pub distortions: [f64; 2],
}

impl FisheyeCamera {
    pub fn new(
        intrinsics: Intrinsics,
        resolution: Resolution,
        distortions: [f64; 2],
    ) -> Result<Self, CameraModelError> {
        let model = FisheyeCamera {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }
}

impl CameraModel for FisheyeCamera {
    fn project(&self, bearing: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        project_theta_polynomial(bearing, &self.intrinsics, &self.distortions)
    }

    fn unproject(&self, pixel: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        unproject_theta_polynomial(pixel, &self.intrinsics, &self.distortions)
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_resolution(&self.resolution)?;
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution.clone()
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

/// OpenCV-style fisheye camera (Kannala-Brandt) with four radial
/// coefficients: `r = f * theta * (1 + k1*theta^2 + ... + k4*theta^8)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FisheyeOpencvCamera {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// The radial coefficients `[k1, k2, k3, k4]`.
    pub distortions: [f64; 4],
}

impl FisheyeOpencvCamera {
    pub fn new(
        intrinsics: Intrinsics,
        resolution: Resolution,
        distortions: [f64; 4],
    ) -> Result<Self, CameraModelError> {
        let model = FisheyeOpencvCamera {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }
}

impl CameraModel for FisheyeOpencvCamera {
    fn project(&self, bearing: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        project_theta_polynomial(bearing, &self.intrinsics, &self.distortions)
    }

    fn unproject(&self, pixel: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        unproject_theta_polynomial(pixel, &self.intrinsics, &self.distortions)
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_resolution(&self.resolution)?;
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution.clone()
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

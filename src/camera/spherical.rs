//! Equirectangular (spherical) panorama camera. Covers the full sphere, so
//! it has no focal length: pixels map to bearings through longitude and
//! latitude alone.

use crate::camera::{validation, CameraModel, CameraModelError, Resolution};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// A 360 x 180 degree equirectangular camera. The horizontal axis spans
/// longitude `[-pi, pi]`, the vertical axis latitude `[pi/2, -pi/2]`, with
/// y pointing down in the camera frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SphericalCamera {
    pub resolution: Resolution,
}

impl SphericalCamera {
    pub fn new(resolution: Resolution) -> Result<Self, CameraModelError> {
        let model = SphericalCamera { resolution };
        model.validate_params()?;
        Ok(model)
    }
}

impl CameraModel for SphericalCamera {
    /// Projects a bearing to pixel coordinates. Defined for every direction
    /// except the zero vector.
    fn project(&self, bearing: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if bearing.norm() < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let lon = bearing.x.atan2(bearing.z);
        let lat = (-bearing.y).atan2((bearing.x * bearing.x + bearing.z * bearing.z).sqrt());

        let u = (lon / (2.0 * PI) + 0.5) * self.resolution.width as f64;
        let v = (0.5 - lat / PI) * self.resolution.height as f64;
        Ok(Vector2::new(u, v))
    }

    /// Unprojects pixel coordinates to a unit bearing. Total on the image
    /// plane; coordinates outside the frame wrap around the sphere.
    fn unproject(&self, pixel: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let lon = (pixel.x / self.resolution.width as f64 - 0.5) * 2.0 * PI;
        let lat = (0.5 - pixel.y / self.resolution.height as f64) * PI;

        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();
        Ok(Vector3::new(cos_lat * sin_lon, -sin_lat, cos_lat * cos_lon))
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_resolution(&self.resolution)?;
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution.clone()
    }

    fn get_distortion(&self) -> Vec<f64> {
        vec![]
    }
}

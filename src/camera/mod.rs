use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;

pub mod brown;
pub mod fisheye;
pub mod perspective;
pub mod spherical;

pub use brown::BrownCamera;
pub use fisheye::{FisheyeCamera, FisheyeOpencvCamera};
pub use perspective::PerspectiveCamera;
pub use spherical::SphericalCamera;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraModelError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models.
///
/// `project` and `unproject` are pure geometric mappings between bearings in
/// the camera frame and continuous pixel coordinates. Neither checks the
/// result against the image bounds: whether an out-of-frame coordinate is an
/// error depends on the caller (panorama tile assignment and image resampling
/// apply their own containment rules).
pub trait CameraModel {
    /// Project a bearing (or 3D point in camera coordinates) to pixel coordinates.
    fn project(&self, bearing: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject pixel coordinates to a unit-length bearing in camera coordinates.
    fn unproject(&self, pixel: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Validate camera parameters.
    fn validate_params(&self) -> Result<(), CameraModelError>;

    /// The camera's image resolution.
    fn get_resolution(&self) -> Resolution;

    /// The camera's distortion coefficients, empty for distortion-free models.
    fn get_distortion(&self) -> Vec<f64>;
}

/// Closed set of supported projection families.
///
/// Serialized with a `projection_type` tag so cameras round-trip through
/// YAML/JSON with the wire names `perspective`, `brown`, `fisheye`,
/// `fisheye_opencv` and `spherical`. Adding a family means adding a variant,
/// and every `match` on this enum is then checked at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "projection_type", rename_all = "snake_case")]
pub enum Projection {
    Perspective(PerspectiveCamera),
    Brown(BrownCamera),
    Fisheye(FisheyeCamera),
    FisheyeOpencv(FisheyeOpencvCamera),
    Spherical(SphericalCamera),
}

impl Projection {
    /// The wire name of this projection family.
    pub fn name(&self) -> &'static str {
        match self {
            Projection::Perspective(_) => "perspective",
            Projection::Brown(_) => "brown",
            Projection::Fisheye(_) => "fisheye",
            Projection::FisheyeOpencv(_) => "fisheye_opencv",
            Projection::Spherical(_) => "spherical",
        }
    }
}

/// An identified camera: an id plus one projection model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub id: String,
    #[serde(flatten)]
    pub projection: Projection,
}

impl Camera {
    pub fn new(id: impl Into<String>, projection: Projection) -> Self {
        Camera {
            id: id.into(),
            projection,
        }
    }

    /// The wire name of this camera's projection family.
    pub fn projection_type(&self) -> &'static str {
        self.projection.name()
    }

    pub fn is_spherical(&self) -> bool {
        matches!(self.projection, Projection::Spherical(_))
    }

    /// Parse a camera from a YAML document.
    pub fn from_yaml_str(contents: &str) -> Result<Self, CameraModelError> {
        let camera: Camera = serde_yaml::from_str(contents)?;
        camera.validate_params()?;
        Ok(camera)
    }

    /// Serialize the camera to a YAML document.
    pub fn to_yaml_str(&self) -> Result<String, CameraModelError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load a camera from a YAML file.
    pub fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Save the camera to a YAML file.
    pub fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let yaml_string = self.to_yaml_str()?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }
}

impl CameraModel for Camera {
    fn project(&self, bearing: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        match &self.projection {
            Projection::Perspective(m) => m.project(bearing),
            Projection::Brown(m) => m.project(bearing),
            Projection::Fisheye(m) => m.project(bearing),
            Projection::FisheyeOpencv(m) => m.project(bearing),
            Projection::Spherical(m) => m.project(bearing),
        }
    }

    fn unproject(&self, pixel: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        match &self.projection {
            Projection::Perspective(m) => m.unproject(pixel),
            Projection::Brown(m) => m.unproject(pixel),
            Projection::Fisheye(m) => m.unproject(pixel),
            Projection::FisheyeOpencv(m) => m.unproject(pixel),
            Projection::Spherical(m) => m.unproject(pixel),
        }
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        match &self.projection {
            Projection::Perspective(m) => m.validate_params(),
            Projection::Brown(m) => m.validate_params(),
            Projection::Fisheye(m) => m.validate_params(),
            Projection::FisheyeOpencv(m) => m.validate_params(),
            Projection::Spherical(m) => m.validate_params(),
        }
    }

    fn get_resolution(&self) -> Resolution {
        match &self.projection {
            Projection::Perspective(m) => m.get_resolution(),
            Projection::Brown(m) => m.get_resolution(),
            Projection::Fisheye(m) => m.get_resolution(),
            Projection::FisheyeOpencv(m) => m.get_resolution(),
            Projection::Spherical(m) => m.get_resolution(),
        }
    }

    fn get_distortion(&self) -> Vec<f64> {
        match &self.projection {
            Projection::Perspective(m) => m.get_distortion(),
            Projection::Brown(m) => m.get_distortion(),
            Projection::Fisheye(m) => m.get_distortion(),
            Projection::FisheyeOpencv(m) => m.get_distortion(),
            Projection::Spherical(m) => m.get_distortion(),
        }
    }
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_resolution(resolution: &Resolution) -> Result<(), CameraModelError> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(CameraModelError::InvalidParams(
                "Resolution must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

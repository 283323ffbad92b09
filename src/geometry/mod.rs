use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// A rigid camera pose in camera-from-world convention.
///
/// `rotation` and `translation` map world coordinates into the camera frame:
/// `p_camera = R * p_world + t`. The camera center in world coordinates is
/// therefore `-(R^-1 * t)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Pose {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// The camera center in world coordinates.
    pub fn origin(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Map a world point into the camera frame.
    pub fn transform(&self, point_world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point_world + self.translation
    }

    /// Apply an extra rotation in front of this pose, keeping the camera
    /// center fixed: the result maps world points through `R_extra * R`,
    /// with `t' = R_extra * t`.
    ///
    /// This is how a panorama subshot derives its pose from the panorama
    /// shot: the tile rotation turns the viewing direction while the two
    /// cameras share one optical center.
    pub fn compose_rotation(&self, rotation: &UnitQuaternion<f64>) -> Pose {
        Pose {
            rotation: rotation * self.rotation,
            translation: rotation * self.translation,
        }
    }

    /// The rotation taking bearings in this pose's camera frame to bearings
    /// in `other`'s camera frame. Meaningful when both poses share an
    /// origin, as a panorama shot and its subshots do.
    pub fn rotation_to(&self, other: &Pose) -> UnitQuaternion<f64> {
        other.rotation * self.rotation.inverse()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Pose::identity()
    }
}

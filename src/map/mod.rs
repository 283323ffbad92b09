//! The reconstruction data model: cameras, shots, points and the tracks
//! graph that connects shots to the 3D points they observe.

use crate::camera::Camera;
use crate::geometry::Pose;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod tracks;

pub use tracks::{Observation, TracksManager};

pub type CameraId = String;
pub type ShotId = String;
pub type TrackId = String;

#[derive(thiserror::Error, Debug)]
pub enum MapError {
    #[error("Shot '{shot_id}' references missing camera '{camera_id}'")]
    MissingCamera {
        shot_id: ShotId,
        camera_id: CameraId,
    },
}

/// Capture metadata carried by a shot. Subshots derived from a panorama
/// inherit their parent's metadata unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShotMetadata {
    pub capture_time: Option<f64>,
    pub gps_position: Option<[f64; 3]>,
    pub orientation: Option<i32>,
}

/// One image in a reconstruction: a camera reference, a rigid pose and an
/// identifier. `rig_instance` groups the subshots synthesized from one
/// panorama; shots that never were panoramas carry `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shot {
    pub id: ShotId,
    pub camera_id: CameraId,
    pub pose: Pose,
    pub rig_instance: Option<usize>,
    pub metadata: ShotMetadata,
}

impl Shot {
    pub fn new(id: impl Into<ShotId>, camera_id: impl Into<CameraId>, pose: Pose) -> Self {
        Shot {
            id: id.into(),
            camera_id: camera_id.into(),
            pose,
            rig_instance: None,
            metadata: ShotMetadata::default(),
        }
    }
}

/// A triangulated 3D point, keyed by the track that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub id: TrackId,
    pub coordinates: [f64; 3],
    pub color: [f64; 3],
}

/// Geodetic anchor of a reconstruction's local coordinate frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopocentricReference {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// A calibrated scene: cameras, posed shots and triangulated points, all
/// keyed by id. `BTreeMap` keeps iteration sorted by id, which makes every
/// walk over the model reproducible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reconstruction {
    pub cameras: BTreeMap<CameraId, Camera>,
    pub shots: BTreeMap<ShotId, Shot>,
    pub points: BTreeMap<TrackId, Point>,
    pub reference: TopocentricReference,
}

impl Reconstruction {
    pub fn new() -> Self {
        Reconstruction::default()
    }

    /// Insert a camera, replacing any camera with the same id. Replacement
    /// is what lets every panorama of a run share one tile camera.
    pub fn add_camera(&mut self, camera: Camera) {
        self.cameras.insert(camera.id.clone(), camera);
    }

    pub fn get_camera(&self, camera_id: &str) -> Option<&Camera> {
        self.cameras.get(camera_id)
    }

    /// Insert a shot. Fails when the shot references a camera id that is not
    /// present: a reconstruction must never contain dangling camera
    /// references.
    pub fn add_shot(&mut self, shot: Shot) -> Result<(), MapError> {
        if !self.cameras.contains_key(&shot.camera_id) {
            return Err(MapError::MissingCamera {
                shot_id: shot.id.clone(),
                camera_id: shot.camera_id.clone(),
            });
        }
        self.shots.insert(shot.id.clone(), shot);
        Ok(())
    }

    pub fn get_shot(&self, shot_id: &str) -> Option<&Shot> {
        self.shots.get(shot_id)
    }

    pub fn add_point(&mut self, point: Point) {
        self.points.insert(point.id.clone(), point);
    }
}

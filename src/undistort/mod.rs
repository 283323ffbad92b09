//! Conversion of calibrated reconstructions into undistorted,
//! pinhole-equivalent ones.
//!
//! Every distorted camera family maps to a perspective camera with zero
//! distortion; panoramas fan out into six 90 degree cube-face views sharing
//! the panorama's optical center. Track observations follow their shots
//! through the conversion, re-projected into the new image geometry, and an
//! ordered index records which subshots every original shot produced.

use crate::camera::{
    BrownCamera, Camera, CameraModel, CameraModelError, FisheyeCamera, FisheyeOpencvCamera,
    Intrinsics, PerspectiveCamera, Projection, Resolution,
};
use crate::dataset::{DataSet, DataSetError, UndistortedDataSet};
use crate::map::{MapError, Reconstruction, Shot, ShotId, TracksManager};
use log::{debug, info};
use nalgebra::{UnitQuaternion, Vector3};
use std::collections::BTreeMap;
use std::f64::consts::{FRAC_PI_2, PI};

pub mod resample;

pub use resample::{
    undistort_image_and_masks, undistort_images, BearingResampler, ResampleItem, ResampleKernel,
};

/// Tile names of a panorama fan-out, in assignment order. Observations on a
/// tile seam go to the earliest containing tile of this order.
pub const PANORAMA_TILES: [&str; 6] = ["front", "left", "back", "right", "top", "bottom"];

/// Camera id shared by every cube-face view of a run.
pub const PANORAMA_CAMERA_ID: &str = "panorama_perspective";

/// Cap on the half field of view carried over from a fisheye lens, kept
/// below 90 degrees so the equivalent pinhole focal stays finite.
const MAX_HALF_FOV: f64 = 0.45 * PI;

#[derive(thiserror::Error, Debug)]
pub enum UndistortError {
    #[error("Projection type '{0}' cannot be normalized into a perspective camera")]
    UnsupportedProjection(String),
    #[error("Subshot width must be positive, got {0}")]
    InvalidSubshotWidth(i32),
    #[error("Resampling process count must be positive")]
    InvalidProcessCount,
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error(transparent)]
    Dataset(#[from] DataSetError),
    #[error("Resampling shot '{shot_id}' failed: {message}")]
    ResampleFailed { shot_id: ShotId, message: String },
}

/// Explicit source of rig-instance values.
///
/// One counter spans one undistortion run: values start at 0 and increase by
/// one per synthesized panorama, in shot-processing order, so rig grouping is
/// reproducible and never leaks across runs.
#[derive(Debug, Default)]
pub struct RigInstanceCounter {
    next_value: usize,
}

impl RigInstanceCounter {
    pub fn new() -> Self {
        RigInstanceCounter::default()
    }

    pub fn next_instance(&mut self) -> usize {
        let value = self.next_value;
        self.next_value += 1;
        value
    }
}

/// Everything one undistortion run produces, short of resampled imagery.
#[derive(Debug)]
pub struct UndistortedSet {
    /// One undistorted reconstruction per input partial reconstruction, in
    /// input order.
    pub reconstructions: Vec<Reconstruction>,
    /// The re-keyed tracks graph, present exactly when the input had one.
    pub tracks_manager: Option<TracksManager>,
    /// Ordered subshot ids per original shot, across all partial
    /// reconstructions.
    pub shot_index: BTreeMap<ShotId, Vec<ShotId>>,
}

/// A perspective camera with the distortion coefficients cleared and
/// everything else kept.
pub fn perspective_camera_from_perspective(camera: &PerspectiveCamera) -> PerspectiveCamera {
    PerspectiveCamera {
        intrinsics: camera.intrinsics.clone(),
        resolution: camera.resolution.clone(),
        distortions: [0.0, 0.0],
    }
}

/// A perspective camera from a Brown-Conrady one: the effective focal length
/// is applied to both axes, the principal point and resolution are kept, and
/// the distortion is discarded.
pub fn perspective_camera_from_brown(camera: &BrownCamera) -> PerspectiveCamera {
    let focal = camera.effective_focal();
    PerspectiveCamera {
        intrinsics: Intrinsics {
            fx: focal,
            fy: focal,
            cx: camera.intrinsics.cx,
            cy: camera.intrinsics.cy,
        },
        resolution: camera.resolution.clone(),
        distortions: [0.0, 0.0],
    }
}

fn perspective_from_fisheye_fov(
    intrinsics: &Intrinsics,
    resolution: &Resolution,
) -> PerspectiveCamera {
    // The equidistant projection puts the image border at angle r/f; the
    // equivalent pinhole must span the same half field of view.
    let half_width = resolution.width as f64 / 2.0;
    let half_fov = (half_width / intrinsics.fx).min(MAX_HALF_FOV);
    let focal = half_width / half_fov.tan();
    PerspectiveCamera {
        intrinsics: Intrinsics {
            fx: focal,
            fy: focal,
            cx: intrinsics.cx,
            cy: intrinsics.cy,
        },
        resolution: resolution.clone(),
        distortions: [0.0, 0.0],
    }
}

/// A perspective camera spanning the same horizontal field of view as the
/// fisheye, capped below 180 degrees.
pub fn perspective_camera_from_fisheye(camera: &FisheyeCamera) -> PerspectiveCamera {
    perspective_from_fisheye_fov(&camera.intrinsics, &camera.resolution)
}

/// See [`perspective_camera_from_fisheye`]; the four-coefficient variant
/// normalizes the same way.
pub fn perspective_camera_from_fisheye_opencv(camera: &FisheyeOpencvCamera) -> PerspectiveCamera {
    perspective_from_fisheye_fov(&camera.intrinsics, &camera.resolution)
}

/// Normalize a camera into its undistorted perspective equivalent, keeping
/// the camera id.
///
/// # Errors
///
/// [`UndistortError::UnsupportedProjection`] for spherical cameras, which
/// have no pairwise perspective equivalent and are handled by
/// [`perspective_views_of_a_panorama`] instead.
pub fn undistorted_camera(camera: &Camera) -> Result<Camera, UndistortError> {
    let projection = match &camera.projection {
        Projection::Perspective(m) => {
            Projection::Perspective(perspective_camera_from_perspective(m))
        }
        Projection::Brown(m) => Projection::Perspective(perspective_camera_from_brown(m)),
        Projection::Fisheye(m) => Projection::Perspective(perspective_camera_from_fisheye(m)),
        Projection::FisheyeOpencv(m) => {
            Projection::Perspective(perspective_camera_from_fisheye_opencv(m))
        }
        Projection::Spherical(_) => {
            return Err(UndistortError::UnsupportedProjection(
                camera.projection_type().to_string(),
            ))
        }
    };
    Ok(Camera::new(camera.id.clone(), projection))
}

/// The six cube-face tiles: name and the rotation that turns the panorama
/// frame into the tile's camera frame.
fn panorama_tiles() -> [(&'static str, UnitQuaternion<f64>); 6] {
    let y_axis = Vector3::y_axis();
    let x_axis = Vector3::x_axis();
    [
        ("front", UnitQuaternion::identity()),
        ("left", UnitQuaternion::from_axis_angle(&y_axis, -FRAC_PI_2)),
        ("back", UnitQuaternion::from_axis_angle(&y_axis, -2.0 * FRAC_PI_2)),
        ("right", UnitQuaternion::from_axis_angle(&y_axis, -3.0 * FRAC_PI_2)),
        ("top", UnitQuaternion::from_axis_angle(&x_axis, -FRAC_PI_2)),
        ("bottom", UnitQuaternion::from_axis_angle(&x_axis, FRAC_PI_2)),
    ]
}

/// The shared 90 degree tile camera for a given subshot width: square image,
/// focal equal to half the width, principal point centered.
fn panorama_tile_camera(subshot_width: u32) -> Camera {
    let half = subshot_width as f64 / 2.0;
    Camera::new(
        PANORAMA_CAMERA_ID,
        Projection::Perspective(PerspectiveCamera {
            intrinsics: Intrinsics {
                fx: half,
                fy: half,
                cx: half,
                cy: half,
            },
            resolution: Resolution {
                width: subshot_width,
                height: subshot_width,
            },
            distortions: [0.0, 0.0],
        }),
    )
}

/// Copy a shot into the undistorted reconstruction with a different camera,
/// keeping id, pose and metadata. The camera must already be present in
/// `undistorted`.
pub fn get_shot_with_different_camera(
    undistorted: &mut Reconstruction,
    shot: &Shot,
    camera: &Camera,
) -> Result<Shot, UndistortError> {
    let subshot = Shot {
        id: shot.id.clone(),
        camera_id: camera.id.clone(),
        pose: shot.pose.clone(),
        rig_instance: None,
        metadata: shot.metadata.clone(),
    };
    undistorted.add_shot(subshot.clone())?;
    Ok(subshot)
}

/// Synthesize the six cube-face views of a panorama shot.
///
/// Inserts the shared tile camera and six subshots into `undistorted` and
/// returns the subshots in tile order. Subshot ids are `{shot_id}_{tile}`;
/// every subshot keeps the panorama's optical center and metadata, and all
/// six share one freshly drawn rig-instance value.
///
/// # Errors
///
/// [`UndistortError::InvalidSubshotWidth`] when `subshot_width` is not
/// positive; nothing is inserted in that case.
pub fn perspective_views_of_a_panorama(
    shot: &Shot,
    subshot_width: i32,
    undistorted: &mut Reconstruction,
    rig_counter: &mut RigInstanceCounter,
) -> Result<Vec<Shot>, UndistortError> {
    if subshot_width <= 0 {
        return Err(UndistortError::InvalidSubshotWidth(subshot_width));
    }
    undistorted.add_camera(panorama_tile_camera(subshot_width as u32));

    let rig_instance = rig_counter.next_instance();
    let mut subshots = Vec::with_capacity(PANORAMA_TILES.len());
    for (tile, rotation) in panorama_tiles() {
        let subshot = Shot {
            id: format!("{}_{}", shot.id, tile),
            camera_id: PANORAMA_CAMERA_ID.to_string(),
            pose: shot.pose.compose_rotation(&rotation),
            rig_instance: Some(rig_instance),
            metadata: shot.metadata.clone(),
        };
        undistorted.add_shot(subshot.clone())?;
        subshots.push(subshot);
    }
    Ok(subshots)
}

/// Pick the tile most aligned with `bearing`: the one maximizing the rotated
/// forward component. Strict comparison keeps the earliest tile on exact
/// ties, so seam observations always land on the lowest tile index.
fn best_tile_index(
    rotations: &[UnitQuaternion<f64>],
    bearing: &Vector3<f64>,
) -> (usize, Vector3<f64>) {
    let mut best_index = 0;
    let mut best_rotated = rotations[0] * bearing;
    for (index, rotation) in rotations.iter().enumerate().skip(1) {
        let rotated = rotation * bearing;
        if rotated.z > best_rotated.z {
            best_index = index;
            best_rotated = rotated;
        }
    }
    (best_index, best_rotated)
}

/// Re-key one shot's observations onto its subshots.
///
/// Single-subshot families re-project every observation through the
/// distorted camera's bearing into the undistorted camera. Panorama
/// observations are assigned to exactly one tile each (the one facing them
/// most directly), so the fan-out neither drops nor duplicates edges.
///
/// A shot absent from `tracks_manager` re-keys nothing.
pub fn add_subshot_tracks(
    tracks_manager: &TracksManager,
    utracks_manager: &mut TracksManager,
    reconstruction: &Reconstruction,
    undistorted: &Reconstruction,
    shot: &Shot,
    subshots: &[Shot],
) -> Result<(), UndistortError> {
    let Some(observations) = tracks_manager.shot_observations(&shot.id) else {
        return Ok(());
    };
    if subshots.is_empty() {
        return Ok(());
    }
    let camera = reconstruction
        .get_camera(&shot.camera_id)
        .ok_or_else(|| MapError::MissingCamera {
            shot_id: shot.id.clone(),
            camera_id: shot.camera_id.clone(),
        })?;

    if camera.is_spherical() {
        let mut tiles = Vec::with_capacity(subshots.len());
        let mut rotations = Vec::with_capacity(subshots.len());
        for subshot in subshots {
            let tile_camera = undistorted.get_camera(&subshot.camera_id).ok_or_else(|| {
                MapError::MissingCamera {
                    shot_id: subshot.id.clone(),
                    camera_id: subshot.camera_id.clone(),
                }
            })?;
            rotations.push(shot.pose.rotation_to(&subshot.pose));
            tiles.push((subshot, tile_camera));
        }

        for (track_id, observation) in observations {
            let bearing = camera.unproject(&observation.point)?;
            let (index, rotated) = best_tile_index(&rotations, &bearing);
            let (subshot, tile_camera) = &tiles[index];
            let pixel = tile_camera.project(&rotated)?;
            utracks_manager.add_observation(&subshot.id, track_id, observation.with_point(pixel));
        }
    } else {
        let subshot = &subshots[0];
        let ucamera = undistorted
            .get_camera(&subshot.camera_id)
            .ok_or_else(|| MapError::MissingCamera {
                shot_id: subshot.id.clone(),
                camera_id: subshot.camera_id.clone(),
            })?;

        for (track_id, observation) in observations {
            let bearing = camera.unproject(&observation.point)?;
            let pixel = ucamera.project(&bearing)?;
            utracks_manager.add_observation(&subshot.id, track_id, observation.with_point(pixel));
        }
    }
    Ok(())
}

/// Undistort one partial reconstruction.
///
/// Points and reference are copied over unchanged; every shot is dispatched
/// on its camera's projection family; re-keyed observations land in
/// `utracks_manager` and the shot fan-out in `shot_index`.
pub fn undistort_reconstruction(
    reconstruction: &Reconstruction,
    tracks_manager: Option<&TracksManager>,
    subshot_width: i32,
    utracks_manager: &mut TracksManager,
    shot_index: &mut BTreeMap<ShotId, Vec<ShotId>>,
    rig_counter: &mut RigInstanceCounter,
) -> Result<Reconstruction, UndistortError> {
    let mut undistorted = Reconstruction::new();
    undistorted.points = reconstruction.points.clone();
    undistorted.reference = reconstruction.reference.clone();
    debug!(
        "Undistorting {} shots, keeping {} points",
        reconstruction.shots.len(),
        reconstruction.points.len()
    );

    for shot in reconstruction.shots.values() {
        let camera = reconstruction
            .get_camera(&shot.camera_id)
            .ok_or_else(|| MapError::MissingCamera {
                shot_id: shot.id.clone(),
                camera_id: shot.camera_id.clone(),
            })?;

        let subshots = match &camera.projection {
            Projection::Perspective(_)
            | Projection::Brown(_)
            | Projection::Fisheye(_)
            | Projection::FisheyeOpencv(_) => {
                let ucamera = undistorted_camera(camera)?;
                undistorted.add_camera(ucamera.clone());
                vec![get_shot_with_different_camera(
                    &mut undistorted,
                    shot,
                    &ucamera,
                )?]
            }
            Projection::Spherical(_) => {
                perspective_views_of_a_panorama(shot, subshot_width, &mut undistorted, rig_counter)?
            }
        };

        if let Some(tracks) = tracks_manager {
            add_subshot_tracks(
                tracks,
                utracks_manager,
                reconstruction,
                &undistorted,
                shot,
                &subshots,
            )?;
        }
        shot_index.insert(
            shot.id.clone(),
            subshots.into_iter().map(|subshot| subshot.id).collect(),
        );
    }
    Ok(undistorted)
}

/// Undistort a sequence of partial reconstructions with one shared rig
/// counter and one shot index.
///
/// The subshot width is validated up front so a bad configuration fails
/// before any work happens. Output order matches input order, and repeated
/// calls on the same input produce identical results.
pub fn undistort_reconstruction_set(
    reconstructions: &[Reconstruction],
    tracks_manager: Option<&TracksManager>,
    subshot_width: i32,
) -> Result<UndistortedSet, UndistortError> {
    if subshot_width <= 0 {
        return Err(UndistortError::InvalidSubshotWidth(subshot_width));
    }

    let mut rig_counter = RigInstanceCounter::new();
    let mut utracks_manager = TracksManager::new();
    let mut shot_index = BTreeMap::new();
    let mut undistorted = Vec::with_capacity(reconstructions.len());

    for (index, reconstruction) in reconstructions.iter().enumerate() {
        debug!("Undistorting partial reconstruction {}", index);
        undistorted.push(undistort_reconstruction(
            reconstruction,
            tracks_manager,
            subshot_width,
            &mut utracks_manager,
            &mut shot_index,
            &mut rig_counter,
        )?);
    }

    Ok(UndistortedSet {
        reconstructions: undistorted,
        tracks_manager: tracks_manager.map(|_| utracks_manager),
        shot_index,
    })
}

/// The full undistortion pipeline: load, assemble, persist, resample.
///
/// Reconstructions and tracks come from `data`; the undistorted
/// reconstruction, tracks and shot index are saved through `udata`; imagery
/// is resampled by `kernel` on `processes` parallel workers. A dataset with
/// no reconstruction is a no-op.
pub fn run_undistort<D, U, K>(data: &D, udata: &U, kernel: &K) -> Result<(), UndistortError>
where
    D: DataSet + Sync,
    U: UndistortedDataSet + Sync,
    K: ResampleKernel,
{
    let config = data.config().clone();
    let reconstructions = data.load_reconstruction()?;
    let tracks_manager = if data.tracks_exists() {
        Some(data.load_tracks_manager()?)
    } else {
        None
    };

    if reconstructions.is_empty() {
        info!("No reconstruction to undistort");
        return Ok(());
    }

    let set = undistort_reconstruction_set(
        &reconstructions,
        tracks_manager.as_ref(),
        config.depthmap_resolution,
    )?;

    udata.save_undistorted_reconstruction(&set.reconstructions)?;
    if let Some(utracks_manager) = &set.tracks_manager {
        udata.save_undistorted_tracks_manager(utracks_manager)?;
    }
    udata.save_undistorted_shot_ids(&set.shot_index)?;

    undistort_images(
        &reconstructions,
        &set,
        data,
        udata,
        kernel,
        &config,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SphericalCamera;
    use crate::geometry::Pose;
    use crate::map::{Observation, Point, TopocentricReference};
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    fn perspective_camera(id: &str) -> Camera {
        Camera::new(
            id,
            Projection::Perspective(PerspectiveCamera {
                intrinsics: Intrinsics {
                    fx: 420.0,
                    fy: 420.0,
                    cx: 320.0,
                    cy: 240.0,
                },
                resolution: Resolution {
                    width: 640,
                    height: 480,
                },
                distortions: [-0.1, 0.01],
            }),
        )
    }

    fn spherical_camera(id: &str) -> Camera {
        Camera::new(
            id,
            Projection::Spherical(SphericalCamera {
                resolution: Resolution {
                    width: 1600,
                    height: 800,
                },
            }),
        )
    }

    fn perspective_reconstruction(shot_id: &str) -> Reconstruction {
        let mut reconstruction = Reconstruction::new();
        reconstruction.add_camera(perspective_camera("cam_p"));
        reconstruction
            .add_shot(Shot::new(shot_id, "cam_p", Pose::identity()))
            .unwrap();
        reconstruction
    }

    fn panorama_reconstruction(shot_id: &str) -> Reconstruction {
        let mut reconstruction = Reconstruction::new();
        reconstruction.add_camera(spherical_camera("cam_sphere"));
        let rotation = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.3);
        let pose = Pose::new(rotation, Vector3::new(1.0, -0.5, 2.0));
        reconstruction
            .add_shot(Shot::new(shot_id, "cam_sphere", pose))
            .unwrap();
        reconstruction
    }

    fn tracks_with_observations(shot_id: &str, pixels: &[(f64, f64)]) -> TracksManager {
        let mut tracks = TracksManager::new();
        for (index, (x, y)) in pixels.iter().enumerate() {
            tracks.add_observation(
                shot_id,
                &format!("t{}", index),
                Observation::new(
                    Vector2::new(*x, *y),
                    2.0,
                    index as u64,
                    [10.0, 20.0, 30.0],
                ),
            );
        }
        tracks
    }

    #[test]
    fn test_perspective_shot_keeps_id_and_all_edges() {
        let mut reconstruction = perspective_reconstruction("s1");
        let pixels: Vec<(f64, f64)> = (0..10)
            .map(|i| (60.0 + 50.0 * i as f64, 40.0 + 40.0 * i as f64))
            .collect();
        let tracks = tracks_with_observations("s1", &pixels);
        for index in 0..10 {
            reconstruction.add_point(Point {
                id: format!("t{}", index),
                coordinates: [index as f64, 0.0, 5.0],
                color: [128.0, 128.0, 128.0],
            });
        }

        let set =
            undistort_reconstruction_set(std::slice::from_ref(&reconstruction), Some(&tracks), 640)
                .unwrap();

        assert_eq!(set.reconstructions.len(), 1);
        let undistorted = &set.reconstructions[0];
        assert_eq!(undistorted.shots.len(), 1);
        assert_eq!(undistorted.points.len(), 10);

        let subshot = undistorted.get_shot("s1").unwrap();
        assert_eq!(subshot.camera_id, "cam_p");
        assert_eq!(subshot.rig_instance, None);

        let ucamera = undistorted.get_camera("cam_p").unwrap();
        assert_eq!(ucamera.get_distortion(), vec![0.0, 0.0]);

        let utracks = set.tracks_manager.as_ref().unwrap();
        assert_eq!(utracks.num_shot_observations("s1"), 10);
        assert_eq!(utracks.num_observations(), 10);

        assert_eq!(set.shot_index.get("s1").unwrap(), &vec!["s1".to_string()]);
    }

    #[test]
    fn test_rekey_reprojects_observations() {
        let reconstruction = perspective_reconstruction("s1");
        let tracks = tracks_with_observations("s1", &[(500.0, 100.0)]);

        let set =
            undistort_reconstruction_set(std::slice::from_ref(&reconstruction), Some(&tracks), 640)
                .unwrap();

        let camera = reconstruction.get_camera("cam_p").unwrap();
        let ucamera = set.reconstructions[0].get_camera("cam_p").unwrap();
        let bearing = camera.unproject(&Vector2::new(500.0, 100.0)).unwrap();
        let expected = ucamera.project(&bearing).unwrap();

        let utracks = set.tracks_manager.as_ref().unwrap();
        let observation = utracks
            .shot_observations("s1")
            .unwrap()
            .get("t0")
            .unwrap();
        assert_relative_eq!(observation.point.x, expected.x, epsilon = 1e-12);
        assert_relative_eq!(observation.point.y, expected.y, epsilon = 1e-12);
        // Distortion was non-zero, so the position must actually move.
        assert!((observation.point.x - 500.0).abs() > 0.5);
        // The payload travels unchanged.
        assert_eq!(observation.id, 0);
        assert_eq!(observation.scale, 2.0);
        assert_eq!(observation.color, [10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_panorama_fan_out() {
        let reconstruction = panorama_reconstruction("p1");
        let set = undistort_reconstruction_set(std::slice::from_ref(&reconstruction), None, 640)
            .unwrap();

        let undistorted = &set.reconstructions[0];
        assert_eq!(undistorted.shots.len(), 6);

        let expected_ids: Vec<String> = PANORAMA_TILES
            .iter()
            .map(|tile| format!("p1_{}", tile))
            .collect();
        assert_eq!(set.shot_index.get("p1").unwrap(), &expected_ids);

        let tile_camera = undistorted.get_camera(PANORAMA_CAMERA_ID).unwrap();
        assert_eq!(tile_camera.get_resolution().width, 640);
        assert_eq!(tile_camera.get_resolution().height, 640);
        assert_eq!(tile_camera.get_distortion(), vec![0.0, 0.0]);
        match &tile_camera.projection {
            Projection::Perspective(m) => {
                assert_relative_eq!(m.intrinsics.fx, 320.0, epsilon = 1e-12);
                assert_relative_eq!(m.intrinsics.fy, 320.0, epsilon = 1e-12);
                assert_relative_eq!(m.intrinsics.cx, 320.0, epsilon = 1e-12);
                assert_relative_eq!(m.intrinsics.cy, 320.0, epsilon = 1e-12);
            }
            other => panic!("tile camera must be perspective, got {:?}", other),
        }

        let source_origin = reconstruction.get_shot("p1").unwrap().pose.origin();
        for id in &expected_ids {
            let subshot = undistorted.get_shot(id).unwrap();
            assert_eq!(subshot.camera_id, PANORAMA_CAMERA_ID);
            assert_eq!(subshot.rig_instance, Some(0));

            let origin = subshot.pose.origin();
            assert_relative_eq!(origin.x, source_origin.x, epsilon = 1e-9);
            assert_relative_eq!(origin.y, source_origin.y, epsilon = 1e-9);
            assert_relative_eq!(origin.z, source_origin.z, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rig_instances_increase_across_partial_reconstructions() {
        let first = panorama_reconstruction("p1");
        let mut second = panorama_reconstruction("p2");
        second.add_camera(perspective_camera("cam_p"));
        second
            .add_shot(Shot::new("a_regular", "cam_p", Pose::identity()))
            .unwrap();

        let set = undistort_reconstruction_set(&[first, second], None, 320).unwrap();

        let rig_of = |rec: &Reconstruction, id: &str| rec.get_shot(id).unwrap().rig_instance;
        assert_eq!(rig_of(&set.reconstructions[0], "p1_front"), Some(0));
        assert_eq!(rig_of(&set.reconstructions[1], "p2_front"), Some(1));
        assert_eq!(rig_of(&set.reconstructions[1], "p2_bottom"), Some(1));
        assert_eq!(rig_of(&set.reconstructions[1], "a_regular"), None);

        // The index covers every original shot across both reconstructions.
        let keys: Vec<&str> = set.shot_index.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a_regular", "p1", "p2"]);
    }

    #[test]
    fn test_panorama_rekey_is_lossless() {
        let reconstruction = panorama_reconstruction("p1");
        // A grid across the whole panorama, poles and seam regions included.
        let mut pixels = Vec::new();
        for ix in 0..16 {
            for iy in 1..8 {
                pixels.push((ix as f64 * 100.0 + 50.0, iy as f64 * 100.0));
            }
        }
        let tracks = tracks_with_observations("p1", &pixels);

        let set =
            undistort_reconstruction_set(std::slice::from_ref(&reconstruction), Some(&tracks), 640)
                .unwrap();

        let utracks = set.tracks_manager.as_ref().unwrap();
        assert_eq!(utracks.num_observations(), pixels.len());

        // Each observation appears in exactly one tile and lands inside the
        // tile image (closed bounds).
        let mut seen = std::collections::BTreeSet::new();
        for subshot_id in set.shot_index.get("p1").unwrap() {
            if let Some(observations) = utracks.shot_observations(subshot_id) {
                for (track_id, observation) in observations {
                    assert!(seen.insert(track_id.clone()), "duplicate edge {}", track_id);
                    assert!(observation.point.x >= 0.0 && observation.point.x <= 640.0);
                    assert!(observation.point.y >= 0.0 && observation.point.y <= 640.0);
                }
            }
        }
        assert_eq!(seen.len(), pixels.len());
    }

    #[test]
    fn test_panorama_seam_and_pole_pixels_stay_in_bounds() {
        let reconstruction = panorama_reconstruction("p1");
        // x = 1000 sits exactly on the front/left boundary of the 1600-wide
        // panorama; y = 0 and y = 800 are the poles.
        let pixels = [(1000.0, 400.0), (123.0, 0.0), (1234.0, 800.0)];
        let tracks = tracks_with_observations("p1", &pixels);

        let set =
            undistort_reconstruction_set(std::slice::from_ref(&reconstruction), Some(&tracks), 640)
                .unwrap();

        let utracks = set.tracks_manager.as_ref().unwrap();
        assert_eq!(utracks.num_observations(), pixels.len());

        let mut tile_of = std::collections::BTreeMap::new();
        for subshot_id in set.shot_index.get("p1").unwrap() {
            if let Some(observations) = utracks.shot_observations(subshot_id) {
                for (track_id, observation) in observations {
                    let previous = tile_of.insert(track_id.clone(), subshot_id.clone());
                    assert_eq!(previous, None, "edge {} assigned twice", track_id);
                    assert!(observation.point.x >= 0.0 && observation.point.x <= 640.0);
                    assert!(observation.point.y >= 0.0 && observation.point.y <= 640.0);
                }
            }
        }

        // The boundary pixel belongs to one of the two tiles it touches; the
        // poles face the top and bottom tiles head on.
        let seam_tile = tile_of.get("t0").unwrap().as_str();
        assert!(seam_tile == "p1_front" || seam_tile == "p1_left");
        assert_eq!(tile_of.get("t1").unwrap(), "p1_top");
        assert_eq!(tile_of.get("t2").unwrap(), "p1_bottom");
    }

    #[test]
    fn test_panorama_center_pixel_lands_on_front_tile() {
        let mut reconstruction = Reconstruction::new();
        reconstruction.add_camera(spherical_camera("cam_sphere"));
        reconstruction
            .add_shot(Shot::new("p1", "cam_sphere", Pose::identity()))
            .unwrap();
        // The panorama center looks straight ahead.
        let tracks = tracks_with_observations("p1", &[(800.0, 400.0)]);

        let set =
            undistort_reconstruction_set(std::slice::from_ref(&reconstruction), Some(&tracks), 640)
                .unwrap();

        let utracks = set.tracks_manager.as_ref().unwrap();
        assert_eq!(utracks.num_shot_observations("p1_front"), 1);
        let observation = utracks
            .shot_observations("p1_front")
            .unwrap()
            .get("t0")
            .unwrap();
        assert_relative_eq!(observation.point.x, 320.0, epsilon = 1e-9);
        assert_relative_eq!(observation.point.y, 320.0, epsilon = 1e-9);
    }

    #[test]
    fn test_exact_tie_picks_earliest_tile() {
        // Two tiles facing the same way: the first one must win.
        let rotations = vec![
            UnitQuaternion::identity(),
            UnitQuaternion::identity(),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), PI),
        ];
        let (index, rotated) = best_tile_index(&rotations, &Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(index, 0);
        assert_relative_eq!(rotated.z, 1.0, epsilon = 1e-15);
    }

    #[test]
    fn test_tile_selection_covers_cardinal_directions() {
        let rotations: Vec<UnitQuaternion<f64>> =
            panorama_tiles().iter().map(|(_, r)| *r).collect();

        let cases = [
            (Vector3::new(0.0, 0.0, 1.0), 0usize),  // front
            (Vector3::new(1.0, 0.0, 0.0), 1),       // left
            (Vector3::new(0.0, 0.0, -1.0), 2),      // back
            (Vector3::new(-1.0, 0.0, 0.0), 3),      // right
            (Vector3::new(0.0, -1.0, 0.0), 4),      // top (up)
            (Vector3::new(0.0, 1.0, 0.0), 5),       // bottom (down)
        ];
        for (bearing, expected) in cases {
            let (index, rotated) = best_tile_index(&rotations, &bearing);
            assert_eq!(index, expected, "bearing {:?}", bearing);
            assert_relative_eq!(rotated.z, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_invalid_subshot_width_fails_up_front() {
        let reconstruction = perspective_reconstruction("s1");
        for width in [0, -640] {
            let result =
                undistort_reconstruction_set(std::slice::from_ref(&reconstruction), None, width);
            assert!(matches!(
                result,
                Err(UndistortError::InvalidSubshotWidth(w)) if w == width
            ));
        }
    }

    #[test]
    fn test_normalize_perspective_keeps_intrinsics() {
        let camera = perspective_camera("cam_p");
        let ucamera = undistorted_camera(&camera).unwrap();
        assert_eq!(ucamera.id, "cam_p");
        match &ucamera.projection {
            Projection::Perspective(m) => {
                assert_relative_eq!(m.intrinsics.fx, 420.0, epsilon = 1e-12);
                assert_relative_eq!(m.intrinsics.cx, 320.0, epsilon = 1e-12);
                assert_eq!(m.distortions, [0.0, 0.0]);
                assert_eq!(m.resolution.width, 640);
            }
            other => panic!("expected perspective, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_brown_uses_effective_focal() {
        let brown = crate::camera::BrownCamera {
            intrinsics: Intrinsics {
                fx: 461.629,
                fy: 460.152,
                cx: 362.680,
                cy: 246.049,
            },
            resolution: Resolution {
                width: 752,
                height: 480,
            },
            distortions: [-0.28, 0.07, 0.0002, 0.00002, 0.0],
        };
        let focal = brown.effective_focal();

        let normalized = perspective_camera_from_brown(&brown);
        assert_relative_eq!(normalized.intrinsics.fx, focal, epsilon = 1e-12);
        assert_relative_eq!(normalized.intrinsics.fy, focal, epsilon = 1e-12);
        assert_relative_eq!(normalized.intrinsics.cx, 362.680, epsilon = 1e-12);
        assert_relative_eq!(normalized.intrinsics.cy, 246.049, epsilon = 1e-12);
        assert_eq!(normalized.distortions, [0.0, 0.0]);
        assert_eq!(normalized.resolution.width, 752);
    }

    #[test]
    fn test_normalize_fisheye_preserves_field_of_view() {
        let fisheye = crate::camera::FisheyeCamera {
            intrinsics: Intrinsics {
                fx: 600.0,
                fy: 600.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution: Resolution {
                width: 640,
                height: 480,
            },
            distortions: [-0.02, 0.003],
        };

        let normalized = perspective_camera_from_fisheye(&fisheye);
        // Half the image width sits at angle half_width / fx off-axis; the
        // pinhole puts the same angle at the image border.
        let half_fov: f64 = 320.0 / 600.0;
        assert_relative_eq!(
            normalized.intrinsics.fx,
            320.0 / half_fov.tan(),
            epsilon = 1e-9
        );
        assert_relative_eq!(normalized.intrinsics.cx, 320.0, epsilon = 1e-12);
        assert_eq!(normalized.distortions, [0.0, 0.0]);
    }

    #[test]
    fn test_normalize_ultra_wide_fisheye_clamps_fov() {
        let fisheye = crate::camera::FisheyeCamera {
            intrinsics: Intrinsics {
                fx: 350.0,
                fy: 350.0,
                cx: 640.0,
                cy: 480.0,
            },
            resolution: Resolution {
                width: 1280,
                height: 960,
            },
            distortions: [0.0, 0.0],
        };
        // 640 / 350 rad would be beyond 90 degrees; the cap keeps the
        // equivalent focal positive and finite.
        let normalized = perspective_camera_from_fisheye(&fisheye);
        assert_relative_eq!(
            normalized.intrinsics.fx,
            640.0 / MAX_HALF_FOV.tan(),
            epsilon = 1e-9
        );
        assert!(normalized.intrinsics.fx > 0.0);
    }

    #[test]
    fn test_normalize_rejects_spherical() {
        let camera = spherical_camera("cam_sphere");
        let result = undistorted_camera(&camera);
        assert!(matches!(
            result,
            Err(UndistortError::UnsupportedProjection(ref tag)) if tag == "spherical"
        ));
    }

    #[test]
    fn test_points_and_reference_are_kept() {
        let mut reconstruction = panorama_reconstruction("p1");
        reconstruction.add_point(Point {
            id: "t0".to_string(),
            coordinates: [1.0, 2.0, 3.0],
            color: [255.0, 0.0, 0.0],
        });
        reconstruction.reference = TopocentricReference {
            latitude: 52.52,
            longitude: 13.405,
            altitude: 34.0,
        };

        let set = undistort_reconstruction_set(std::slice::from_ref(&reconstruction), None, 640)
            .unwrap();

        let undistorted = &set.reconstructions[0];
        assert_eq!(undistorted.points.len(), 1);
        assert_eq!(undistorted.points.get("t0").unwrap().coordinates, [1.0, 2.0, 3.0]);
        assert_relative_eq!(undistorted.reference.latitude, 52.52, epsilon = 1e-12);
        assert_relative_eq!(undistorted.reference.longitude, 13.405, epsilon = 1e-12);
    }

    #[test]
    fn test_undistortion_is_deterministic() {
        let reconstructions = vec![
            panorama_reconstruction("p1"),
            perspective_reconstruction("s1"),
        ];
        let mut tracks = tracks_with_observations("p1", &[(100.0, 200.0), (1200.0, 350.0)]);
        tracks.add_observation(
            "s1",
            "t9",
            Observation::new(Vector2::new(12.0, 250.0), 1.0, 9, [1.0, 2.0, 3.0]),
        );

        let first = undistort_reconstruction_set(&reconstructions, Some(&tracks), 640).unwrap();
        let second = undistort_reconstruction_set(&reconstructions, Some(&tracks), 640).unwrap();

        assert_eq!(
            serde_json::to_string(&first.reconstructions).unwrap(),
            serde_json::to_string(&second.reconstructions).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&first.tracks_manager).unwrap(),
            serde_json::to_string(&second.tracks_manager).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&first.shot_index).unwrap(),
            serde_json::to_string(&second.shot_index).unwrap()
        );
    }

    #[test]
    fn test_subshots_inherit_metadata() {
        let mut reconstruction = Reconstruction::new();
        reconstruction.add_camera(spherical_camera("cam_sphere"));
        let mut shot = Shot::new("p1", "cam_sphere", Pose::identity());
        shot.metadata.capture_time = Some(1_700_000_000.0);
        shot.metadata.orientation = Some(1);
        reconstruction.add_shot(shot).unwrap();

        let set = undistort_reconstruction_set(std::slice::from_ref(&reconstruction), None, 640)
            .unwrap();

        let subshot = set.reconstructions[0].get_shot("p1_left").unwrap();
        assert_eq!(subshot.metadata.capture_time, Some(1_700_000_000.0));
        assert_eq!(subshot.metadata.orientation, Some(1));
    }
}

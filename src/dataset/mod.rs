//! Configuration and the interfaces this crate expects its surroundings to
//! provide: dataset access, undistorted output storage and submodel
//! enumeration. The on-disk layout behind these traits is owned by the
//! caller; tests use in-memory implementations.

use crate::map::{Reconstruction, ShotId, TracksManager};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum DataSetError {
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("Failed to parse resource: {0}")]
    ParseError(String),
    #[error("Missing resource: {0}")]
    MissingResource(String),
}

impl From<std::io::Error> for DataSetError {
    fn from(err: std::io::Error) -> Self {
        DataSetError::IOError(err.to_string())
    }
}

/// File format for undistorted output imagery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpg,
    Png,
    Tif,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Tif => "tif",
        }
    }
}

/// The configuration keys the undistortion and alignment pipelines read.
///
/// `depthmap_resolution` is the target pixel width of undistorted views (and
/// the width of each panorama tile); `processes` is the resampling worker
/// count. Unset keys take the defaults, so a partial document deserializes
/// into a complete config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub undistorted_image_format: ImageFormat,
    pub depthmap_resolution: i32,
    pub processes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            undistorted_image_format: ImageFormat::Jpg,
            depthmap_resolution: 640,
            processes: 1,
        }
    }
}

/// Read access to one reconstruction dataset plus persistence for derived
/// reconstructions. Implementations decide where reconstructions, tracks and
/// imagery actually live.
pub trait DataSet {
    fn config(&self) -> &Config;

    fn reconstruction_exists(&self) -> bool;

    /// All partial reconstructions of this dataset, in stored order.
    fn load_reconstruction(&self) -> Result<Vec<Reconstruction>, DataSetError>;

    fn tracks_exists(&self) -> bool;

    fn load_tracks_manager(&self) -> Result<TracksManager, DataSetError>;

    fn image_exists(&self, shot_id: &str) -> bool;

    fn load_image(&self, shot_id: &str) -> Result<RgbImage, DataSetError>;

    fn mask_exists(&self, shot_id: &str) -> bool;

    fn load_mask(&self, shot_id: &str) -> Result<GrayImage, DataSetError>;

    /// Persist a reconstruction sequence under the given output name.
    fn save_reconstruction(
        &self,
        reconstructions: &[Reconstruction],
        output_name: &str,
    ) -> Result<(), DataSetError>;
}

/// Write access for everything the undistortion pipeline produces.
pub trait UndistortedDataSet {
    fn save_undistorted_reconstruction(
        &self,
        reconstructions: &[Reconstruction],
    ) -> Result<(), DataSetError>;

    fn save_undistorted_tracks_manager(&self, tracks: &TracksManager) -> Result<(), DataSetError>;

    /// Persist the original-shot to subshot-ids index.
    fn save_undistorted_shot_ids(
        &self,
        index: &BTreeMap<ShotId, Vec<ShotId>>,
    ) -> Result<(), DataSetError>;

    /// `image_name` carries the output extension, e.g. `im1_front.jpg`.
    fn save_undistorted_image(&self, image_name: &str, image: &RgbImage)
        -> Result<(), DataSetError>;

    fn save_undistorted_mask(&self, image_name: &str, mask: &GrayImage)
        -> Result<(), DataSetError>;
}

/// A dataset that has been split into submodels, each a dataset of its own.
pub trait MetaDataSet {
    type Submodel: DataSet;

    /// Submodel locations in processing order.
    fn submodel_paths(&self) -> Vec<PathBuf>;

    fn open_submodel(&self, path: &Path) -> Result<Self::Submodel, DataSetError>;
}

/// Stable lookup key for one partial reconstruction inside a submodel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartialReconstructionKey {
    pub submodel_path: PathBuf,
    pub index: usize,
}

//! Parallel resampling of source imagery into undistorted views.
//!
//! The geometric work per output pixel is always the same: unproject from
//! the destination camera, rotate the bearing back into the source frame,
//! project through the source camera and sample. [`BearingResampler`] does
//! exactly that; alternative kernels plug in through [`ResampleKernel`].

use crate::camera::{Camera, CameraModel, CameraModelError};
use crate::dataset::{Config, DataSet, ImageFormat, UndistortedDataSet};
use crate::map::{MapError, Reconstruction, Shot};
use crate::undistort::{UndistortError, UndistortedSet};
use image::{GrayImage, Luma, Rgb, RgbImage};
use log::{debug, info, warn};
use nalgebra::{UnitQuaternion, Vector2};
use rayon::prelude::*;

/// Pixel-level resampling strategy.
///
/// `rotation` maps source-frame bearings into the destination frame, the
/// same direction as [`crate::geometry::Pose::rotation_to`].
pub trait ResampleKernel: Sync {
    fn resample_image(
        &self,
        source: &RgbImage,
        source_camera: &Camera,
        dest_camera: &Camera,
        rotation: &UnitQuaternion<f64>,
    ) -> Result<RgbImage, CameraModelError>;

    fn resample_mask(
        &self,
        source: &GrayImage,
        source_camera: &Camera,
        dest_camera: &Camera,
        rotation: &UnitQuaternion<f64>,
    ) -> Result<GrayImage, CameraModelError>;
}

/// Default kernel: bilinear interpolation for imagery, nearest neighbour for
/// masks so they stay binary. Destination pixels looking away from the
/// source camera or outside its image stay black.
#[derive(Debug, Default, Clone, Copy)]
pub struct BearingResampler;

fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> Option<Rgb<u8>> {
    let (width, height) = image.dimensions();
    if x < 0.0 || y < 0.0 || x > (width - 1) as f64 || y > (height - 1) as f64 {
        return None;
    }
    let fx = x - x.floor();
    let fy = y - y.floor();
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut blended = [0u8; 3];
    for channel in 0..3 {
        let top = f64::from(p00[channel]) * (1.0 - fx) + f64::from(p10[channel]) * fx;
        let bottom = f64::from(p01[channel]) * (1.0 - fx) + f64::from(p11[channel]) * fx;
        blended[channel] = (top * (1.0 - fy) + bottom * fy).round() as u8;
    }
    Some(Rgb(blended))
}

fn sample_nearest(mask: &GrayImage, x: f64, y: f64) -> Option<Luma<u8>> {
    let (width, height) = mask.dimensions();
    let xi = x.round();
    let yi = y.round();
    if xi < 0.0 || yi < 0.0 || xi >= f64::from(width) || yi >= f64::from(height) {
        return None;
    }
    Some(*mask.get_pixel(xi as u32, yi as u32))
}

impl ResampleKernel for BearingResampler {
    fn resample_image(
        &self,
        source: &RgbImage,
        source_camera: &Camera,
        dest_camera: &Camera,
        rotation: &UnitQuaternion<f64>,
    ) -> Result<RgbImage, CameraModelError> {
        let resolution = dest_camera.get_resolution();
        let mut output = RgbImage::new(resolution.width, resolution.height);
        let dest_to_source = rotation.inverse();

        for (u, v, pixel) in output.enumerate_pixels_mut() {
            let bearing = dest_camera.unproject(&Vector2::new(f64::from(u), f64::from(v)))?;
            let Ok(source_pixel) = source_camera.project(&(dest_to_source * bearing)) else {
                continue;
            };
            if let Some(sample) = sample_bilinear(source, source_pixel.x, source_pixel.y) {
                *pixel = sample;
            }
        }
        Ok(output)
    }

    fn resample_mask(
        &self,
        source: &GrayImage,
        source_camera: &Camera,
        dest_camera: &Camera,
        rotation: &UnitQuaternion<f64>,
    ) -> Result<GrayImage, CameraModelError> {
        let resolution = dest_camera.get_resolution();
        let mut output = GrayImage::new(resolution.width, resolution.height);
        let dest_to_source = rotation.inverse();

        for (u, v, pixel) in output.enumerate_pixels_mut() {
            let bearing = dest_camera.unproject(&Vector2::new(f64::from(u), f64::from(v)))?;
            let Ok(source_pixel) = source_camera.project(&(dest_to_source * bearing)) else {
                continue;
            };
            if let Some(sample) = sample_nearest(source, source_pixel.x, source_pixel.y) {
                *pixel = sample;
            }
        }
        Ok(output)
    }
}

/// One unit of resampling work: a source shot and the subshots derived from
/// it, with their cameras resolved.
#[derive(Debug)]
pub struct ResampleItem<'a> {
    pub shot: &'a Shot,
    pub camera: &'a Camera,
    pub subshots: Vec<(&'a Shot, &'a Camera)>,
}

fn resample_items<'a>(
    reconstructions: &'a [Reconstruction],
    set: &'a UndistortedSet,
) -> Result<Vec<ResampleItem<'a>>, UndistortError> {
    let mut items = Vec::new();
    for (reconstruction, undistorted) in reconstructions.iter().zip(&set.reconstructions) {
        for shot in reconstruction.shots.values() {
            let camera = reconstruction
                .get_camera(&shot.camera_id)
                .ok_or_else(|| MapError::MissingCamera {
                    shot_id: shot.id.clone(),
                    camera_id: shot.camera_id.clone(),
                })?;
            let Some(subshot_ids) = set.shot_index.get(&shot.id) else {
                continue;
            };
            let mut subshots = Vec::with_capacity(subshot_ids.len());
            for subshot_id in subshot_ids {
                let Some(subshot) = undistorted.get_shot(subshot_id) else {
                    continue;
                };
                let Some(subshot_camera) = undistorted.get_camera(&subshot.camera_id) else {
                    continue;
                };
                subshots.push((subshot, subshot_camera));
            }
            items.push(ResampleItem {
                shot,
                camera,
                subshots,
            });
        }
    }
    Ok(items)
}

/// Resample one shot's image (and mask, when present) into all of its
/// subshot views.
///
/// Images are written as `{subshot_id}.{format extension}`; masks always go
/// out as png to stay lossless. A shot whose source image is missing is
/// skipped with a warning so one lost file does not kill the run.
pub fn undistort_image_and_masks<D, U, K>(
    data: &D,
    udata: &U,
    item: &ResampleItem<'_>,
    kernel: &K,
    format: ImageFormat,
) -> Result<(), UndistortError>
where
    D: DataSet,
    U: UndistortedDataSet,
    K: ResampleKernel,
{
    if !data.image_exists(&item.shot.id) {
        warn!("No image found for shot '{}', skipping", item.shot.id);
        return Ok(());
    }
    debug!("Undistorting image of shot '{}'", item.shot.id);

    let image = data.load_image(&item.shot.id)?;
    let mask = if data.mask_exists(&item.shot.id) {
        Some(data.load_mask(&item.shot.id)?)
    } else {
        None
    };

    for (subshot, subshot_camera) in &item.subshots {
        let rotation = item.shot.pose.rotation_to(&subshot.pose);

        let undistorted = kernel
            .resample_image(&image, item.camera, subshot_camera, &rotation)
            .map_err(|err| UndistortError::ResampleFailed {
                shot_id: subshot.id.clone(),
                message: err.to_string(),
            })?;
        udata.save_undistorted_image(
            &format!("{}.{}", subshot.id, format.extension()),
            &undistorted,
        )?;

        if let Some(mask) = &mask {
            let undistorted_mask = kernel
                .resample_mask(mask, item.camera, subshot_camera, &rotation)
                .map_err(|err| UndistortError::ResampleFailed {
                    shot_id: subshot.id.clone(),
                    message: err.to_string(),
                })?;
            udata.save_undistorted_mask(&format!("{}.png", subshot.id), &undistorted_mask)?;
        }
    }
    Ok(())
}

/// Resample every shot of every reconstruction on a fixed-size worker pool.
///
/// The worker count comes from `config.processes` and must be positive. The
/// first failing shot aborts the run.
pub fn undistort_images<D, U, K>(
    reconstructions: &[Reconstruction],
    set: &UndistortedSet,
    data: &D,
    udata: &U,
    kernel: &K,
    config: &Config,
) -> Result<(), UndistortError>
where
    D: DataSet + Sync,
    U: UndistortedDataSet + Sync,
    K: ResampleKernel,
{
    if config.processes == 0 {
        return Err(UndistortError::InvalidProcessCount);
    }
    let items = resample_items(reconstructions, set)?;
    info!(
        "Undistorting {} images with {} processes",
        items.len(),
        config.processes
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.processes)
        .build()?;
    let format = config.undistorted_image_format;
    pool.install(|| {
        items
            .par_iter()
            .try_for_each(|item| undistort_image_and_masks(data, udata, item, kernel, format))
    })
}

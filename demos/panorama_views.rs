//! Panorama View Synthesis Example
//!
//! Builds a small synthetic reconstruction around one spherical panorama,
//! undistorts it into six cube-face views and reports the fan-out: subshot
//! ids, their shared rig instance and how many track observations each view
//! received. With an output directory the resampled tiles are also written
//! out as PNG files.
//!
//! Usage:
//! ```bash
//! cargo run --example panorama_views -- --width 320 --output /tmp/tiles
//! ```

use clap::Parser;
use image::{Rgb, RgbImage};
use log::info;
use nalgebra::Vector2;
use std::path::PathBuf;
use undistort_tools::camera::{Camera, Projection, Resolution, SphericalCamera};
use undistort_tools::geometry::Pose;
use undistort_tools::map::{Observation, Reconstruction, Shot, TracksManager};
use undistort_tools::undistort::{undistort_reconstruction_set, BearingResampler, ResampleKernel};

/// Panorama undistortion demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Pixel width of each synthesized cube-face view
    #[arg(short, long, default_value_t = 320)]
    width: i32,

    /// Directory to write the resampled tiles into
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// A gradient panorama so every tile picks up distinguishable content.
fn synthetic_panorama(width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::new(width, height);
    for (u, v, pixel) in image.enumerate_pixels_mut() {
        let horizontal = (f64::from(u) / f64::from(width) * 255.0) as u8;
        let vertical = (f64::from(v) / f64::from(height) * 255.0) as u8;
        *pixel = Rgb([horizontal, vertical, 128]);
    }
    image
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let camera = Camera::new(
        "pano_cam",
        Projection::Spherical(SphericalCamera {
            resolution: Resolution {
                width: 1024,
                height: 512,
            },
        }),
    );
    let mut reconstruction = Reconstruction::new();
    reconstruction.add_camera(camera.clone());
    reconstruction.add_shot(Shot::new("pano_0001", "pano_cam", Pose::identity()))?;

    let mut tracks = TracksManager::new();
    let pixels = [(512.0, 256.0), (150.0, 200.0), (900.0, 300.0), (512.0, 60.0)];
    for (index, (u, v)) in pixels.iter().enumerate() {
        tracks.add_observation(
            "pano_0001",
            &format!("t{index}"),
            Observation::new(Vector2::new(*u, *v), 1.0, index as u64, [255.0, 255.0, 255.0]),
        );
    }

    let set = undistort_reconstruction_set(
        std::slice::from_ref(&reconstruction),
        Some(&tracks),
        args.width,
    )?;

    let undistorted = &set.reconstructions[0];
    let utracks = set.tracks_manager.as_ref().expect("tracks were provided");
    info!(
        "Synthesized {} views from one panorama",
        undistorted.shots.len()
    );

    println!("subshot            rig  observations");
    for subshot_id in &set.shot_index["pano_0001"] {
        let subshot = undistorted.get_shot(subshot_id).expect("indexed subshot");
        println!(
            "{:<18} {:>3}  {:>12}",
            subshot.id,
            subshot
                .rig_instance
                .map_or_else(|| "-".to_string(), |rig| rig.to_string()),
            utracks.num_shot_observations(subshot_id),
        );
    }

    if let Some(output) = &args.output {
        std::fs::create_dir_all(output)?;
        let source = synthetic_panorama(1024, 512);
        let kernel = BearingResampler;
        let shot = reconstruction.get_shot("pano_0001").expect("shot exists");
        for subshot_id in &set.shot_index["pano_0001"] {
            let subshot = undistorted.get_shot(subshot_id).expect("indexed subshot");
            let tile_camera = undistorted
                .get_camera(&subshot.camera_id)
                .expect("tile camera exists");
            let rotation = shot.pose.rotation_to(&subshot.pose);
            let tile = kernel.resample_image(&source, &camera, tile_camera, &rotation)?;
            let path = output.join(format!("{subshot_id}.png"));
            tile.save(&path)?;
            info!("Wrote {}", path.display());
        }
    }
    Ok(())
}

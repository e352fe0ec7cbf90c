//! Offline capture replay.
//!
//! Reads a JSON manifest describing captured frames (image paths plus
//! device extrinsics), drives them through the recorder pipeline and
//! writes both stereo outputs below the output directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use pano_core::{Frame, FrameSource, Mat3, Mat4, RecorderConfig, Real};
use pano_recorder::{DirectorySink, Recorder};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "Replay a capture manifest through the recorder")]
struct Args {
    /// Path to the JSON capture manifest.
    #[arg(long)]
    manifest: String,

    /// Output directory; left/ and right/ are created below it.
    #[arg(long)]
    out: String,

    /// Optional JSON RecorderConfig. Defaults are used if omitted.
    #[arg(long)]
    config: Option<String>,
}

/// One captured frame of the manifest.
#[derive(Debug, Deserialize)]
struct ManifestFrame {
    id: u64,
    /// Image file, relative to the manifest location.
    path: String,
    /// Row-major 4×4 device extrinsics.
    extrinsics: [Real; 16],
}

#[derive(Debug, Deserialize)]
struct Manifest {
    /// `[fx, fy, cx, cy]` of the capture camera.
    intrinsics: [Real; 4],
    /// Row-major 4×4 base matrix; identity if omitted.
    base: Option<[Real; 16]>,
    /// Row-major 4×4 zero pose; identity if omitted.
    zero: Option<[Real; 16]>,
    frames: Vec<ManifestFrame>,
}

fn mat4_from_rows(rows: &[Real; 16]) -> Mat4 {
    Mat4::from_row_slice(rows)
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn replay(manifest_path: &Path, out: &Path, config: RecorderConfig) -> Result<(u32, u32)> {
    let manifest: Manifest = load_json_file(manifest_path)?;
    let manifest_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let [fx, fy, cx, cy] = manifest.intrinsics;
    let intrinsics: Mat3 = pano_core::intrinsics(fx, fy, cx, cy);
    let base = manifest
        .base
        .as_ref()
        .map(mat4_from_rows)
        .unwrap_or_else(Mat4::identity);
    let zero = manifest
        .zero
        .as_ref()
        .map(mat4_from_rows)
        .unwrap_or_else(Mat4::identity);

    let left = DirectorySink::new(out.join("left"))?;
    let right = DirectorySink::new(out.join("right"))?;
    let mut recorder = Recorder::new(base, zero, intrinsics, left, right, config)?;

    info!(
        frames = manifest.frames.len(),
        targets = recorder.images_to_record(),
        "replaying capture"
    );
    for entry in &manifest.frames {
        let frame = Frame::new(
            entry.id,
            intrinsics,
            mat4_from_rows(&entry.extrinsics),
            FrameSource::Path(manifest_dir.join(&entry.path)),
        );
        recorder.push(frame);
    }
    recorder.finish()?;

    Ok((recorder.recorded_images(), recorder.images_to_record()))
}

fn try_main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_json_file(Path::new(path))?,
        None => RecorderConfig::default(),
    };
    let (recorded, total) = replay(
        Path::new(&args.manifest),
        &PathBuf::from(&args.out),
        config,
    )?;
    println!("recorded {recorded}/{total} targets");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    if let Err(err) = try_main() {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pano_core::synthetic;

    /// Render a sweep to disk, replay it and check both outputs.
    #[test]
    fn replays_a_synthetic_sweep_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let k = pano_core::intrinsics(400.0, 400.0, 320.0, 320.0);

        let mut frames = Vec::new();
        for (i, pose) in synthetic::sweep_poses(30, 0.0).iter().enumerate() {
            let pixels = synthetic::render_view(&k, pose, 96, 96);
            let name = format!("frame_{i:03}.png");
            image::RgbImage::from_raw(pixels.width(), pixels.height(), pixels.as_bytes().to_vec())
                .unwrap()
                .save(dir.path().join(&name))
                .unwrap();

            let device = pose.try_inverse().unwrap();
            let mut extrinsics = [0.0; 16];
            for r in 0..4 {
                for c in 0..4 {
                    extrinsics[r * 4 + c] = device[(r, c)];
                }
            }
            frames.push(serde_json::json!({
                "id": i,
                "path": name,
                "extrinsics": extrinsics,
            }));
        }

        let manifest = serde_json::json!({
            "intrinsics": [400.0, 400.0, 320.0, 320.0],
            "frames": frames,
        });
        let manifest_path = dir.path().join("capture.json");
        std::fs::write(&manifest_path, manifest.to_string()).unwrap();

        let out = dir.path().join("out");
        let config = RecorderConfig {
            tolerance: 3.0,
            ..RecorderConfig::default()
        };
        let (recorded, total) = replay(&manifest_path, &out, config).unwrap();
        assert_eq!(total, 16);
        assert_eq!(recorded, 16);
        assert!(out.join("left").join("input_summary.bin").exists());
        assert!(out.join("right").join("target_00000.png").exists());
    }
}

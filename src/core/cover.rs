//! Cover image normalization.
//!
//! The sink platform requires exactly 16:10 covers. Two fit modes: `crop`
//! center-crops the excess dimension, `pad` letterboxes onto black bars.
//! The operation is idempotent; an already conforming image is re-encoded
//! unchanged in geometry.

use crate::{Result, error::RetubeError};
use image::{GenericImageView, Rgba, RgbaImage, imageops};
use log::debug;
use std::path::Path;

/// Target aspect ratio numerator/denominator.
const ASPECT_W: u32 = 16;
const ASPECT_H: u32 = 10;

/// Cover fit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverMode {
    /// Center-crop the excess dimension.
    Crop,
    /// Add black bars to reach the aspect.
    Pad,
}

impl CoverMode {
    /// Parse the config value, defaulting to crop.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pad" => Self::Pad,
            _ => Self::Crop,
        }
    }
}

/// Force the image at `input` to a 16:10 aspect and write it to `output`.
///
/// Rounding keeps the result within one pixel of the exact ratio.
pub fn process_cover(input: &Path, output: &Path, mode: CoverMode) -> Result<()> {
    let img = image::open(input)
        .map_err(|e| RetubeError::config(format!("failed to open cover {:?}: {}", input, e)))?;
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(RetubeError::config(format!("empty cover image {:?}", input)));
    }
    debug!("Cover {:?}: {}x{}, mode {:?}", input, w, h, mode);

    let result = match mode {
        CoverMode::Crop => crop_to_aspect(&img),
        CoverMode::Pad => pad_to_aspect(&img),
    };

    // The JPEG encoder only takes RGB; flatten any alpha channel when
    // the target extension demands it.
    let is_jpeg = output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false);
    let result = if is_jpeg {
        image::DynamicImage::ImageRgb8(result.to_rgb8())
    } else {
        result
    };

    result
        .save(output)
        .map_err(|e| RetubeError::config(format!("failed to write cover {:?}: {}", output, e)))?;
    Ok(())
}

fn crop_to_aspect(img: &image::DynamicImage) -> image::DynamicImage {
    let (w, h) = img.dimensions();
    // Compare w/h with 16/10 using integer cross-multiplication.
    if w * ASPECT_H > h * ASPECT_W {
        // Too wide: crop width.
        let target_w = h * ASPECT_W / ASPECT_H;
        let x = (w - target_w) / 2;
        img.crop_imm(x, 0, target_w, h)
    } else {
        // Too tall (or exact): crop height.
        let target_h = w * ASPECT_H / ASPECT_W;
        let y = (h - target_h) / 2;
        img.crop_imm(0, y, w, target_h)
    }
}

fn pad_to_aspect(img: &image::DynamicImage) -> image::DynamicImage {
    let (w, h) = img.dimensions();
    let (canvas_w, canvas_h) = if w * ASPECT_H > h * ASPECT_W {
        // Too wide: grow height.
        (w, w * ASPECT_H / ASPECT_W)
    } else {
        (h * ASPECT_W / ASPECT_H, h)
    };
    let mut canvas = RgbaImage::from_pixel(canvas_w, canvas_h, Rgba([0, 0, 0, 255]));
    let x = (canvas_w - w) / 2;
    let y = (canvas_h - h) / 2;
    let rgba = img.to_rgba8();
    imageops::overlay(&mut canvas, &rgba, x as i64, y as i64);
    image::DynamicImage::ImageRgba8(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn within_one_pixel_of_aspect(w: u32, h: u32) -> bool {
        // |w*10 - h*16| bounded by one pixel of either dimension's step.
        let lhs = (w * ASPECT_H) as i64;
        let rhs = (h * ASPECT_W) as i64;
        (lhs - rhs).abs() <= ASPECT_W.max(ASPECT_H) as i64
    }

    fn make_image(dir: &TempDir, name: &str, w: u32, h: u32) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let img = RgbaImage::from_pixel(w, h, Rgba([128, 64, 32, 255]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_crop_wide_image() {
        let dir = TempDir::new().unwrap();
        let input = make_image(&dir, "wide.png", 1920, 1080);
        let output = dir.path().join("out.png");
        process_cover(&input, &output, CoverMode::Crop).unwrap();
        let (w, h) = image::open(&output).unwrap().dimensions();
        assert!(within_one_pixel_of_aspect(w, h), "{}x{}", w, h);
        assert_eq!(h, 1080);
    }

    #[test]
    fn test_crop_tall_image() {
        let dir = TempDir::new().unwrap();
        let input = make_image(&dir, "tall.png", 720, 1280);
        let output = dir.path().join("out.png");
        process_cover(&input, &output, CoverMode::Crop).unwrap();
        let (w, h) = image::open(&output).unwrap().dimensions();
        assert!(within_one_pixel_of_aspect(w, h), "{}x{}", w, h);
        assert_eq!(w, 720);
    }

    #[test]
    fn test_pad_adds_bars() {
        let dir = TempDir::new().unwrap();
        let input = make_image(&dir, "wide.png", 1920, 1080);
        let output = dir.path().join("out.png");
        process_cover(&input, &output, CoverMode::Pad).unwrap();
        let img = image::open(&output).unwrap();
        let (w, h) = img.dimensions();
        assert!(within_one_pixel_of_aspect(w, h), "{}x{}", w, h);
        // Width is preserved, height grows.
        assert_eq!(w, 1920);
        assert!(h >= 1200 - 1);
        // Top bar is black.
        let px = img.to_rgba8().get_pixel(0, 0).0;
        assert_eq!(&px[..3], &[0, 0, 0]);
    }

    #[test]
    fn test_idempotent_on_exact_aspect() {
        let dir = TempDir::new().unwrap();
        let input = make_image(&dir, "exact.png", 1600, 1000);
        let output = dir.path().join("out.png");
        process_cover(&input, &output, CoverMode::Crop).unwrap();
        let (w, h) = image::open(&output).unwrap().dimensions();
        assert_eq!((w, h), (1600, 1000));
    }

    #[test]
    fn test_jpeg_output_flattens_alpha() {
        let dir = TempDir::new().unwrap();
        let input = make_image(&dir, "rgba.png", 800, 500);
        let output = dir.path().join("cover.jpg");
        process_cover(&input, &output, CoverMode::Pad).unwrap();
        let (w, h) = image::open(&output).unwrap().dimensions();
        assert!(within_one_pixel_of_aspect(w, h), "{}x{}", w, h);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(CoverMode::parse("pad"), CoverMode::Pad);
        assert_eq!(CoverMode::parse("crop"), CoverMode::Crop);
        assert_eq!(CoverMode::parse("unknown"), CoverMode::Crop);
    }
}

//! Shared image plumbing: luminance conversion, quality statistics, size
//! normalization and post-warp cropping.

pub mod enhance;
pub mod warp;

use image::{imageops, GrayImage, RgbImage};

/// First-order luminance statistics plus the Laplacian-variance blur score.
/// Higher blur score means sharper.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LumaStats {
    pub blur_score: f64,
    pub brightness: f64,
    pub contrast: f64,
}

pub fn to_luma(image: &RgbImage) -> GrayImage {
    imageops::grayscale(image)
}

/// Mean, standard deviation and the variance of the 4-neighbor Laplacian
/// response over the interior pixels.
pub fn luma_stats(image: &GrayImage) -> LumaStats {
    let (width, height) = image.dimensions();
    let n = (width as f64) * (height as f64);

    if n == 0.0 {
        return LumaStats { blur_score: 0.0, brightness: 0.0, contrast: 0.0 };
    }

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for pixel in image.pixels() {
        let v = pixel[0] as f64;
        sum += v;
        sum_sq += v * v;
    }
    let brightness = sum / n;
    let contrast = (sum_sq / n - brightness * brightness).max(0.0).sqrt();

    // Laplacian response is only defined away from the border.
    let mut lap_sum = 0.0;
    let mut lap_sum_sq = 0.0;
    let mut lap_n = 0.0;
    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let center = image.get_pixel(x, y)[0] as f64;
            let response = image.get_pixel(x, y - 1)[0] as f64
                + image.get_pixel(x, y + 1)[0] as f64
                + image.get_pixel(x - 1, y)[0] as f64
                + image.get_pixel(x + 1, y)[0] as f64
                - 4.0 * center;
            lap_sum += response;
            lap_sum_sq += response * response;
            lap_n += 1.0;
        }
    }

    let blur_score = if lap_n > 0.0 {
        let mean = lap_sum / lap_n;
        (lap_sum_sq / lap_n - mean * mean).max(0.0)
    } else {
        0.0
    };

    LumaStats { blur_score, brightness, contrast }
}

/// Scales the image so its longer side equals `target_dimension`. Returns the
/// resized image and the applied scale factor (new / original).
pub fn normalize_size(image: &RgbImage, target_dimension: u32) -> (RgbImage, f64) {
    let (width, height) = image.dimensions();
    let max_dim = width.max(height);

    if max_dim == 0 || max_dim == target_dimension {
        return (image.clone(), 1.0);
    }

    let scale = target_dimension as f64 / max_dim as f64;
    let new_w = ((width as f64 * scale).round() as u32).max(1);
    let new_h = ((height as f64 * scale).round() as u32).max(1);
    let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

    (resized, scale)
}

/// Bounding box of pixels with luminance above `threshold`, expanded by
/// `margin` and clamped to the image. None when everything is below.
pub fn content_bounds(
    image: &GrayImage,
    threshold: u8,
    margin: u32,
) -> Option<(u32, u32, u32, u32)> {
    let (width, height) = image.dimensions();
    let mut min_x = width;
    let mut min_y = height;
    let mut max_x = 0u32;
    let mut max_y = 0u32;
    let mut found = false;

    for (x, y, pixel) in image.enumerate_pixels() {
        if pixel[0] > threshold {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            found = true;
        }
    }

    if !found {
        return None;
    }

    let x = min_x.saturating_sub(margin);
    let y = min_y.saturating_sub(margin);
    let w = (max_x + 1 + margin).min(width) - x;
    let h = (max_y + 1 + margin).min(height) - y;
    Some((x, y, w, h))
}

/// Crops the black border a projective warp leaves around out-of-frame
/// samples. Returns the image unchanged when no content is found.
pub fn crop_black_padding(image: &RgbImage, threshold: u8, margin: u32) -> RgbImage {
    let gray = to_luma(image);
    match content_bounds(&gray, threshold, margin) {
        Some((x, y, w, h)) => imageops::crop_imm(image, x, y, w, h).to_image(),
        None => image.clone(),
    }
}

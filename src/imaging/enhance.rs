//! Pre-extraction enhancement of the luminance channel.
//!
//! The order is fixed: adaptive local-contrast equalization first, then
//! edge-preserving smoothing, then sharpening. Running the equalizer after
//! the smoothing stages would wash out the local contrast gains the detector
//! depends on.

use crate::config::EnhanceConfig;
use image::{GrayImage, Luma};

pub fn enhance(image: &GrayImage, config: &EnhanceConfig) -> GrayImage {
    let equalized = clahe(
        image,
        config.clahe_clip_limit,
        config.clahe_tile_cols,
        config.clahe_tile_rows,
    );
    let smoothed = bilateral(
        &equalized,
        config.bilateral_radius,
        config.bilateral_sigma_color,
        config.bilateral_sigma_space,
    );
    if config.sharpen {
        sharpen(&smoothed)
    } else {
        smoothed
    }
}

/// Contrast-limited adaptive histogram equalization. The image is divided
/// into a `tile_cols` x `tile_rows` grid; each tile gets a clipped-histogram
/// CDF lookup table, and pixels are mapped by bilinearly blending the tables
/// of the four surrounding tile centers. Smaller tiles trade global
/// smoothness for local detail.
pub fn clahe(image: &GrayImage, clip_limit: f32, tile_cols: u32, tile_rows: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let tile_w = width.div_ceil(tile_cols.max(1).min(width));
    let tile_h = height.div_ceil(tile_rows.max(1).min(height));
    // The configured grid may overshoot the image; index by the tiles that
    // actually cover pixels.
    let tile_cols = width.div_ceil(tile_w);
    let tile_rows = height.div_ceil(tile_h);

    // One 256-entry mapping per tile.
    let mut luts = vec![[0u8; 256]; (tile_cols * tile_rows) as usize];

    for ty in 0..tile_rows {
        for tx in 0..tile_cols {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[image.get_pixel(x, y)[0] as usize] += 1;
                }
            }

            let pixels = ((x1 - x0) * (y1 - y0)) as u32;
            if pixels == 0 {
                continue;
            }

            // Clip the histogram and spread the excess uniformly.
            let limit = ((clip_limit * pixels as f32 / 256.0).ceil() as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let bonus = excess / 256;
            let remainder = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += bonus + u32::from(i < remainder);
            }

            let lut = &mut luts[(ty * tile_cols + tx) as usize];
            let mut cdf = 0u32;
            for (i, &count) in hist.iter().enumerate() {
                cdf += count;
                lut[i] = ((cdf as f32 / pixels as f32) * 255.0).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tile_cols + tx) as usize];

    GrayImage::from_fn(width, height, |x, y| {
        let value = image.get_pixel(x, y)[0] as usize;

        // Position relative to tile centers.
        let fx = (x as f32 - tile_w as f32 / 2.0) / tile_w as f32;
        let fy = (y as f32 - tile_h as f32 / 2.0) / tile_h as f32;
        let tx0 = fx.floor().max(0.0) as u32;
        let ty0 = fy.floor().max(0.0) as u32;
        let tx0 = tx0.min(tile_cols - 1);
        let ty0 = ty0.min(tile_rows - 1);
        let tx1 = (tx0 + 1).min(tile_cols - 1);
        let ty1 = (ty0 + 1).min(tile_rows - 1);
        let wx = (fx - fx.floor()).clamp(0.0, 1.0);
        let wy = (fy - fy.floor()).clamp(0.0, 1.0);

        let top = lut_at(tx0, ty0)[value] as f32 * (1.0 - wx) + lut_at(tx1, ty0)[value] as f32 * wx;
        let bottom =
            lut_at(tx0, ty1)[value] as f32 * (1.0 - wx) + lut_at(tx1, ty1)[value] as f32 * wx;
        let blended = top * (1.0 - wy) + bottom * wy;

        Luma([blended.round().clamp(0.0, 255.0) as u8])
    })
}

/// Edge-preserving smoothing: each output pixel is a weighted mean of its
/// neighborhood where weights fall off with both spatial distance and
/// intensity difference, so noise is averaged away without blurring edges.
pub fn bilateral(image: &GrayImage, radius: u32, sigma_color: f32, sigma_space: f32) -> GrayImage {
    let (width, height) = image.dimensions();
    if radius == 0 || width == 0 || height == 0 {
        return image.clone();
    }

    let r = radius as i32;
    let inv_2s_space = 1.0 / (2.0 * sigma_space * sigma_space).max(f32::EPSILON);
    let inv_2s_color = 1.0 / (2.0 * sigma_color * sigma_color).max(f32::EPSILON);

    let mut spatial = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
    for dy in -r..=r {
        for dx in -r..=r {
            spatial.push((-((dx * dx + dy * dy) as f32) * inv_2s_space).exp());
        }
    }

    let mut color_lut = [0.0f32; 256];
    for (diff, weight) in color_lut.iter_mut().enumerate() {
        *weight = (-((diff * diff) as f32) * inv_2s_color).exp();
    }

    GrayImage::from_fn(width, height, |x, y| {
        let center = image.get_pixel(x, y)[0];
        let mut acc = 0.0f32;
        let mut norm = 0.0f32;
        let mut k = 0usize;

        for dy in -r..=r {
            for dx in -r..=r {
                let px = (x as i32 + dx).clamp(0, width as i32 - 1) as u32;
                let py = (y as i32 + dy).clamp(0, height as i32 - 1) as u32;
                let value = image.get_pixel(px, py)[0];
                let diff = (value as i32 - center as i32).unsigned_abs() as usize;
                let weight = spatial[k] * color_lut[diff];
                acc += weight * value as f32;
                norm += weight;
                k += 1;
            }
        }

        Luma([(acc / norm).round().clamp(0.0, 255.0) as u8])
    })
}

/// 3x3 sharpening convolution (center 5, cross -1). Border pixels are copied
/// through.
pub fn sharpen(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return image.clone();
    }

    GrayImage::from_fn(width, height, |x, y| {
        if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
            return *image.get_pixel(x, y);
        }

        let value = 5.0 * image.get_pixel(x, y)[0] as f32
            - image.get_pixel(x, y - 1)[0] as f32
            - image.get_pixel(x, y + 1)[0] as f32
            - image.get_pixel(x - 1, y)[0] as f32
            - image.get_pixel(x + 1, y)[0] as f32;

        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

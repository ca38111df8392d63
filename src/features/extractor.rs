//! Oriented FAST corners with rotated BRIEF descriptors over a scale
//! pyramid.

use crate::config::DetectorConfig;
use crate::features::{Descriptor, FeatureSet, Keypoint};
use image::{imageops, GrayImage};
use lazy_static::lazy_static;
use rayon::prelude::*;
use std::cmp::Ordering;

/// Offsets of the 16-pixel Bresenham circle used by the FAST-9 test.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1), (3, 0), (3, 1),
    (2, 2), (1, 3), (0, 3), (-1, 3), (-2, 2), (-3, 1),
    (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];

const ORIENTATION_RADIUS: i32 = 15;

lazy_static! {
    /// 256 BRIEF test pairs inside a 31x31 patch, generated once from a
    /// fixed linear-congruential sequence so descriptors are stable across
    /// runs and processes.
    static ref BRIEF_PATTERN: Vec<(i8, i8, i8, i8)> = {
        let mut pattern = Vec::with_capacity(256);
        for i in 0..256u32 {
            let coord = |seed: u32| {
                ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % 31) as i8 - 15
            };
            pattern.push((coord(i), coord(i + 1), coord(i + 2), coord(i + 3)));
        }
        pattern
    };
}

/// Detects corner-like keypoints across the scale pyramid and computes a
/// binary descriptor for each. Deterministic for identical pixels and
/// parameters.
pub struct FeatureExtractor {
    config: DetectorConfig,
}

#[derive(Debug, Clone, Copy)]
struct Corner {
    // Coordinates on the level it was found at, for orientation and
    // descriptor sampling.
    lx: u32,
    ly: u32,
    level: u32,
    scale: f32,
    // Base-frame coordinates, for suppression and matching.
    x: f32,
    y: f32,
    response: f32,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl FeatureExtractor {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Returns at most `max_features` keypoints, sorted by descending
    /// response. An image without corners yields an empty set, not an error.
    pub fn extract(&self, image: &GrayImage) -> FeatureSet {
        let pyramid = self.build_pyramid(image);

        let mut corners: Vec<Corner> = pyramid
            .par_iter()
            .enumerate()
            .map(|(level, scaled)| self.detect_level(scaled, level as u32))
            .reduce(Vec::new, |mut acc, mut level_corners| {
                acc.append(&mut level_corners);
                acc
            });

        // Strongest first; coordinates break ties so ordering is total.
        corners.sort_by(|a, b| {
            b.response
                .partial_cmp(&a.response)
                .unwrap_or(Ordering::Equal)
                .then_with(|| (a.level, a.ly, a.lx).cmp(&(b.level, b.ly, b.lx)))
        });

        let selected = self.suppress(corners);

        let mut keypoints = Vec::with_capacity(selected.len());
        let mut descriptors = Vec::with_capacity(selected.len());
        for corner in selected {
            let level_image = &pyramid[corner.level as usize];
            let angle = orientation(level_image, corner.lx, corner.ly);
            keypoints.push(Keypoint {
                x: corner.x,
                y: corner.y,
                response: corner.response,
                angle,
                level: corner.level,
                scale: corner.scale,
            });
            descriptors.push(describe(level_image, corner.lx, corner.ly, angle));
        }

        FeatureSet { keypoints, descriptors }
    }

    fn build_pyramid(&self, image: &GrayImage) -> Vec<GrayImage> {
        let mut pyramid = vec![image.clone()];
        let min_dim = (2 * self.margin() + 1).max(8);

        for level in 1..self.config.pyramid_levels {
            let scale = self.config.scale_step.powi(level as i32);
            let w = (image.width() as f32 / scale).round() as u32;
            let h = (image.height() as f32 / scale).round() as u32;
            if w < min_dim || h < min_dim {
                break;
            }
            pyramid.push(imageops::resize(image, w, h, imageops::FilterType::Triangle));
        }

        pyramid
    }

    fn margin(&self) -> u32 {
        // The FAST circle needs 3 pixels of border no matter how small the
        // configured exclusion zone is.
        self.config.edge_margin.max(3)
    }

    fn detect_level(&self, image: &GrayImage, level: u32) -> Vec<Corner> {
        let (width, height) = image.dimensions();
        let margin = self.margin();
        if width <= 2 * margin || height <= 2 * margin {
            return Vec::new();
        }

        let scale = self.config.scale_step.powi(level as i32);
        let mut corners = Vec::new();

        for y in margin..(height - margin) {
            for x in margin..(width - margin) {
                let center = image.get_pixel(x, y)[0];
                if is_fast_corner(image, x, y, center, self.config.fast_threshold) {
                    corners.push(Corner {
                        lx: x,
                        ly: y,
                        level,
                        scale,
                        x: x as f32 * scale,
                        y: y as f32 * scale,
                        response: corner_response(image, x, y),
                    });
                }
            }
        }

        corners
    }

    /// Non-maximum suppression over base-frame coordinates. Corners arrive
    /// sorted by response; a grid keyed by the suppression radius keeps the
    /// scan linear instead of quadratic in the corner count.
    fn suppress(&self, corners: Vec<Corner>) -> Vec<Corner> {
        let radius = self.config.nms_radius.max(0.5);
        let radius_sq = radius * radius;
        let cell = radius;
        let mut grid: std::collections::HashMap<(i64, i64), Vec<(f32, f32)>> =
            std::collections::HashMap::new();
        let mut selected = Vec::new();

        for corner in corners {
            let cx = (corner.x / cell).floor() as i64;
            let cy = (corner.y / cell).floor() as i64;

            let mut is_maximum = true;
            'search: for ny in (cy - 1)..=(cy + 1) {
                for nx in (cx - 1)..=(cx + 1) {
                    if let Some(points) = grid.get(&(nx, ny)) {
                        for &(px, py) in points {
                            let dx = corner.x - px;
                            let dy = corner.y - py;
                            if dx * dx + dy * dy < radius_sq {
                                is_maximum = false;
                                break 'search;
                            }
                        }
                    }
                }
            }

            if is_maximum {
                grid.entry((cx, cy)).or_default().push((corner.x, corner.y));
                selected.push(corner);
                if selected.len() >= self.config.max_features {
                    break;
                }
            }
        }

        selected
    }
}

fn is_fast_corner(image: &GrayImage, x: u32, y: u32, center: u8, threshold: u8) -> bool {
    let bright = center.saturating_add(threshold);
    let dark = center.saturating_sub(threshold);

    let mut max_bright_run = 0;
    let mut max_dark_run = 0;
    let mut bright_run = 0;
    let mut dark_run = 0;

    // Walk the circle twice to catch runs that wrap around the seam.
    for i in 0..(CIRCLE.len() * 2) {
        let (dx, dy) = CIRCLE[i % CIRCLE.len()];
        let px = (x as i32 + dx) as u32;
        let py = (y as i32 + dy) as u32;
        let value = image.get_pixel(px, py)[0];

        if value > bright {
            bright_run += 1;
            dark_run = 0;
            max_bright_run = max_bright_run.max(bright_run);
        } else if value < dark {
            dark_run += 1;
            bright_run = 0;
            max_dark_run = max_dark_run.max(dark_run);
        } else {
            bright_run = 0;
            dark_run = 0;
        }
    }

    max_bright_run >= 9 || max_dark_run >= 9
}

/// Response strength from the intensity spread of the 5x5 neighborhood.
fn corner_response(image: &GrayImage, x: u32, y: u32) -> f32 {
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut count = 0u32;

    for dy in -2i32..=2 {
        for dx in -2i32..=2 {
            let px = x as i32 + dx;
            let py = y as i32 + dy;
            if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height() {
                let value = image.get_pixel(px as u32, py as u32)[0] as f32;
                sum += value;
                sum_sq += value * value;
                count += 1;
            }
        }
    }

    let mean = sum / count as f32;
    ((sum_sq / count as f32) - mean * mean).max(0.0).sqrt()
}

/// Intensity-centroid orientation in radians.
fn orientation(image: &GrayImage, x: u32, y: u32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;

    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > ORIENTATION_RADIUS * ORIENTATION_RADIUS {
                continue;
            }
            let px = x as i32 + dx;
            let py = y as i32 + dy;
            if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height() {
                let value = image.get_pixel(px as u32, py as u32)[0] as f32;
                m01 += value * dy as f32;
                m10 += value * dx as f32;
            }
        }
    }

    m01.atan2(m10)
}

/// Rotated BRIEF: every test pair is rotated by the keypoint orientation
/// before sampling, clamped to the image.
fn describe(image: &GrayImage, x: u32, y: u32, angle: f32) -> Descriptor {
    let mut descriptor = [0u8; 32];
    let (cos_a, sin_a) = (angle.cos(), angle.sin());
    let (width, height) = image.dimensions();
    let cx = x as i32;
    let cy = y as i32;

    let sample = |dx: i8, dy: i8| -> u8 {
        let rx = (dx as f32 * cos_a - dy as f32 * sin_a).round() as i32;
        let ry = (dx as f32 * sin_a + dy as f32 * cos_a).round() as i32;
        let px = (cx + rx).clamp(0, width as i32 - 1) as u32;
        let py = (cy + ry).clamp(0, height as i32 - 1) as u32;
        image.get_pixel(px, py)[0]
    };

    for (byte_idx, tests) in BRIEF_PATTERN.chunks(8).enumerate() {
        let mut byte = 0u8;
        for (bit_idx, &(x1, y1, x2, y2)) in tests.iter().enumerate() {
            if sample(x1, y1) < sample(x2, y2) {
                byte |= 1 << bit_idx;
            }
        }
        descriptor[byte_idx] = byte;
    }

    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn textured_image(width: u32, height: u32) -> GrayImage {
        // Deterministic pseudo-noise gives plenty of FAST corners.
        GrayImage::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(31).wrapping_add(y.wrapping_mul(57)))
                .wrapping_mul(2654435761)
                >> 24;
            Luma([v as u8])
        })
    }

    #[test]
    fn flat_image_yields_no_features() {
        let extractor = FeatureExtractor::default();
        let set = extractor.extract(&GrayImage::from_pixel(128, 128, Luma([128])));
        assert!(set.is_empty());
    }

    #[test]
    fn output_is_sorted_and_bounded() {
        let mut config = DetectorConfig::default();
        config.max_features = 200;
        let extractor = FeatureExtractor::new(config);
        let set = extractor.extract(&textured_image(256, 256));

        assert!(!set.is_empty());
        assert!(set.len() <= 200);
        assert_eq!(set.keypoints.len(), set.descriptors.len());
        assert!(set
            .keypoints
            .windows(2)
            .all(|w| w[0].response >= w[1].response));
    }

    #[test]
    fn extraction_is_deterministic() {
        let extractor = FeatureExtractor::default();
        let image = textured_image(128, 128);
        let a = extractor.extract(&image);
        let b = extractor.extract(&image);

        assert_eq!(a.len(), b.len());
        for (ka, kb) in a.keypoints.iter().zip(&b.keypoints) {
            assert_eq!((ka.x, ka.y, ka.level), (kb.x, kb.y, kb.level));
        }
        assert_eq!(a.descriptors, b.descriptors);
    }

    #[test]
    fn edge_margin_excludes_border_corners() {
        let mut config = DetectorConfig::default();
        config.edge_margin = 20;
        config.pyramid_levels = 1;
        let extractor = FeatureExtractor::new(config);
        let set = extractor.extract(&textured_image(128, 128));

        for kp in &set.keypoints {
            assert!(kp.x >= 20.0 && kp.x <= 107.0);
            assert!(kp.y >= 20.0 && kp.y <= 107.0);
        }
    }
}

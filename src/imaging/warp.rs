//! Projective warping into a reference frame.

use crate::homography::Homography;
use crate::Result;
use anyhow::anyhow;
use image::{Rgb, RgbImage};

/// Warps `source` with `transform` (source coordinates to output
/// coordinates) into an `out_width` x `out_height` canvas. Output pixels are
/// filled by inverse mapping with bilinear sampling; samples falling outside
/// the source stay black.
pub fn warp_perspective(
    source: &RgbImage,
    transform: &Homography,
    out_width: u32,
    out_height: u32,
) -> Result<RgbImage> {
    let inverse = transform
        .inverse()
        .ok_or_else(|| anyhow!("homography is not invertible"))?;

    let mut output = RgbImage::new(out_width, out_height);
    for y in 0..out_height {
        for x in 0..out_width {
            let (sx, sy) = inverse.apply(x as f64, y as f64);
            if let Some(pixel) = sample_bilinear(source, sx, sy) {
                output.put_pixel(x, y, pixel);
            }
        }
    }

    Ok(output)
}

fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> Option<Rgb<u8>> {
    let (width, height) = image.dimensions();
    if !x.is_finite() || !y.is_finite() {
        return None;
    }
    if x < 0.0 || y < 0.0 || x > (width - 1) as f64 || y > (height - 1) as f64 {
        return None;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut channels = [0u8; 3];
    for (c, out) in channels.iter_mut().enumerate() {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        *out = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }

    Some(Rgb(channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn identity_warp_reproduces_source() {
        let source = RgbImage::from_fn(16, 16, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 7]));
        let warped =
            warp_perspective(&source, &Homography::new(Matrix3::identity()), 16, 16).unwrap();
        assert_eq!(source, warped);
    }

    #[test]
    fn translation_warp_shifts_content() {
        let mut source = RgbImage::new(16, 16);
        source.put_pixel(4, 4, Rgb([255, 0, 0]));

        // Maps source (4, 4) to output (9, 6).
        let shift = Matrix3::new(1.0, 0.0, 5.0, 0.0, 1.0, 2.0, 0.0, 0.0, 1.0);
        let warped = warp_perspective(&source, &Homography::new(shift), 16, 16).unwrap();
        assert_eq!(*warped.get_pixel(9, 6), Rgb([255, 0, 0]));
    }

    #[test]
    fn out_of_frame_samples_stay_black() {
        let source = RgbImage::from_pixel(8, 8, Rgb([200, 200, 200]));
        let shift = Matrix3::new(1.0, 0.0, 6.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        let warped = warp_perspective(&source, &Homography::new(shift), 8, 8).unwrap();
        assert_eq!(*warped.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*warped.get_pixel(7, 0), Rgb([200, 200, 200]));
    }

    #[test]
    fn singular_transform_is_an_error() {
        let source = RgbImage::new(4, 4);
        let singular = Matrix3::new(1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        assert!(warp_perspective(&source, &Homography::new(singular), 4, 4).is_err());
    }
}

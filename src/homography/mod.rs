//! Robust projective-transform estimation.
//!
//! A fixed, ordered cascade of RANSAC configurations is evaluated
//! exhaustively; the attempt with the highest inlier count wins and ties
//! keep the earlier (stricter) entry. Each attempt fits candidate
//! homographies from 4-point minimal samples by normalized DLT and refits
//! over the consensus set.

use crate::config::{RansacAttemptConfig, RansacSettings};
use nalgebra::{DMatrix, Matrix3, Point2};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Planar projective transform represented by a 3x3 matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
}

impl Homography {
    pub fn new(matrix: Matrix3<f64>) -> Self {
        Self { matrix }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    /// Pure scaling transform.
    pub fn scaling(factor: f64) -> Self {
        Self::new(Matrix3::new(factor, 0.0, 0.0, 0.0, factor, 0.0, 0.0, 0.0, 1.0))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Applies the transform to a point. Points mapped to the line at
    /// infinity come back as non-finite coordinates and fail any distance
    /// comparison downstream.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let m = &self.matrix;
        let w = m[(2, 0)] * x + m[(2, 1)] * y + m[(2, 2)];
        let px = (m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)]) / w;
        let py = (m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)]) / w;
        (px, py)
    }

    pub fn inverse(&self) -> Option<Homography> {
        self.matrix.try_inverse().map(Homography::new)
    }

    /// Composition `self ∘ other`: applies `other` first.
    pub fn compose(&self, other: &Homography) -> Homography {
        Homography::new(self.matrix * other.matrix)
    }
}

/// A matched point pair in pixel coordinates; the fitted transform maps
/// `source` onto `target`.
#[derive(Debug, Clone, Copy)]
pub struct PointPair {
    pub source: Point2<f64>,
    pub target: Point2<f64>,
}

/// One cascade entry together with its outcome.
#[derive(Debug, Clone)]
pub struct RansacAttempt {
    pub config: RansacAttemptConfig,
    pub homography: Option<Homography>,
    pub inliers: Vec<usize>,
}

impl RansacAttempt {
    pub fn inlier_count(&self) -> usize {
        self.inliers.len()
    }
}

pub struct RansacEstimator {
    settings: RansacSettings,
}

impl Default for RansacEstimator {
    fn default() -> Self {
        Self::new(RansacSettings::default())
    }
}

impl RansacEstimator {
    pub fn new(settings: RansacSettings) -> Self {
        Self { settings }
    }

    /// Runs every cascade entry and returns the attempts in cascade order.
    /// With fewer than 4 pairs no fitting is attempted and every entry
    /// reports failure.
    pub fn run(&self, pairs: &[PointPair]) -> Vec<RansacAttempt> {
        self.settings
            .cascade
            .iter()
            .enumerate()
            .map(|(index, config)| {
                if pairs.len() < 4 {
                    return RansacAttempt {
                        config: config.clone(),
                        homography: None,
                        inliers: Vec::new(),
                    };
                }
                self.fit_single(pairs, config, index)
            })
            .collect()
    }

    /// Best attempt across the cascade, or None when no entry produced a
    /// transform.
    pub fn estimate(&self, pairs: &[PointPair]) -> Option<RansacAttempt> {
        let attempts = self.run(pairs);
        select_best(&attempts).map(|i| attempts[i].clone())
    }

    fn fit_single(
        &self,
        pairs: &[PointPair],
        config: &RansacAttemptConfig,
        attempt_index: usize,
    ) -> RansacAttempt {
        let mut rng = match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(attempt_index as u64)),
            None => StdRng::from_entropy(),
        };

        let threshold_sq = config.threshold * config.threshold;
        let mut best_inliers: Vec<usize> = Vec::new();
        let mut best_model: Option<Homography> = None;
        let mut iteration_bound = config.max_iterations;
        let mut iteration = 0;

        while iteration < iteration_bound {
            iteration += 1;

            let sample = rand::seq::index::sample(&mut rng, pairs.len(), 4);
            let minimal: Vec<PointPair> = sample.iter().map(|i| pairs[i]).collect();
            if is_degenerate(&minimal) {
                continue;
            }

            let Some(model) = fit_homography(&minimal) else {
                continue;
            };

            let inliers = consensus(pairs, &model, threshold_sq);
            if inliers.len() > best_inliers.len() {
                best_inliers = inliers;
                best_model = Some(model);

                // Shrink the bound once the inlier ratio supports the
                // configured confidence.
                let w = best_inliers.len() as f64 / pairs.len() as f64;
                let all_inlier_sample = w.powi(4);
                if all_inlier_sample > 0.0 && all_inlier_sample < 1.0 {
                    let needed =
                        (1.0 - config.confidence).ln() / (1.0 - all_inlier_sample).ln();
                    iteration_bound = config.max_iterations.min(needed.ceil() as usize);
                } else if all_inlier_sample >= 1.0 {
                    break;
                }
            }
        }

        // Least-squares refit over the consensus set, kept only when it does
        // not lose inliers.
        if best_inliers.len() >= 4 {
            let support: Vec<PointPair> = best_inliers.iter().map(|&i| pairs[i]).collect();
            if let Some(refit) = fit_homography(&support) {
                let refit_inliers = consensus(pairs, &refit, threshold_sq);
                if refit_inliers.len() >= best_inliers.len() {
                    best_inliers = refit_inliers;
                    best_model = Some(refit);
                }
            }
        }

        if best_inliers.len() < 4 {
            return RansacAttempt { config: config.clone(), homography: None, inliers: Vec::new() };
        }

        RansacAttempt { config: config.clone(), homography: best_model, inliers: best_inliers }
    }
}

/// Index of the winning attempt: highest inlier count among attempts that
/// produced a transform, ties resolved to the earliest-listed entry.
pub fn select_best(attempts: &[RansacAttempt]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, attempt) in attempts.iter().enumerate() {
        if attempt.homography.is_none() {
            continue;
        }
        match best {
            Some(b) if attempts[b].inlier_count() >= attempt.inlier_count() => {}
            _ => best = Some(i),
        }
    }
    best
}

fn consensus(pairs: &[PointPair], model: &Homography, threshold_sq: f64) -> Vec<usize> {
    pairs
        .iter()
        .enumerate()
        .filter(|(_, pair)| {
            let (px, py) = model.apply(pair.source.x, pair.source.y);
            let dx = px - pair.target.x;
            let dy = py - pair.target.y;
            let err = dx * dx + dy * dy;
            err.is_finite() && err <= threshold_sq
        })
        .map(|(i, _)| i)
        .collect()
}

/// A minimal sample is unusable when any three of its points are
/// (near-)collinear on either side.
fn is_degenerate(sample: &[PointPair]) -> bool {
    let sources: Vec<Point2<f64>> = sample.iter().map(|p| p.source).collect();
    let targets: Vec<Point2<f64>> = sample.iter().map(|p| p.target).collect();
    has_collinear_triple(&sources) || has_collinear_triple(&targets)
}

fn has_collinear_triple(points: &[Point2<f64>]) -> bool {
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            for k in (j + 1)..points.len() {
                let ab = points[j] - points[i];
                let ac = points[k] - points[i];
                let area = (ab.x * ac.y - ab.y * ac.x).abs();
                if area < 1e-6 {
                    return true;
                }
            }
        }
    }
    false
}

/// Direct linear transform over 4 or more pairs with Hartley normalization.
/// Returns None when the system is numerically singular.
fn fit_homography(pairs: &[PointPair]) -> Option<Homography> {
    if pairs.len() < 4 {
        return None;
    }

    let sources: Vec<Point2<f64>> = pairs.iter().map(|p| p.source).collect();
    let targets: Vec<Point2<f64>> = pairs.iter().map(|p| p.target).collect();
    let (norm_src, t_src) = normalize_points(&sources)?;
    let (norm_dst, t_dst) = normalize_points(&targets)?;

    let mut a = DMatrix::<f64>::zeros(2 * pairs.len(), 9);
    for (i, (s, d)) in norm_src.iter().zip(&norm_dst).enumerate() {
        let (x, y) = (s.x, s.y);
        let (u, v) = (d.x, d.y);
        let r = 2 * i;
        a[(r, 0)] = -x;
        a[(r, 1)] = -y;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = u * x;
        a[(r, 7)] = u * y;
        a[(r, 8)] = u;
        a[(r + 1, 3)] = -x;
        a[(r + 1, 4)] = -y;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = v * x;
        a[(r + 1, 7)] = v * y;
        a[(r + 1, 8)] = v;
    }

    // The null-space direction of A is the eigenvector of AᵀA for its
    // smallest eigenvalue; the 9x9 system also keeps the decomposition size
    // independent of the pair count.
    let ata = a.transpose() * &a;
    let svd = ata.svd(false, true);
    let v_t = svd.v_t?;

    let mut min_index = 0;
    for (i, value) in svd.singular_values.iter().enumerate() {
        if *value < svd.singular_values[min_index] {
            min_index = i;
        }
    }
    let h = v_t.row(min_index);

    let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    if !normalized.iter().all(|v| v.is_finite()) {
        return None;
    }

    let denorm = t_dst.try_inverse()? * normalized * t_src;
    let scale = denorm[(2, 2)];
    let matrix = if scale.abs() > 1e-12 { denorm / scale } else { denorm };

    if matrix.determinant().abs() < 1e-12 {
        return None;
    }

    Some(Homography::new(matrix))
}

/// Translates the centroid to the origin and scales the mean distance to
/// sqrt(2), the usual conditioning step before the DLT solve.
fn normalize_points(points: &[Point2<f64>]) -> Option<(Vec<Point2<f64>>, Matrix3<f64>)> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;

    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return None;
    }

    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let transform = Matrix3::new(scale, 0.0, -scale * cx, 0.0, scale, -scale * cy, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|p| Point2::new(scale * (p.x - cx), scale * (p.y - cy)))
        .collect();

    Some((normalized, transform))
}

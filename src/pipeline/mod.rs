//! Per-request orchestration: template lookup, extraction, matching,
//! robust estimation, warping, scoring and the accept/reject decision.
//!
//! Every fallback to the original image is a defined outcome with a reason,
//! logged with its triggering counts. A request is never retried; the RANSAC
//! cascade is the only retry strategy.

use crate::config::AlignmentConfig;
use crate::features::FeatureExtractor;
use crate::homography::{select_best, Homography, PointPair, RansacAttempt, RansacEstimator};
use crate::imaging::{self, enhance::enhance, warp::warp_perspective};
use crate::matching::DescriptorMatcher;
use crate::quality::{QualityMetrics, QualityRejection, QualityScorer};
use crate::templates::TemplateStore;
use crate::Result;
use image::RgbImage;
use nalgebra::Point2;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Aligned,
    Original,
}

/// Why the pipeline returned the original image. All of these are normal,
/// expected outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    NoTemplate,
    NoInputFeatures,
    NoCorrespondences,
    EstimationFailed { good_matches: usize },
    QualityRejected(QualityRejection),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoTemplate => write!(f, "no template"),
            FallbackReason::NoInputFeatures => write!(f, "no features detected in input"),
            FallbackReason::NoCorrespondences => {
                write!(f, "no correspondences survived filtering")
            }
            FallbackReason::EstimationFailed { good_matches } => {
                write!(f, "homography estimation failed ({} good matches)", good_matches)
            }
            FallbackReason::QualityRejected(rejection) => rejection.fmt(f),
        }
    }
}

/// Inlier outcome of one cascade entry, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptTrace {
    pub threshold: f64,
    pub max_iterations: usize,
    pub confidence: f64,
    pub converged: bool,
    pub inliers: usize,
}

/// The externally visible record of one alignment request.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub features_base: usize,
    pub features_target: usize,
    pub good_matches: usize,
    pub inliers: usize,
    pub blur_score: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub quality_score: u32,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempts: Vec<AttemptTrace>,
}

/// Final output: the chosen image (aligned or the untouched input), metrics
/// when a warp was scored, and the diagnostic trace.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub image: RgbImage,
    pub metrics: Option<QualityMetrics>,
    pub reason: Option<FallbackReason>,
    pub diagnostics: Diagnostics,
}

impl Alignment {
    pub fn is_aligned(&self) -> bool {
        self.diagnostics.decision == Decision::Aligned
    }
}

/// Stateless per request apart from the shared template cache; safe to call
/// concurrently from multiple threads.
pub struct AlignmentPipeline {
    store: Arc<TemplateStore>,
    extractor: FeatureExtractor,
    matcher: DescriptorMatcher,
    estimator: RansacEstimator,
    scorer: QualityScorer,
    config: AlignmentConfig,
}

#[derive(Default)]
struct StageCounts {
    features_base: usize,
    features_target: usize,
    good_matches: usize,
    inliers: usize,
    attempts: Vec<AttemptTrace>,
}

impl AlignmentPipeline {
    pub fn new(store: Arc<TemplateStore>, config: AlignmentConfig) -> Self {
        Self {
            store,
            extractor: FeatureExtractor::new(config.detector.clone()),
            matcher: DescriptorMatcher::new(config.matcher.clone()),
            estimator: RansacEstimator::new(config.ransac.clone()),
            scorer: QualityScorer::new(config.scoring.clone()),
            config,
        }
    }

    /// Aligns one decoded input image against the template selected by
    /// `label`. Returns `Err` only for malformed inputs (an undecodable
    /// template file); every insufficient-signal condition resolves to the
    /// original image with a reason.
    pub fn align(&self, input: &RgbImage, label: &str) -> Result<Alignment> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("align", request = %request_id, label = label);
        let _guard = span.enter();

        let mut counts = StageCounts::default();

        let Some(template) = self.store.get(label)? else {
            return Ok(self.fall_back(input, counts, None, FallbackReason::NoTemplate));
        };
        counts.features_base = template.features.len();

        let (normalized, input_scale) =
            imaging::normalize_size(input, self.config.pipeline.target_dimension);
        let enhanced = enhance(&imaging::to_luma(&normalized), &self.config.enhance);
        let input_features = self.extractor.extract(&enhanced);
        counts.features_target = input_features.len();
        tracing::debug!(
            features_base = counts.features_base,
            features_target = counts.features_target,
            "features extracted"
        );

        if input_features.is_empty() {
            return Ok(self.fall_back(input, counts, None, FallbackReason::NoInputFeatures));
        }

        let matches = self.matcher.match_features(&input_features, &template.features);
        counts.good_matches = matches.len();
        if matches.is_empty() {
            return Ok(self.fall_back(input, counts, None, FallbackReason::NoCorrespondences));
        }

        let pairs: Vec<PointPair> = matches
            .iter()
            .map(|m| {
                let source = input_features.keypoints[m.input_idx];
                let target = template.features.keypoints[m.template_idx];
                PointPair {
                    source: Point2::new(source.x as f64, source.y as f64),
                    target: Point2::new(target.x as f64, target.y as f64),
                }
            })
            .collect();

        let attempts = self.estimator.run(&pairs);
        counts.attempts = attempts.iter().map(attempt_trace).collect();
        for trace in &counts.attempts {
            tracing::debug!(
                threshold = trace.threshold,
                inliers = trace.inliers,
                converged = trace.converged,
                "ransac attempt"
            );
        }

        let best_homography = select_best(&attempts).and_then(|i| {
            counts.inliers = attempts[i].inlier_count();
            attempts[i].homography
        });
        let Some(normalized_h) = best_homography else {
            let reason = FallbackReason::EstimationFailed { good_matches: matches.len() };
            return Ok(self.fall_back(input, counts, None, reason));
        };

        // The fit lives in normalized coordinates; undo both normalization
        // scales so the warp maps the full-resolution input into the
        // template's original frame.
        let full_h = Homography::scaling(1.0 / template.scale)
            .compose(&normalized_h)
            .compose(&Homography::scaling(input_scale));

        let warped = match warp_perspective(
            input,
            &full_h,
            template.image.width(),
            template.image.height(),
        ) {
            Ok(warped) => warped,
            Err(error) => {
                tracing::warn!(%error, "warp failed after estimation");
                let reason = FallbackReason::EstimationFailed { good_matches: matches.len() };
                return Ok(self.fall_back(input, counts, None, reason));
            }
        };

        let metrics =
            self.scorer.score(counts.good_matches, counts.inliers, &imaging::to_luma(&warped));

        if let Some(rejection) = metrics.rejection.clone() {
            return Ok(self.fall_back(
                input,
                counts,
                Some(metrics),
                FallbackReason::QualityRejected(rejection),
            ));
        }

        let image = if self.config.pipeline.crop_black_padding {
            imaging::crop_black_padding(
                &warped,
                self.config.pipeline.crop_luma_threshold,
                self.config.pipeline.crop_margin,
            )
        } else {
            warped
        };

        tracing::info!(
            good_matches = counts.good_matches,
            inliers = counts.inliers,
            quality_score = metrics.quality_score,
            "alignment accepted"
        );

        let diagnostics = diagnostics(&counts, Some(&metrics), Decision::Aligned, None);
        Ok(Alignment { image, metrics: Some(metrics), reason: None, diagnostics })
    }

    fn fall_back(
        &self,
        input: &RgbImage,
        counts: StageCounts,
        metrics: Option<QualityMetrics>,
        reason: FallbackReason,
    ) -> Alignment {
        tracing::warn!(
            reason = %reason,
            features_base = counts.features_base,
            features_target = counts.features_target,
            good_matches = counts.good_matches,
            inliers = counts.inliers,
            "falling back to original image"
        );

        let diagnostics = diagnostics(&counts, metrics.as_ref(), Decision::Original, Some(&reason));
        Alignment { image: input.clone(), metrics, reason: Some(reason), diagnostics }
    }
}

fn attempt_trace(attempt: &RansacAttempt) -> AttemptTrace {
    AttemptTrace {
        threshold: attempt.config.threshold,
        max_iterations: attempt.config.max_iterations,
        confidence: attempt.config.confidence,
        converged: attempt.homography.is_some(),
        inliers: attempt.inlier_count(),
    }
}

fn diagnostics(
    counts: &StageCounts,
    metrics: Option<&QualityMetrics>,
    decision: Decision,
    reason: Option<&FallbackReason>,
) -> Diagnostics {
    Diagnostics {
        features_base: counts.features_base,
        features_target: counts.features_target,
        good_matches: counts.good_matches,
        inliers: counts.inliers,
        blur_score: metrics.map_or(0.0, |m| m.blur_score),
        brightness: metrics.map_or(0.0, |m| m.brightness),
        contrast: metrics.map_or(0.0, |m| m.contrast),
        quality_score: metrics.map_or(0, |m| m.quality_score),
        decision,
        reason: reason.map(|r| r.to_string()),
        attempts: counts.attempts.clone(),
    }
}

//! Acceptability scoring for a completed warp.
//!
//! Two stages: hard floors on the raw counts and the blur score, then a
//! tiered composite score. Very low raw counts are an unreliable basis for
//! any transform even when RANSAC nominally converged, so floor violations
//! reject unconditionally and the composite is only accumulated once the
//! floors pass. Tier boundaries and weights are policy data supplied through
//! configuration, not logic.

use crate::config::{ScoreTier, ScoringConfig};
use crate::imaging::{luma_stats, LumaStats};
use image::GrayImage;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct QualityMetrics {
    pub good_matches: usize,
    pub inliers: usize,
    pub blur_score: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub quality_score: u32,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<QualityRejection>,
}

/// Why an alignment was rejected by the scorer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum QualityRejection {
    BelowFloors {
        inliers: usize,
        min_inliers: usize,
        good_matches: usize,
        min_matches: usize,
        blur_score: f64,
        min_blur_score: f64,
    },
    BelowScore {
        score: u32,
        min_score: u32,
    },
}

impl fmt::Display for QualityRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityRejection::BelowFloors {
                inliers,
                min_inliers,
                good_matches,
                min_matches,
                blur_score,
                min_blur_score,
            } => {
                write!(f, "quality floors failed:")?;
                if inliers < min_inliers {
                    write!(f, " inliers={}<{}", inliers, min_inliers)?;
                }
                if good_matches < min_matches {
                    write!(f, " matches={}<{}", good_matches, min_matches)?;
                }
                if blur_score < min_blur_score {
                    write!(f, " blur={:.2}<{:.2}", blur_score, min_blur_score)?;
                }
                Ok(())
            }
            QualityRejection::BelowScore { score, min_score } => {
                write!(f, "quality score {}/100 below acceptance threshold {}", score, min_score)
            }
        }
    }
}

pub struct QualityScorer {
    config: ScoringConfig,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

impl QualityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Scores a warped luminance image together with the match and inlier
    /// counts that produced it.
    pub fn score(&self, good_matches: usize, inliers: usize, warped: &GrayImage) -> QualityMetrics {
        self.score_metrics(good_matches, inliers, luma_stats(warped))
    }

    pub fn score_metrics(
        &self,
        good_matches: usize,
        inliers: usize,
        stats: LumaStats,
    ) -> QualityMetrics {
        let config = &self.config;

        let floors_pass = inliers >= config.min_inliers
            && good_matches >= config.min_matches
            && stats.blur_score >= config.min_blur_score;

        if !floors_pass {
            return QualityMetrics {
                good_matches,
                inliers,
                blur_score: stats.blur_score,
                brightness: stats.brightness,
                contrast: stats.contrast,
                quality_score: 0,
                accepted: false,
                rejection: Some(QualityRejection::BelowFloors {
                    inliers,
                    min_inliers: config.min_inliers,
                    good_matches,
                    min_matches: config.min_matches,
                    blur_score: stats.blur_score,
                    min_blur_score: config.min_blur_score,
                }),
            };
        }

        let score = tier_points(&config.inlier_tiers, config.inlier_floor_points, inliers as f64)
            + tier_points(&config.match_tiers, config.match_floor_points, good_matches as f64)
            + tier_points(&config.blur_tiers, config.blur_floor_points, stats.blur_score);
        let score = score.min(100);

        let accepted = score >= config.min_total_score;
        QualityMetrics {
            good_matches,
            inliers,
            blur_score: stats.blur_score,
            brightness: stats.brightness,
            contrast: stats.contrast,
            quality_score: score,
            accepted,
            rejection: if accepted {
                None
            } else {
                Some(QualityRejection::BelowScore {
                    score,
                    min_score: config.min_total_score,
                })
            },
        }
    }
}

/// First tier whose threshold the value reaches wins; tables are ordered by
/// descending threshold.
fn tier_points(tiers: &[ScoreTier], floor_points: u32, value: f64) -> u32 {
    tiers
        .iter()
        .find(|tier| value >= tier.threshold)
        .map(|tier| tier.points)
        .unwrap_or(floor_points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sharp_stats(blur_score: f64) -> LumaStats {
        LumaStats { blur_score, brightness: 120.0, contrast: 60.0 }
    }

    #[test]
    fn tier_lookup_returns_first_matching_row() {
        let config = ScoringConfig::default();
        assert_eq!(tier_points(&config.inlier_tiers, config.inlier_floor_points, 130.0), 40);
        assert_eq!(tier_points(&config.inlier_tiers, config.inlier_floor_points, 60.0), 35);
        assert_eq!(tier_points(&config.inlier_tiers, config.inlier_floor_points, 41.0), 25);
        assert_eq!(tier_points(&config.inlier_tiers, config.inlier_floor_points, 25.0), 15);
        assert_eq!(tier_points(&config.inlier_tiers, config.inlier_floor_points, 24.0), 5);
    }

    #[test]
    fn floor_violation_rejects_unconditionally() {
        let scorer = QualityScorer::default();
        // Counts that would score far above the acceptance threshold, but a
        // blur score below its floor.
        let metrics = scorer.score_metrics(400, 150, sharp_stats(10.0));
        assert!(!metrics.accepted);
        assert_eq!(metrics.quality_score, 0);
        assert!(matches!(metrics.rejection, Some(QualityRejection::BelowFloors { .. })));
    }

    #[test]
    fn each_floor_flips_an_accepted_case() {
        let scorer = QualityScorer::default();
        let accepted = scorer.score_metrics(91, 54, sharp_stats(2294.19));
        assert!(accepted.accepted);

        let low_inliers = scorer.score_metrics(91, 24, sharp_stats(2294.19));
        assert!(!low_inliers.accepted);

        let low_matches = scorer.score_metrics(49, 54, sharp_stats(2294.19));
        assert!(!low_matches.accepted);

        let low_blur = scorer.score_metrics(91, 54, sharp_stats(49.9));
        assert!(!low_blur.accepted);
    }

    #[test]
    fn composite_below_threshold_rejects_with_score_reason() {
        let mut config = ScoringConfig::default();
        // Push the acceptance bar above what these counts can reach.
        config.min_total_score = 90;
        let scorer = QualityScorer::new(config);

        let metrics = scorer.score_metrics(60, 28, sharp_stats(2551.69));
        assert!(!metrics.accepted);
        assert!(metrics.quality_score > 0);
        assert!(matches!(metrics.rejection, Some(QualityRejection::BelowScore { .. })));
    }

    #[test]
    fn rejection_message_cites_the_failing_comparison() {
        let mut config = ScoringConfig::default();
        config.min_inliers = 30;
        let scorer = QualityScorer::new(config);

        let metrics = scorer.score_metrics(60, 28, sharp_stats(2551.69));
        let message = metrics.rejection.unwrap().to_string();
        assert!(message.contains("inliers=28<30"));
        assert!(!message.contains("matches="));
    }
}

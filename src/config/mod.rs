use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(Default)]
pub struct AlignmentConfig {
    pub detector: DetectorConfig,
    pub enhance: EnhanceConfig,
    pub matcher: MatcherConfig,
    pub ransac: RansacSettings,
    pub scoring: ScoringConfig,
    pub pipeline: PipelineConfig,
}

/// Keypoint detector parameters. Lowering `fast_threshold` and `edge_margin`
/// and raising `pyramid_levels` increases yield on documents with fine print
/// near the border, at a latency cost roughly linear in `max_features`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub max_features: usize,
    pub scale_step: f32,
    pub pyramid_levels: u32,
    pub edge_margin: u32,
    pub fast_threshold: u8,
    pub nms_radius: f32,
}

/// Pre-extraction enhancement. Equalization runs before smoothing and
/// sharpening so local contrast gains are not washed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhanceConfig {
    pub clahe_clip_limit: f32,
    pub clahe_tile_cols: u32,
    pub clahe_tile_rows: u32,
    pub bilateral_radius: u32,
    pub bilateral_sigma_color: f32,
    pub bilateral_sigma_space: f32,
    pub sharpen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub ratio_threshold: f32,
    pub outlier_stddev_multiplier: f32,
    pub lsh_tables: usize,
    pub lsh_key_bits: usize,
    pub lsh_probe_level: usize,
}

/// One entry of the RANSAC cascade: reprojection threshold in pixels,
/// iteration cap, and target confidence for the adaptive bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RansacAttemptConfig {
    pub threshold: f64,
    pub max_iterations: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RansacSettings {
    /// Ordered cascade, evaluated exhaustively; ties on inlier count keep
    /// the earlier entry.
    pub cascade: Vec<RansacAttemptConfig>,
    /// Seed for minimal-set sampling. None draws from the thread RNG.
    pub seed: Option<u64>,
}

/// One row of a scoring table: counts (or blur values) at or above
/// `threshold` are awarded `points`. Rows are checked in order, first hit
/// wins, so tables must be sorted by descending threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreTier {
    pub threshold: f64,
    pub points: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub min_inliers: usize,
    pub min_matches: usize,
    pub min_blur_score: f64,
    pub min_total_score: u32,
    pub inlier_tiers: Vec<ScoreTier>,
    pub inlier_floor_points: u32,
    pub match_tiers: Vec<ScoreTier>,
    pub match_floor_points: u32,
    pub blur_tiers: Vec<ScoreTier>,
    pub blur_floor_points: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Longer image side is scaled to this before extraction and matching.
    pub target_dimension: u32,
    pub crop_black_padding: bool,
    pub crop_luma_threshold: u8,
    pub crop_margin: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_features: 5000,
            scale_step: 1.2,
            pyramid_levels: 8,
            edge_margin: 31,
            fast_threshold: 20,
            nms_radius: 3.0,
        }
    }
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            clahe_clip_limit: 2.0,
            clahe_tile_cols: 8,
            clahe_tile_rows: 8,
            bilateral_radius: 2,
            bilateral_sigma_color: 25.0,
            bilateral_sigma_space: 3.0,
            sharpen: true,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            ratio_threshold: 0.70,
            outlier_stddev_multiplier: 2.0,
            lsh_tables: 6,
            lsh_key_bits: 12,
            lsh_probe_level: 1,
        }
    }
}

impl Default for RansacSettings {
    fn default() -> Self {
        Self {
            cascade: vec![
                RansacAttemptConfig { threshold: 5.0, max_iterations: 5000, confidence: 0.995 },
                RansacAttemptConfig { threshold: 3.0, max_iterations: 4000, confidence: 0.99 },
                RansacAttemptConfig { threshold: 7.0, max_iterations: 3000, confidence: 0.98 },
                RansacAttemptConfig { threshold: 2.0, max_iterations: 6000, confidence: 0.985 },
            ],
            seed: None,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_inliers: 25,
            min_matches: 50,
            min_blur_score: 50.0,
            min_total_score: 50,
            inlier_tiers: vec![
                ScoreTier { threshold: 100.0, points: 40 },
                ScoreTier { threshold: 60.0, points: 35 },
                ScoreTier { threshold: 40.0, points: 25 },
                ScoreTier { threshold: 25.0, points: 15 },
            ],
            inlier_floor_points: 5,
            match_tiers: vec![
                ScoreTier { threshold: 300.0, points: 30 },
                ScoreTier { threshold: 150.0, points: 25 },
                ScoreTier { threshold: 80.0, points: 20 },
                ScoreTier { threshold: 50.0, points: 12 },
            ],
            match_floor_points: 5,
            blur_tiers: vec![
                ScoreTier { threshold: 300.0, points: 30 },
                ScoreTier { threshold: 200.0, points: 25 },
                ScoreTier { threshold: 100.0, points: 15 },
            ],
            blur_floor_points: 10,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_dimension: 800,
            crop_black_padding: true,
            crop_luma_threshold: 10,
            crop_margin: 2,
        }
    }
}

impl AlignmentConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path)?;

        if content.trim_start().starts_with('{') {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(toml::from_str(&content)?)
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P, format: ConfigFormat) -> crate::Result<()> {
        let content = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
        };

        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.detector.max_features == 0 {
            errors.push("detector max_features must be positive".to_string());
        }

        if self.detector.scale_step <= 1.0 {
            errors.push("detector scale_step must be greater than 1.0".to_string());
        }

        if self.detector.pyramid_levels == 0 {
            errors.push("detector pyramid_levels must be positive".to_string());
        }

        if !(0.0..1.0).contains(&self.matcher.ratio_threshold) {
            errors.push("matcher ratio_threshold must be in (0, 1)".to_string());
        }

        if self.matcher.outlier_stddev_multiplier <= 0.0 {
            errors.push("matcher outlier_stddev_multiplier must be positive".to_string());
        }

        if self.matcher.lsh_key_bits == 0 || self.matcher.lsh_key_bits > 30 {
            errors.push("matcher lsh_key_bits must be in 1..=30".to_string());
        }

        if self.ransac.cascade.is_empty() {
            errors.push("ransac cascade must contain at least one configuration".to_string());
        }

        for (i, attempt) in self.ransac.cascade.iter().enumerate() {
            if attempt.threshold <= 0.0 {
                errors.push(format!("ransac cascade[{}] threshold must be positive", i));
            }
            if attempt.max_iterations == 0 {
                errors.push(format!("ransac cascade[{}] max_iterations must be positive", i));
            }
            if !(0.0..1.0).contains(&attempt.confidence) {
                errors.push(format!("ransac cascade[{}] confidence must be in (0, 1)", i));
            }
        }

        if self.scoring.min_total_score > 100 {
            errors.push("scoring min_total_score must not exceed 100".to_string());
        }

        for (name, tiers) in [
            ("inlier_tiers", &self.scoring.inlier_tiers),
            ("match_tiers", &self.scoring.match_tiers),
            ("blur_tiers", &self.scoring.blur_tiers),
        ] {
            if tiers.windows(2).any(|w| w[0].threshold <= w[1].threshold) {
                errors.push(format!("scoring {} must be sorted by descending threshold", name));
            }
        }

        if self.pipeline.target_dimension < 100 {
            errors.push("pipeline target_dimension must be at least 100".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigFormat {
    Json,
    Toml,
}

pub fn load_config_or_default(config_path: Option<&str>) -> AlignmentConfig {
    match config_path {
        Some(path) => {
            match AlignmentConfig::load_from_file(path) {
                Ok(config) => {
                    if let Err(errors) = config.validate() {
                        eprintln!("Configuration validation errors:");
                        for error in errors {
                            eprintln!("  - {}", error);
                        }
                        eprintln!("Using default configuration instead.");
                        AlignmentConfig::default()
                    } else {
                        config
                    }
                }
                Err(e) => {
                    eprintln!("Failed to load config from '{}': {}", path, e);
                    eprintln!("Using default configuration.");
                    AlignmentConfig::default()
                }
            }
        }
        None => AlignmentConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AlignmentConfig::default().validate().is_ok());
    }

    #[test]
    fn cascade_defaults_match_documented_order() {
        let ransac = RansacSettings::default();
        let thresholds: Vec<f64> = ransac.cascade.iter().map(|c| c.threshold).collect();
        assert_eq!(thresholds, vec![5.0, 3.0, 7.0, 2.0]);
    }

    #[test]
    fn unsorted_tiers_are_rejected() {
        let mut config = AlignmentConfig::default();
        config.scoring.inlier_tiers.reverse();
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("inlier_tiers")));
    }

    #[test]
    fn empty_cascade_is_rejected() {
        let mut config = AlignmentConfig::default();
        config.ransac.cascade.clear();
        assert!(config.validate().is_err());
    }
}

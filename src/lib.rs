pub mod config;
pub mod features;
pub mod homography;
pub mod imaging;
pub mod logging;
pub mod matching;
pub mod pipeline;
pub mod quality;
pub mod templates;

pub use config::AlignmentConfig;
pub use features::{FeatureExtractor, FeatureSet, Keypoint};
pub use homography::{Homography, RansacAttempt, RansacEstimator};
pub use matching::{Correspondence, DescriptorMatcher};
pub use pipeline::{Alignment, AlignmentPipeline, Decision, Diagnostics, FallbackReason};
pub use quality::{QualityMetrics, QualityScorer};
pub use templates::{Template, TemplateStore};

pub type Result<T> = anyhow::Result<T>;

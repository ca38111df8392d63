//! Read-only catalogue of reference documents.
//!
//! A document-type label resolves to one reference image file under the
//! store root. Feature sets are computed on first access per label and
//! cached for the process lifetime; lookups are safe for concurrent readers
//! and a first-access race at worst recomputes the same pure result.

use crate::config::{AlignmentConfig, EnhanceConfig};
use crate::features::{FeatureExtractor, FeatureSet};
use crate::imaging;
use crate::imaging::enhance::enhance;
use crate::Result;
use anyhow::Context;
use image::RgbImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const TEMPLATE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// A reference document: the original image, the scale applied by size
/// normalization, and the features extracted from the enhanced normalized
/// luminance.
#[derive(Debug)]
pub struct Template {
    pub label: String,
    pub image: RgbImage,
    pub scale: f64,
    pub features: FeatureSet,
}

pub struct TemplateStore {
    root: PathBuf,
    extractor: FeatureExtractor,
    enhance: EnhanceConfig,
    target_dimension: u32,
    cache: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateStore {
    pub fn open<P: AsRef<Path>>(root: P, config: &AlignmentConfig) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            extractor: FeatureExtractor::new(config.detector.clone()),
            enhance: config.enhance.clone(),
            target_dimension: config.pipeline.target_dimension,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves a label to its cached template, computing features on first
    /// access. `Ok(None)` means the label is unknown, which callers treat as
    /// a recoverable fallback; an unreadable or undecodable template file is
    /// an error.
    pub fn get(&self, label: &str) -> Result<Option<Arc<Template>>> {
        if !valid_label(label) {
            return Ok(None);
        }

        if let Some(template) = self.cache.read().expect("template cache poisoned").get(label) {
            return Ok(Some(Arc::clone(template)));
        }

        let Some(path) = self.resolve(label) else {
            return Ok(None);
        };

        let template = Arc::new(self.load(label, &path)?);

        let mut cache = self.cache.write().expect("template cache poisoned");
        let entry = cache.entry(label.to_string()).or_insert_with(|| Arc::clone(&template));
        Ok(Some(Arc::clone(entry)))
    }

    /// Labels available on disk, sorted. Cached entries do not affect the
    /// listing.
    pub fn labels(&self) -> Result<Vec<String>> {
        let mut labels = Vec::new();
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("cannot read template directory {}", self.root.display()))?;

        for entry in entries {
            let path = entry?.path();
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if !TEMPLATE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                labels.push(stem.to_string());
            }
        }

        labels.sort();
        labels.dedup();
        Ok(labels)
    }

    fn resolve(&self, label: &str) -> Option<PathBuf> {
        TEMPLATE_EXTENSIONS
            .iter()
            .map(|ext| self.root.join(format!("{}.{}", label, ext)))
            .find(|path| path.is_file())
    }

    fn load(&self, label: &str, path: &Path) -> Result<Template> {
        let image = image::open(path)
            .with_context(|| format!("cannot decode template image {}", path.display()))?
            .to_rgb8();

        let (normalized, scale) = imaging::normalize_size(&image, self.target_dimension);
        let luma = enhance(&imaging::to_luma(&normalized), &self.enhance);
        let features = self.extractor.extract(&luma);

        log::debug!(
            "template '{}' loaded: {}x{}, scale {:.3}, {} features",
            label,
            image.width(),
            image.height(),
            scale,
            features.len()
        );

        Ok(Template { label: label.to_string(), image, scale, features })
    }
}

/// Labels come from an external detector; only plain identifier-style names
/// map to files.
fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_like_labels_are_rejected() {
        assert!(valid_label("cccd_qr_front"));
        assert!(valid_label("passport-2025"));
        assert!(!valid_label(""));
        assert!(!valid_label("../secrets"));
        assert!(!valid_label("a/b"));
    }
}

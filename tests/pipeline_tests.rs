use card_alignment::config::AlignmentConfig;
use card_alignment::pipeline::{AlignmentPipeline, Decision, FallbackReason};
use card_alignment::TemplateStore;
use image::{Rgb, RgbImage};
use std::sync::Arc;
use tempfile::TempDir;

fn noise_pixel(x: u32, y: u32, salt: u32) -> u8 {
    let h = (x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA77) ^ salt.wrapping_mul(0xC2B2_AE3D))
        .wrapping_mul(0x27D4_EB2F);
    (h >> 24) as u8
}

fn textured_image(width: u32, height: u32, salt: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let v = noise_pixel(x, y, salt);
        Rgb([v, v.wrapping_add(40), v.wrapping_add(90)])
    })
}

fn test_config() -> AlignmentConfig {
    let mut config = AlignmentConfig::default();
    config.pipeline.target_dimension = 256;
    config.pipeline.crop_black_padding = false;
    config.detector.max_features = 1200;
    config.ransac.seed = Some(9);
    config
}

/// Store backed by a temp directory holding one textured template.
fn pipeline_with_template(config: AlignmentConfig) -> (TempDir, AlignmentPipeline, RgbImage) {
    let dir = TempDir::new().unwrap();
    let template = textured_image(320, 200, 1);
    template.save(dir.path().join("cccd_qr_front.png")).unwrap();

    let store = Arc::new(TemplateStore::open(dir.path(), &config));
    let pipeline = AlignmentPipeline::new(store, config);
    (dir, pipeline, template)
}

#[test]
fn matching_input_is_aligned_into_the_template_frame() {
    let (_dir, pipeline, template) = pipeline_with_template(test_config());

    let alignment = pipeline.align(&template, "cccd_qr_front").unwrap();

    assert!(alignment.is_aligned(), "reason: {:?}", alignment.reason);
    assert_eq!(alignment.image.dimensions(), template.dimensions());
    assert!(alignment.reason.is_none());

    let diagnostics = &alignment.diagnostics;
    assert!(diagnostics.good_matches >= 50);
    assert!(diagnostics.inliers >= 25);
    assert!(diagnostics.quality_score >= 50);
    assert!(diagnostics.blur_score >= 50.0);
    assert_eq!(diagnostics.attempts.len(), 4);

    // The winner dominates every cascade entry.
    let best = diagnostics.inliers;
    assert!(diagnostics.attempts.iter().all(|a| a.inliers <= best));
}

#[test]
fn unknown_label_returns_the_original_untouched() {
    let (_dir, pipeline, _template) = pipeline_with_template(test_config());
    let input = textured_image(300, 180, 77);

    let alignment = pipeline.align(&input, "passport").unwrap();

    assert_eq!(alignment.diagnostics.decision, Decision::Original);
    assert_eq!(alignment.reason, Some(FallbackReason::NoTemplate));
    assert_eq!(alignment.diagnostics.reason.as_deref(), Some("no template"));
    // No template was touched, so no template features were computed.
    assert_eq!(alignment.diagnostics.features_base, 0);
    assert_eq!(alignment.diagnostics.features_target, 0);
    assert_eq!(alignment.image.as_raw(), input.as_raw());
}

#[test]
fn featureless_input_falls_back_with_a_reason() {
    let (_dir, pipeline, _template) = pipeline_with_template(test_config());
    let input = RgbImage::from_pixel(320, 200, Rgb([120, 120, 120]));

    let alignment = pipeline.align(&input, "cccd_qr_front").unwrap();

    assert_eq!(alignment.diagnostics.decision, Decision::Original);
    assert_eq!(alignment.reason, Some(FallbackReason::NoInputFeatures));
    assert!(alignment.diagnostics.features_base > 0);
    assert_eq!(alignment.diagnostics.features_target, 0);
    assert_eq!(alignment.image.as_raw(), input.as_raw());
}

#[test]
fn too_few_correspondences_short_circuit_before_scoring() {
    // Starve the detector so at most three correspondences can exist: the
    // estimator must give up without a transform and the scorer must never
    // run on a warped image.
    let mut config = test_config();
    config.detector.max_features = 3;
    let (_dir, pipeline, template) = pipeline_with_template(config);

    let alignment = pipeline.align(&template, "cccd_qr_front").unwrap();

    assert_eq!(alignment.diagnostics.decision, Decision::Original);
    assert!(alignment.diagnostics.good_matches < 4);
    assert!(alignment.metrics.is_none());
    assert_eq!(alignment.diagnostics.blur_score, 0.0);
    assert_eq!(alignment.diagnostics.attempts.len(), 4);
    assert!(alignment.diagnostics.attempts.iter().all(|a| !a.converged));
    assert_eq!(alignment.image.as_raw(), template.as_raw());

    match alignment.reason {
        Some(FallbackReason::EstimationFailed { good_matches }) => assert!(good_matches < 4),
        Some(FallbackReason::NoCorrespondences) => {}
        other => panic!("unexpected fallback reason: {:?}", other),
    }
}

#[test]
fn unrelated_input_is_never_accepted() {
    let (_dir, pipeline, _template) = pipeline_with_template(test_config());
    let input = textured_image(320, 200, 0xDEAD_BEEF);

    let alignment = pipeline.align(&input, "cccd_qr_front").unwrap();

    assert_eq!(alignment.diagnostics.decision, Decision::Original);
    assert!(alignment.reason.is_some());
    assert_eq!(alignment.image.as_raw(), input.as_raw());
}

#[test]
fn alignment_is_idempotent_for_identical_bytes() {
    let (_dir, pipeline, template) = pipeline_with_template(test_config());

    let first = pipeline.align(&template, "cccd_qr_front").unwrap();
    let second = pipeline.align(&template, "cccd_qr_front").unwrap();

    assert_eq!(first.image.as_raw(), second.image.as_raw());
    assert_eq!(
        serde_json::to_string(&first.diagnostics).unwrap(),
        serde_json::to_string(&second.diagnostics).unwrap()
    );
}

#[test]
fn diagnostics_serialize_with_the_external_field_contract() {
    let (_dir, pipeline, template) = pipeline_with_template(test_config());

    let aligned = pipeline.align(&template, "cccd_qr_front").unwrap();
    let value = serde_json::to_value(&aligned.diagnostics).unwrap();
    assert_eq!(value["decision"], "aligned");
    assert!(value.get("reason").is_none());
    for field in
        ["features_base", "features_target", "good_matches", "inliers", "blur_score", "quality_score"]
    {
        assert!(value.get(field).is_some(), "missing diagnostics field {}", field);
    }

    let fallback = pipeline.align(&template, "missing-label").unwrap();
    let value = serde_json::to_value(&fallback.diagnostics).unwrap();
    assert_eq!(value["decision"], "original");
    assert_eq!(value["reason"], "no template");
}

#[test]
fn cascade_trace_reports_the_configured_thresholds_in_order() {
    let (_dir, pipeline, template) = pipeline_with_template(test_config());

    let alignment = pipeline.align(&template, "cccd_qr_front").unwrap();
    let thresholds: Vec<f64> =
        alignment.diagnostics.attempts.iter().map(|a| a.threshold).collect();
    assert_eq!(thresholds, vec![5.0, 3.0, 7.0, 2.0]);
}

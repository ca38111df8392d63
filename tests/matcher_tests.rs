use card_alignment::config::MatcherConfig;
use card_alignment::{DescriptorMatcher, FeatureExtractor};
use image::{GrayImage, Luma};

fn noise_image(width: u32, height: u32, salt: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let v = x
            .wrapping_mul(73)
            .wrapping_add(y.wrapping_mul(151))
            .wrapping_add(salt)
            .wrapping_mul(2654435761)
            >> 24;
        Luma([v as u8])
    })
}

#[test]
fn matching_identical_images_finds_strong_correspondences() {
    let image = noise_image(256, 256, 11);
    let features = FeatureExtractor::default().extract(&image);
    assert!(features.len() > 100);

    let matches = DescriptorMatcher::default().match_features(&features, &features);

    assert!(!matches.is_empty());
    assert!(matches.len() <= features.len());
    // Every keypoint's best candidate in an identical set is itself.
    for m in &matches {
        assert_eq!(m.input_idx, m.template_idx);
        assert_eq!(m.distance, 0);
    }
}

#[test]
fn output_is_bounded_by_the_smaller_side() {
    let big = FeatureExtractor::default().extract(&noise_image(256, 256, 12));
    let small_image = noise_image(96, 96, 12);
    let small = FeatureExtractor::default().extract(&small_image);

    let matcher = DescriptorMatcher::default();
    let matches = matcher.match_features(&big, &small);
    assert!(matches.len() <= big.len().min(small.len()));

    let matches = matcher.match_features(&small, &big);
    assert!(matches.len() <= big.len().min(small.len()));
}

#[test]
fn retained_distances_respect_the_statistical_cutoff() {
    let input = FeatureExtractor::default().extract(&noise_image(200, 200, 13));
    let template = FeatureExtractor::default().extract(&noise_image(200, 200, 14));

    let config = MatcherConfig::default();
    let multiplier = config.outlier_stddev_multiplier as f64;
    let matches = DescriptorMatcher::new(config).match_features(&input, &template);

    if matches.len() >= 2 {
        // The cutoff was computed over the ratio-test survivors; the
        // retained set must sit below its own mean + k·sigma as well.
        let n = matches.len() as f64;
        let mean = matches.iter().map(|m| m.distance as f64).sum::<f64>() / n;
        let var =
            matches.iter().map(|m| (m.distance as f64 - mean).powi(2)).sum::<f64>() / n;
        let cutoff = mean + multiplier * var.sqrt();
        assert!(matches.iter().all(|m| m.distance as f64 <= cutoff + 1e-9));
    }
}

#[test]
fn unrelated_textures_produce_few_or_no_matches() {
    let a = FeatureExtractor::default().extract(&noise_image(220, 220, 21));
    let b = FeatureExtractor::default().extract(&noise_image(220, 220, 987_654));

    let matches = DescriptorMatcher::default().match_features(&a, &b);
    // Distinct noise fields share no structure; the ratio test should strip
    // almost everything.
    assert!(matches.len() < a.len() / 10);
}

#[test]
fn each_input_keypoint_matches_at_most_once() {
    let input = FeatureExtractor::default().extract(&noise_image(160, 160, 31));
    let template = FeatureExtractor::default().extract(&noise_image(160, 160, 31));

    let matches = DescriptorMatcher::default().match_features(&input, &template);
    let mut seen = std::collections::HashSet::new();
    for m in &matches {
        assert!(seen.insert(m.input_idx), "input index {} matched twice", m.input_idx);
        assert!(m.template_idx < template.len());
    }
}

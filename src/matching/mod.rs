//! Approximate nearest-neighbor matching of binary descriptors.
//!
//! For every input descriptor the matcher retrieves its two best template
//! candidates from a multi-probe LSH index, keeps the pair only if it passes
//! the Lowe distinctiveness test, and finally drops the long tail of
//! low-confidence survivors with a mean + k·sigma distance cutoff.

use crate::config::MatcherConfig;
use crate::features::{hamming_distance, Descriptor, FeatureSet};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::HashMap;

/// Index construction must not vary between runs, so the hash tables draw
/// their bit positions from a fixed seed rather than process entropy.
const LSH_TABLE_SEED: u64 = 0x6c73_6864_6f63;

/// A matched descriptor pair: indices into the input and template feature
/// sets plus their Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correspondence {
    pub input_idx: usize,
    pub template_idx: usize,
    pub distance: u32,
}

pub struct DescriptorMatcher {
    config: MatcherConfig,
}

impl Default for DescriptorMatcher {
    fn default() -> Self {
        Self::new(MatcherConfig::default())
    }
}

impl DescriptorMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Produces at most one correspondence per keypoint on either side, so
    /// the output never exceeds the smaller feature set. An empty result is
    /// a valid outcome, not an error.
    pub fn match_features(&self, input: &FeatureSet, template: &FeatureSet) -> Vec<Correspondence> {
        if input.is_empty() || template.len() < 2 {
            return Vec::new();
        }

        let index = LshIndex::build(&template.descriptors, &self.config);
        let ratio = self.config.ratio_threshold;

        let mut survivors: Vec<Correspondence> = input
            .descriptors
            .par_iter()
            .enumerate()
            .filter_map(|(input_idx, descriptor)| {
                let (best_idx, best, second) =
                    index.two_nearest(descriptor, &template.descriptors)?;

                // Distinctiveness: the winner must be markedly closer than
                // the runner-up, and a zero runner-up makes the pair
                // ambiguous by definition.
                if second == 0 || (best as f32) >= ratio * second as f32 {
                    return None;
                }

                Some(Correspondence { input_idx, template_idx: best_idx, distance: best })
            })
            .collect();

        // One winner per template keypoint as well: when several inputs
        // collapse onto the same template index, keep the closest pair.
        survivors.sort_unstable_by_key(|m| (m.template_idx, m.distance, m.input_idx));
        survivors.dedup_by_key(|m| m.template_idx);
        survivors.sort_unstable_by_key(|m| m.input_idx);

        self.filter_outliers(survivors)
    }

    /// Drops survivors whose distance exceeds mean + multiplier·sigma of the
    /// surviving distances.
    fn filter_outliers(&self, matches: Vec<Correspondence>) -> Vec<Correspondence> {
        if matches.len() < 2 {
            return matches;
        }

        let n = matches.len() as f64;
        let mean = matches.iter().map(|m| m.distance as f64).sum::<f64>() / n;
        let variance =
            matches.iter().map(|m| (m.distance as f64 - mean).powi(2)).sum::<f64>() / n;
        let cutoff = mean + self.config.outlier_stddev_multiplier as f64 * variance.sqrt();

        matches
            .into_iter()
            .filter(|m| m.distance as f64 <= cutoff)
            .collect()
    }
}

struct LshTable {
    bit_positions: Vec<u16>,
    buckets: HashMap<u32, Vec<u32>>,
}

impl LshTable {
    fn key(&self, descriptor: &Descriptor) -> u32 {
        let mut key = 0u32;
        for (i, &bit) in self.bit_positions.iter().enumerate() {
            let byte = descriptor[(bit / 8) as usize];
            if byte >> (bit % 8) & 1 == 1 {
                key |= 1 << i;
            }
        }
        key
    }
}

/// Multi-probe LSH over 256-bit descriptors: `tables` hash tables keyed by
/// `key_bits` sampled bit positions, each query probing the exact bucket
/// plus every single-bit-flip neighbor per probe level.
struct LshIndex {
    tables: Vec<LshTable>,
    key_bits: usize,
    probe_level: usize,
}

impl LshIndex {
    fn build(descriptors: &[Descriptor], config: &MatcherConfig) -> Self {
        let key_bits = config.lsh_key_bits.clamp(1, 30);
        let tables = (0..config.lsh_tables.max(1))
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(LSH_TABLE_SEED.wrapping_add(t as u64));
                let bit_positions: Vec<u16> =
                    rand::seq::index::sample(&mut rng, 256, key_bits.min(256))
                        .into_iter()
                        .map(|i| i as u16)
                        .collect();

                let mut table = LshTable { bit_positions, buckets: HashMap::new() };
                for (i, descriptor) in descriptors.iter().enumerate() {
                    let key = table.key(descriptor);
                    table.buckets.entry(key).or_default().push(i as u32);
                }
                table
            })
            .collect();

        Self { tables, key_bits, probe_level: config.lsh_probe_level }
    }

    /// Two nearest template descriptors by Hamming distance, approximated by
    /// the probed candidate set. Falls back to a linear scan when probing
    /// surfaces fewer than two candidates, so the ratio test always sees a
    /// genuine runner-up.
    fn two_nearest(
        &self,
        descriptor: &Descriptor,
        descriptors: &[Descriptor],
    ) -> Option<(usize, u32, u32)> {
        let mut seen = vec![false; descriptors.len()];
        let mut candidates = 0usize;
        let mut nearest = TwoNearest::default();

        for table in &self.tables {
            let key = table.key(descriptor);
            let mut probe = |k: u32| {
                if let Some(bucket) = table.buckets.get(&k) {
                    for &idx in bucket {
                        let idx = idx as usize;
                        if !seen[idx] {
                            seen[idx] = true;
                            candidates += 1;
                            nearest.consider(idx, hamming_distance(descriptor, &descriptors[idx]));
                        }
                    }
                }
            };

            probe(key);
            if self.probe_level > 0 {
                for bit in 0..self.key_bits {
                    probe(key ^ (1 << bit));
                }
            }
        }

        if candidates < 2 {
            nearest = TwoNearest::default();
            for (idx, other) in descriptors.iter().enumerate() {
                nearest.consider(idx, hamming_distance(descriptor, other));
            }
        }

        if nearest.best_idx == usize::MAX || nearest.second == u32::MAX {
            return None;
        }

        Some((nearest.best_idx, nearest.best, nearest.second))
    }
}

struct TwoNearest {
    best_idx: usize,
    best: u32,
    second: u32,
}

impl Default for TwoNearest {
    fn default() -> Self {
        Self { best_idx: usize::MAX, best: u32::MAX, second: u32::MAX }
    }
}

impl TwoNearest {
    fn consider(&mut self, idx: usize, distance: u32) {
        if distance < self.best {
            self.second = self.best;
            self.best = distance;
            self.best_idx = idx;
        } else if distance < self.second {
            self.second = distance;
        }
    }
}

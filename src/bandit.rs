// src/bandit.rs
// Multi-armed-bandit variant selection for multi-target redirects.
// Thompson Sampling draws from each variant's Beta posterior; Gamma deviates
// come from Marsaglia-Tsang rejection sampling with Box-Muller normals.

use rand::Rng;

use crate::rules::{MabAlgorithm, Variant};

const EPSILON: f64 = 0.1;
const MIN_SHAPE: f64 = 1e-6;

/// Pick one variant index. Returns None for fewer than two variants; the
/// ingest validation should have already rejected such rules.
pub fn select_variant<R: Rng>(
    variants: &[Variant],
    algorithm: MabAlgorithm,
    rng: &mut R,
) -> Option<usize> {
    if variants.len() < 2 {
        return None;
    }
    let index = match algorithm {
        MabAlgorithm::ThompsonSampling => pick_thompson(variants, rng),
        MabAlgorithm::Ucb => pick_ucb(variants),
        MabAlgorithm::EpsilonGreedy => pick_epsilon_greedy(variants, rng),
    };
    Some(index)
}

fn pick_thompson<R: Rng>(variants: &[Variant], rng: &mut R) -> usize {
    argmax(variants.iter().map(|v| sample_beta(rng, v.alpha, v.beta)))
}

/// Upper Confidence Bound. A variant with zero impressions wins immediately
/// (forced exploration).
fn pick_ucb(variants: &[Variant]) -> usize {
    if let Some(unexplored) = variants.iter().position(|v| v.impressions == 0) {
        return unexplored;
    }
    let total: u64 = variants.iter().map(|v| v.impressions).sum();
    argmax(variants.iter().map(|v| {
        let impressions = v.impressions as f64;
        let exploit = v.conversions as f64 / impressions;
        let explore = (2.0 * (total as f64).ln() / impressions).sqrt();
        exploit + explore
    }))
}

fn pick_epsilon_greedy<R: Rng>(variants: &[Variant], rng: &mut R) -> usize {
    if rng.gen::<f64>() < EPSILON {
        return rng.gen_range(0..variants.len());
    }
    if let Some(unexplored) = variants.iter().position(|v| v.impressions == 0) {
        return unexplored;
    }
    argmax(
        variants
            .iter()
            .map(|v| v.conversions as f64 / v.impressions as f64),
    )
}

fn argmax(scores: impl Iterator<Item = f64>) -> usize {
    let mut best = 0;
    let mut best_score = f64::NEG_INFINITY;
    for (index, score) in scores.enumerate() {
        if score > best_score {
            best = index;
            best_score = score;
        }
    }
    best
}

/// Beta(alpha, beta) via two Gamma draws.
fn sample_beta<R: Rng>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    let x = sample_gamma(rng, alpha.max(MIN_SHAPE));
    let y = sample_gamma(rng, beta.max(MIN_SHAPE));
    if x + y == 0.0 {
        return 0.5;
    }
    x / (x + y)
}

/// Gamma(shape, 1) by Marsaglia-Tsang. For shape < 1, draw at shape + 1 and
/// scale by U^(1/shape).
fn sample_gamma<R: Rng>(rng: &mut R, shape: f64) -> f64 {
    if shape < 1.0 {
        let u: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
        return sample_gamma(rng, shape + 1.0) * u.powf(1.0 / shape);
    }
    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    loop {
        let x = sample_standard_normal(rng);
        let v = (1.0 + c * x).powi(3);
        if v <= 0.0 {
            continue;
        }
        let u: f64 = rng.gen();
        if u < 1.0 - 0.0331 * x.powi(4) {
            return d * v;
        }
        if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}

/// Standard normal deviate via Box-Muller.
fn sample_standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

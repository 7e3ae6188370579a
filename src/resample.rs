//! Direction selection for dead-feature resampling
//!
//! New directions come from the residual `input - reconstruction` of the
//! current batch, so resampled features start out pointing at variance the
//! dictionary does not explain yet. All vectors returned here are unit norm.
//!
//! Runs on host `Vec<f32>` data: resampling happens every few hundred steps
//! on a handful of rows, far off the hot path.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::config::ResampleStrategy;

/// Below this norm a vector is treated as degenerate.
const MIN_NORM: f32 = 1e-6;

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn normalized(v: &[f32]) -> Option<Vec<f32>> {
    let norm = l2_norm(v);
    if norm.is_finite() && norm > MIN_NORM {
        Some(v.iter().map(|x| x / norm).collect())
    } else {
        None
    }
}

/// Isotropic random unit vector (Box-Muller). Empty when `dim == 0`.
pub fn random_unit<R: Rng>(dim: usize, rng: &mut R) -> Vec<f32> {
    if dim == 0 {
        return Vec::new();
    }
    loop {
        let v: Vec<f32> = (0..dim)
            .map(|_| {
                let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                let u2: f32 = rng.gen();
                (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
            })
            .collect();
        if let Some(unit) = normalized(&v) {
            return unit;
        }
    }
}

/// Sample `n` residual rows with probability proportional to their squared
/// norm and normalize them. Rows are drawn without replacement until every
/// row with nonzero weight has been used.
///
/// Falls back to random `dim`-wide directions once no weighted row is left.
pub fn sample_residual_directions<R: Rng>(
    residuals: &[Vec<f32>],
    dim: usize,
    n: usize,
    rng: &mut R,
) -> Vec<Vec<f32>> {
    let weights: Vec<f32> = residuals
        .iter()
        .map(|r| {
            let sq = r.iter().map(|x| x * x).sum::<f32>();
            if sq.is_finite() {
                sq
            } else {
                0.0
            }
        })
        .collect();

    let mut remaining = weights.iter().filter(|w| **w > 0.0).count();
    let mut dist = WeightedIndex::new(&weights).ok();
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let Some(d) = dist.as_mut() else {
            out.push(random_unit(dim, rng));
            continue;
        };
        let idx = d.sample(rng);
        remaining -= 1;
        if remaining == 0 || d.update_weights(&[(idx, &0.0)]).is_err() {
            dist = None;
        }
        out.push(normalized(&residuals[idx]).unwrap_or_else(|| random_unit(dim, rng)));
    }
    out
}

/// Orthonormalize `candidates` against `basis` and against each other.
///
/// `basis` rows need not be orthogonal; they are orthonormalized first.
/// A candidate that collapses (its span is already covered) keeps its own
/// normalized direction instead.
pub fn gram_schmidt(candidates: &[Vec<f32>], basis: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let mut q: Vec<Vec<f32>> = Vec::with_capacity(basis.len() + candidates.len());
    for b in basis {
        if let Some(u) = normalized(&project_out(b, &q)) {
            q.push(u);
        }
    }
    let mut out = Vec::with_capacity(candidates.len());
    for c in candidates {
        match normalized(&project_out(c, &q)) {
            Some(u) => {
                q.push(u.clone());
                out.push(u);
            }
            None => out.push(normalized(c).unwrap_or_else(|| c.clone())),
        }
    }
    out
}

fn project_out(v: &[f32], q: &[Vec<f32>]) -> Vec<f32> {
    let mut r = v.to_vec();
    for u in q {
        let dot: f32 = r.iter().zip(u).map(|(a, b)| a * b).sum();
        for (ri, ui) in r.iter_mut().zip(u) {
            *ri -= dot * ui;
        }
    }
    r
}

/// Pick one unit direction of width `dim` per feature in `targets`.
///
/// * `decoder_rows` - current decoder rows, `(dict_size, act_size)`
/// * `frequencies` - current activation rate per feature, used by
///   `GramSchmidt` to find the most-used directions
pub fn choose_directions<R: Rng>(
    strategy: ResampleStrategy,
    residuals: &[Vec<f32>],
    dim: usize,
    targets: &[usize],
    decoder_rows: &[Vec<f32>],
    frequencies: &[f32],
    rng: &mut R,
) -> Vec<Vec<f32>> {
    let sampled = sample_residual_directions(residuals, dim, targets.len(), rng);
    match strategy {
        ResampleStrategy::ResidualSampling => sampled,
        ResampleStrategy::GramSchmidt { trail } => {
            let mut ranked: Vec<usize> = (0..decoder_rows.len())
                .filter(|f| !targets.contains(f))
                .collect();
            ranked.sort_by(|a, b| {
                frequencies[*b]
                    .partial_cmp(&frequencies[*a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let basis: Vec<Vec<f32>> = ranked
                .into_iter()
                .take(trail)
                .map(|f| decoder_rows[f].clone())
                .collect();
            gram_schmidt(&sampled, &basis)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(0)
    }

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_sampling_prefers_large_residuals() {
        let residuals = vec![vec![0.0, 0.0, 0.0], vec![0.0, 5.0, 0.0], vec![0.0, 0.0, 0.0]];
        for seed in 0..8 {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let dirs = sample_residual_directions(&residuals, 3, 1, &mut rng);
            assert_eq!(dirs, vec![vec![0.0, 1.0, 0.0]]);
        }
    }

    #[test]
    fn test_sampling_without_replacement() {
        let residuals = vec![
            vec![2.0, 0.0, 0.0],
            vec![0.0, 3.0, 0.0],
            vec![0.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ];
        let dirs = sample_residual_directions(&residuals, 3, 5, &mut rng());
        let mut firsts: Vec<Vec<f32>> = dirs[..3].to_vec();
        firsts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(
            firsts,
            vec![
                vec![0.0, 0.0, 1.0],
                vec![0.0, 1.0, 0.0],
                vec![1.0, 0.0, 0.0],
            ]
        );
        // Weighted rows used up: the rest are random unit vectors
        for d in &dirs[3..] {
            assert!((l2_norm(d) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_empty_residuals_give_requested_width() {
        let dirs = sample_residual_directions(&[], 6, 3, &mut rng());
        assert_eq!(dirs.len(), 3);
        for d in &dirs {
            assert_eq!(d.len(), 6);
            assert!((l2_norm(d) - 1.0).abs() < 1e-5);
        }
        assert!(random_unit(0, &mut rng()).is_empty());
    }

    #[test]
    fn test_zero_residuals_fall_back_to_random_units() {
        let residuals = vec![vec![0.0; 8]; 3];
        let dirs = sample_residual_directions(&residuals, 8, 2, &mut rng());
        assert_eq!(dirs.len(), 2);
        for d in &dirs {
            assert!((l2_norm(d) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gram_schmidt_orthonormal() {
        let basis = vec![vec![1.0, 0.0, 0.0], vec![1.0, 1.0, 0.0]];
        let cands = vec![vec![1.0, 1.0, 1.0]];
        let out = gram_schmidt(&cands, &basis);
        assert_eq!(out.len(), 1);
        assert!((l2_norm(&out[0]) - 1.0).abs() < 1e-5);
        assert!(dot(&out[0], &basis[0]).abs() < 1e-5);
        assert!(dot(&out[0], &basis[1]).abs() < 1e-5);
    }

    #[test]
    fn test_gram_schmidt_exhausted_span_keeps_unit_norm() {
        let basis = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let cands = vec![vec![3.0, 4.0]];
        let out = gram_schmidt(&cands, &basis);
        assert!((out[0][0] - 0.6).abs() < 1e-6);
        assert!((out[0][1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_choose_directions_gram_schmidt_avoids_targets() {
        let decoder = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]];
        let freqs = vec![0.5, 0.0, 0.1];
        let residuals = vec![vec![1.0, 1.0, 1.0]];
        let dirs = choose_directions(
            ResampleStrategy::GramSchmidt { trail: 1 },
            &residuals,
            3,
            &[1],
            &decoder,
            &freqs,
            &mut rng(),
        );
        // Orthogonal to the most used alive row (feature 0) only
        assert!(dot(&dirs[0], &decoder[0]).abs() < 1e-5);
        assert!((l2_norm(&dirs[0]) - 1.0).abs() < 1e-5);
        assert!(dirs[0][1] > 0.0 && dirs[0][2] > 0.0);
    }
}

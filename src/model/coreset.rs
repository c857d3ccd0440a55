//! Greedy k-center coreset selection
//!
//! Picks a subset of patch embeddings that covers the full set: each step adds
//! the embedding farthest from everything chosen so far. Distances are taken
//! in a sparse random projection of the embeddings to keep each step cheap.

use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::debug;

/// Coreset selection parameters
#[derive(Debug, Clone)]
pub struct CoresetSampler {
    /// Fraction of the candidates to keep
    pub ratio: f64,
    /// Target dimension of the random projection
    pub projection_dim: usize,
    /// Candidates are uniformly subsampled to at most this many rows first
    pub max_candidates: usize,
    pub seed: u64,
}

impl Default for CoresetSampler {
    fn default() -> Self {
        Self {
            ratio: 0.1,
            projection_dim: 128,
            max_candidates: 20_000,
            seed: 42,
        }
    }
}

impl CoresetSampler {
    pub fn new(ratio: f64, seed: u64) -> Self {
        Self {
            ratio,
            seed,
            ..Default::default()
        }
    }

    /// Number of rows kept out of `n` candidates
    pub fn target_size(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        ((n as f64 * self.ratio).ceil() as usize).clamp(1, n)
    }

    /// Select row indices of `embeddings` (row-major, `dim` columns).
    ///
    /// Indices are returned in selection order.
    pub fn select(&self, embeddings: &[f32], dim: usize) -> Vec<usize> {
        let n = if dim == 0 { 0 } else { embeddings.len() / dim };
        if n == 0 {
            return Vec::new();
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);

        let candidates: Vec<usize> = if n > self.max_candidates {
            let mut picked = index::sample(&mut rng, n, self.max_candidates).into_vec();
            picked.sort_unstable();
            picked
        } else {
            (0..n).collect()
        };

        let (points, point_dim) = if dim > self.projection_dim {
            let projection = sparse_projection(&mut rng, dim, self.projection_dim);
            (project(embeddings, dim, &candidates, &projection, self.projection_dim), self.projection_dim)
        } else {
            let rows = candidates
                .iter()
                .flat_map(|&i| embeddings[i * dim..(i + 1) * dim].iter().copied())
                .collect();
            (rows, dim)
        };

        let m = candidates.len();
        let k = self.target_size(m);
        debug!("Coreset: {} rows ({} candidates) -> {}", n, m, k);

        let mut min_dist = vec![f32::INFINITY; m];
        let mut selected = Vec::with_capacity(k);
        let mut last = rng.gen_range(0..m);
        selected.push(last);

        while selected.len() < k {
            let anchor = &points[last * point_dim..(last + 1) * point_dim];
            min_dist
                .par_iter_mut()
                .zip(points.par_chunks(point_dim))
                .for_each(|(best, row)| {
                    let d = squared_distance(row, anchor);
                    if d < *best {
                        *best = d;
                    }
                });

            last = argmax(&min_dist);
            if min_dist[last] <= 0.0 {
                // every remaining candidate duplicates a selected one
                break;
            }
            selected.push(last);
        }

        selected.into_iter().map(|i| candidates[i]).collect()
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}

/// Achlioptas projection matrix [dim, out_dim]: entries +-sqrt(3 / out_dim)
/// with probability 1/6 each, zero otherwise
fn sparse_projection<R: Rng>(rng: &mut R, dim: usize, out_dim: usize) -> Vec<f32> {
    let scale = (3.0 / out_dim as f32).sqrt();
    (0..dim * out_dim)
        .map(|_| match rng.gen_range(0..6) {
            0 => scale,
            1 => -scale,
            _ => 0.0,
        })
        .collect()
}

fn project(
    embeddings: &[f32],
    dim: usize,
    rows: &[usize],
    projection: &[f32],
    out_dim: usize,
) -> Vec<f32> {
    let mut out = vec![0.0f32; rows.len() * out_dim];
    out.par_chunks_mut(out_dim)
        .zip(rows.par_iter())
        .for_each(|(dst, &row)| {
            let src = &embeddings[row * dim..(row + 1) * dim];
            for (j, &x) in src.iter().enumerate() {
                if x == 0.0 {
                    continue;
                }
                let weights = &projection[j * out_dim..(j + 1) * out_dim];
                for (d, &w) in dst.iter_mut().zip(weights) {
                    *d += x * w;
                }
            }
        });
    out
}

//! Visual-word codebook learned with k-means.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Rows beyond this count are subsampled before clustering.
const MAX_TRAINING_ROWS: usize = 50_000;

const MAX_ITERATIONS: usize = 50;

/// Cluster centres of the training descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Codebook {
    pub centers: Vec<Vec<f64>>,
}

pub(crate) fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl Codebook {
    /// Fit up to `k` words on `rows` (k-means++ seeding, Lloyd iterations).
    pub fn fit(rows: &[&[f64]], k: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sample: Vec<&[f64]> = rows.to_vec();
        if sample.len() > MAX_TRAINING_ROWS {
            sample.shuffle(&mut rng);
            sample.truncate(MAX_TRAINING_ROWS);
        }
        let k = k.max(1).min(sample.len());
        if k == 0 {
            return Self { centers: Vec::new() };
        }

        let mut centers = seed_centers(&sample, k, &mut rng);
        let dims = centers[0].len();
        let mut assignment = vec![usize::MAX; sample.len()];

        for _ in 0..MAX_ITERATIONS {
            let mut changed = false;
            for (i, row) in sample.iter().enumerate() {
                let (nearest, _) = nearest_of(&centers, row);
                if assignment[i] != nearest {
                    assignment[i] = nearest;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0; dims]; k];
            let mut counts = vec![0usize; k];
            for (row, &c) in sample.iter().zip(&assignment) {
                counts[c] += 1;
                for (s, v) in sums[c].iter_mut().zip(row.iter()) {
                    *s += v;
                }
            }
            for c in 0..k {
                if counts[c] > 0 {
                    centers[c] = sums[c].iter().map(|s| s / counts[c] as f64).collect();
                } else {
                    // Re-seed empty clusters on a random row.
                    centers[c] = sample[rng.gen_range(0..sample.len())].to_vec();
                }
            }
        }

        Self { centers }
    }

    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// Index and squared distance of the closest word.
    pub fn nearest(&self, row: &[f64]) -> (usize, f64) {
        nearest_of(&self.centers, row)
    }
}

fn nearest_of(centers: &[Vec<f64>], row: &[f64]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (i, c) in centers.iter().enumerate() {
        let d = squared_distance(c, row);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

fn seed_centers(rows: &[&[f64]], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centers = vec![rows[rng.gen_range(0..rows.len())].to_vec()];
    let mut distances: Vec<f64> = rows
        .iter()
        .map(|r| squared_distance(r, &centers[0]))
        .collect();

    while centers.len() < k {
        let total: f64 = distances.iter().sum();
        let next = if total <= 0.0 {
            rng.gen_range(0..rows.len())
        } else {
            let mut target = rng.gen_range(0.0..total);
            let mut chosen = rows.len() - 1;
            for (i, d) in distances.iter().enumerate() {
                if target < *d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        };
        let center = rows[next].to_vec();
        for (d, r) in distances.iter_mut().zip(rows) {
            *d = d.min(squared_distance(r, &center));
        }
        centers.push(center);
    }
    centers
}

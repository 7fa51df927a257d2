//! Train/test split policy.
//!
//! The split is drawn once per search over the full tag list and shared by
//! every candidate.

use crate::error::MlError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How tags are assigned to the test split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// Independent per-tag draw.
    #[default]
    Random,
    /// Positional cutoff: tag `i` is a test tag while `i / 100 < ratio`.
    Fixed,
}

impl FromStr for SplitMode {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "fixed" => Ok(Self::Fixed),
            other => Err(MlError::UnknownSplitMode(other.to_string())),
        }
    }
}

/// Split mode, test ratio and optional seed for the random mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPolicy {
    #[serde(default)]
    pub mode: SplitMode,
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            mode: SplitMode::default(),
            ratio: default_ratio(),
            seed: None,
        }
    }
}

fn default_ratio() -> f64 {
    0.2
}

impl SplitPolicy {
    pub fn fixed(ratio: f64) -> Self {
        Self {
            mode: SplitMode::Fixed,
            ratio,
            seed: None,
        }
    }

    pub fn random(ratio: f64, seed: Option<u64>) -> Self {
        Self {
            mode: SplitMode::Random,
            ratio,
            seed,
        }
    }
}

/// Partition `tags` into `(train, test)` according to `policy`.
pub fn split_tags<T: Clone>(tags: &[T], policy: &SplitPolicy) -> (Vec<T>, Vec<T>) {
    let mut train = Vec::new();
    let mut test = Vec::new();

    match policy.mode {
        SplitMode::Random => {
            let mut rng = match policy.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            for tag in tags {
                let draw = rng.gen_range(0..100) as f64 / 100.0;
                if draw > policy.ratio {
                    train.push(tag.clone());
                } else {
                    test.push(tag.clone());
                }
            }
        }
        SplitMode::Fixed => {
            for (i, tag) in tags.iter().enumerate() {
                if i as f64 / 100.0 >= policy.ratio {
                    train.push(tag.clone());
                } else {
                    test.push(tag.clone());
                }
            }
        }
    }

    (train, test)
}

//! Best-so-far accumulator shared by the search drivers.

use crate::error::MlError;
use crate::grid::ConcreteConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// How a candidate scoring exactly the current best is treated.
///
/// "Latest" and "earliest" refer to the order candidates are offered. With
/// one search worker that is grid order. With more workers candidates of a
/// tier are offered as they finish, so the winner among tied candidates
/// depends on scheduling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Ties replace the best (`>=`).
    #[default]
    PreferLatest,
    /// Ties keep the earlier best (`>`).
    PreferEarliest,
}

impl TieBreak {
    /// Whether `score` replaces `best`. NaN never does.
    pub fn improves(&self, score: f64, best: f64) -> bool {
        match self {
            Self::PreferLatest => score >= best,
            Self::PreferEarliest => score > best,
        }
    }
}

/// One evaluated candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Position in evaluation order.
    pub index: usize,
    pub options: ConcreteConfig,
    pub score: f64,
    /// Whether the candidate became the best when it was offered.
    pub accepted: bool,
}

/// The recorded best candidate and every score offered so far.
#[derive(Debug, Clone)]
pub struct BestTracker {
    tie_break: TieBreak,
    best: Option<usize>,
    history: Vec<CandidateRecord>,
}

impl BestTracker {
    pub fn new(tie_break: TieBreak) -> Self {
        Self {
            tie_break,
            best: None,
            history: Vec::new(),
        }
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    pub fn best(&self) -> Option<&CandidateRecord> {
        self.best.map(|i| &self.history[i])
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best().map(|b| b.score)
    }

    pub fn history(&self) -> &[CandidateRecord] {
        &self.history
    }

    pub fn into_history(self) -> Vec<CandidateRecord> {
        self.history
    }

    /// Record a scored candidate. When it beats the best, `checkpoint` runs
    /// first and the candidate is only accepted once it succeeds.
    ///
    /// The first finite score is always accepted.
    pub fn offer<F>(&mut self, options: &ConcreteConfig, score: f64, checkpoint: F) -> Result<bool, MlError>
    where
        F: FnOnce() -> Result<(), MlError>,
    {
        let improves = !score.is_nan()
            && self
                .best_score()
                .is_none_or(|best| self.tie_break.improves(score, best));
        if improves {
            checkpoint()?;
            self.best = Some(self.history.len());
        }
        self.history.push(CandidateRecord {
            index: self.history.len(),
            options: options.clone(),
            score,
            accepted: improves,
        });
        Ok(improves)
    }
}

/// Lock a shared tracker, reporting poisoning as a search error.
pub(crate) fn lock(tracker: &Mutex<BestTracker>) -> Result<MutexGuard<'_, BestTracker>, MlError> {
    tracker
        .lock()
        .map_err(|_| MlError::search("best-result record poisoned by a panicking candidate"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn opts(i: i64) -> ConcreteConfig {
        ConcreteConfig::new().with("i", i)
    }

    fn offer_all(tie_break: TieBreak, scores: &[f64]) -> BestTracker {
        let mut tracker = BestTracker::new(tie_break);
        for (i, s) in scores.iter().enumerate() {
            tracker.offer(&opts(i as i64), *s, || Ok(())).unwrap();
        }
        tracker
    }

    #[test]
    fn test_prefer_latest_takes_ties() {
        let tracker = offer_all(TieBreak::PreferLatest, &[0.5, 0.7, 0.7, 0.6]);
        assert_eq!(tracker.best().unwrap().index, 2);
        let accepted: Vec<bool> = tracker.history().iter().map(|r| r.accepted).collect();
        assert_eq!(accepted, vec![true, true, true, false]);
    }

    #[test]
    fn test_prefer_earliest_keeps_first_tie() {
        let tracker = offer_all(TieBreak::PreferEarliest, &[0.5, 0.7, 0.7, 0.6]);
        assert_eq!(tracker.best().unwrap().index, 1);
        assert_eq!(tracker.best().unwrap().options, opts(1));
    }

    #[test]
    fn test_first_score_accepted_even_when_zero() {
        let tracker = offer_all(TieBreak::PreferEarliest, &[0.0]);
        assert_eq!(tracker.best_score(), Some(0.0));
    }

    #[test]
    fn test_nan_never_becomes_best() {
        let tracker = offer_all(TieBreak::PreferLatest, &[f64::NAN, 0.1, f64::NAN]);
        assert_eq!(tracker.best().unwrap().index, 1);
        assert_eq!(tracker.history().len(), 3);
    }

    #[test]
    fn test_failed_checkpoint_keeps_previous_best() {
        let mut tracker = BestTracker::new(TieBreak::PreferLatest);
        tracker.offer(&opts(0), 0.4, || Ok(())).unwrap();
        let result = tracker.offer(&opts(1), 0.9, || Err(MlError::search("disk full")));
        assert!(result.is_err());
        assert_eq!(tracker.best_score(), Some(0.4));
        assert_eq!(tracker.history().len(), 1);
    }

    #[test]
    fn test_checkpoint_runs_only_on_improvement() {
        let mut tracker = BestTracker::new(TieBreak::PreferEarliest);
        let mut writes = 0;
        for s in [0.3, 0.2, 0.3, 0.8] {
            tracker
                .offer(&opts(0), s, || {
                    writes += 1;
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(writes, 2);
    }
}

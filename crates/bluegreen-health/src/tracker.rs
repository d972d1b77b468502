//! Consecutive-sample tracking for the regression monitor.

use tracing::{debug, warn};

/// Verdict on a single post-switch sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleVerdict {
    /// Every threshold held.
    Good,
    /// At least one threshold was breached.
    Bad(String),
    /// The signal source could not be read; counts neither way.
    Inconclusive,
}

/// Tracks consecutive bad samples against a threshold.
#[derive(Debug)]
pub struct RegressionTracker {
    /// Consecutive bad samples.
    consecutive_bad: u32,
    /// Bad samples in a row that count as a regression.
    threshold: u32,
    /// Reason attached to the most recent bad sample.
    last_reason: Option<String>,
    samples: u32,
}

impl RegressionTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_bad: 0,
            threshold: threshold.max(1),
            last_reason: None,
            samples: 0,
        }
    }

    /// Record a sample. Returns `true` once the threshold is reached.
    pub fn record(&mut self, verdict: SampleVerdict) -> bool {
        self.samples += 1;
        match verdict {
            SampleVerdict::Good => {
                if self.consecutive_bad > 0 {
                    debug!(after = self.consecutive_bad, "signals recovered");
                }
                self.consecutive_bad = 0;
                self.last_reason = None;
            }
            SampleVerdict::Bad(reason) => {
                self.consecutive_bad += 1;
                warn!(
                    consecutive = self.consecutive_bad,
                    threshold = self.threshold,
                    %reason,
                    "bad post-switch sample"
                );
                self.last_reason = Some(reason);
            }
            SampleVerdict::Inconclusive => {}
        }
        self.is_regressed()
    }

    pub fn is_regressed(&self) -> bool {
        self.consecutive_bad >= self.threshold
    }

    pub fn consecutive_bad(&self) -> u32 {
        self.consecutive_bad
    }

    pub fn last_reason(&self) -> Option<&str> {
        self.last_reason.as_deref()
    }

    /// Samples recorded so far, inconclusive ones included.
    pub fn samples(&self) -> u32 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bad() -> SampleVerdict {
        SampleVerdict::Bad("error rate 12.0% > 5.0%".into())
    }

    #[test]
    fn regression_after_threshold() {
        let mut t = RegressionTracker::new(3);
        assert!(!t.record(bad()));
        assert!(!t.record(bad()));
        assert!(t.record(bad()));
        assert_eq!(t.last_reason(), Some("error rate 12.0% > 5.0%"));
    }

    #[test]
    fn good_sample_resets_the_streak() {
        let mut t = RegressionTracker::new(2);
        t.record(bad());
        t.record(SampleVerdict::Good);
        assert_eq!(t.consecutive_bad(), 0);
        assert!(!t.record(bad()));
        assert!(t.record(bad()));
    }

    #[test]
    fn inconclusive_neither_resets_nor_counts() {
        let mut t = RegressionTracker::new(2);
        t.record(bad());
        t.record(SampleVerdict::Inconclusive);
        assert_eq!(t.consecutive_bad(), 1);
        assert!(t.record(bad()));
        assert_eq!(t.samples(), 3);
    }

    #[test]
    fn zero_threshold_is_treated_as_one() {
        let mut t = RegressionTracker::new(0);
        assert!(!t.is_regressed());
        assert!(t.record(bad()));
    }
}

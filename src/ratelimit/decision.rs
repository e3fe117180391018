//! The admit-or-reject rule applied to a single usage counter.

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed; its usage has been recorded
    Admit,
    /// The caller is at or over its limit; nothing was recorded
    Reject,
}

impl Decision {
    /// Returns `true` for [`Decision::Admit`].
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// Whether a counter counts as "prior usage".
///
/// Zero and NaN are treated exactly like a missing counter. Negative
/// counters left behind by decay overshoot still count as usage.
pub fn has_usage(counter: Option<f64>) -> bool {
    matches!(counter, Some(c) if c != 0.0 && !c.is_nan())
}

/// Decide a request against the current counter.
///
/// Returns the decision and, when admitted, the counter value to store.
pub fn decide(counter: Option<f64>, limit: f64) -> (Decision, Option<f64>) {
    match counter {
        Some(c) if has_usage(counter) => {
            if c >= limit {
                (Decision::Reject, None)
            } else {
                (Decision::Admit, Some(c + 1.0))
            }
        }
        _ => (Decision::Admit, Some(1.0)),
    }
}

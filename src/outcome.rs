//! Result-table cells and the policy layer that shapes them for callers.

use serde_json::Value;

use crate::error::{BatchError, LoaderError, LoaderResult};

/// The canonical result-table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The backend produced a value for the item.
    Ok(Value),
    /// The backend was consulted and had nothing for the item.
    NotFound,
    /// The batch (or this item within it) failed.
    Error(BatchError),
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

/// Tallies reported on `RunEvent::Stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub ok: usize,
    pub not_found: usize,
    pub error: usize,
}

impl OutcomeCounts {
    pub(crate) fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Ok(_) => self.ok += 1,
            Outcome::NotFound => self.not_found += 1,
            Outcome::Error(_) => self.error += 1,
        }
    }

    pub(crate) fn merge(&mut self, other: OutcomeCounts) {
        self.ok += other.ok;
        self.not_found += other.not_found;
        self.error += other.error;
    }

    pub fn total(&self) -> usize {
        self.ok + self.not_found + self.error
    }
}

/// Policy-shaped view of an outcome, as returned by `get`.
#[derive(Debug, Clone, PartialEq)]
pub enum GetResult {
    /// The item resolved to a value.
    Found(Value),
    /// The item resolved to nothing (or its error was absorbed under
    /// [`ErrorPolicy::Ignore`]).
    Missing,
    /// The item's batch failed. Only produced under [`ErrorPolicy::Expose`].
    Failed(BatchError),
}

impl GetResult {
    /// The value, if the item resolved to one.
    pub fn value(self) -> Option<Value> {
        match self {
            GetResult::Found(value) => Some(value),
            GetResult::Missing | GetResult::Failed(_) => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, GetResult::Found(_))
    }
}

/// Governs how batch errors surface from `get`.
///
/// The policy changes the shape of what the caller sees, never the identity of
/// the recorded outcomes: rerunning an identical loader under a different
/// policy reshapes the same result tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Batch errors escalate: `get` returns `Err(LoaderError::Get)`.
    #[default]
    Fail,
    /// Batch errors are absorbed into `Missing` and logged exactly once per
    /// `(batch_key, item)` pair.
    Ignore,
    /// Batch errors are handed back verbatim as [`GetResult::Failed`].
    Expose,
}

impl ErrorPolicy {
    /// Shapes a raw outcome for the caller. `log_error` fires only on the
    /// `Ignore` path; the loader arranges for it to log once per pair.
    pub(crate) fn shape(
        self,
        source: &str,
        outcome: &Outcome,
        log_error: impl FnOnce(&BatchError),
    ) -> LoaderResult<GetResult> {
        match outcome {
            Outcome::Ok(value) => Ok(GetResult::Found(value.clone())),
            Outcome::NotFound => Ok(GetResult::Missing),
            Outcome::Error(error) => match self {
                ErrorPolicy::Fail => {
                    Err(LoaderError::Get { source: source.to_owned(), error: error.clone() })
                }
                ErrorPolicy::Ignore => {
                    log_error(error);
                    Ok(GetResult::Missing)
                }
                ErrorPolicy::Expose => Ok(GetResult::Failed(error.clone())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fail_policy_escalates_errors() {
        let outcome = Outcome::Error(BatchError::backend("down"));
        let shaped = ErrorPolicy::Fail.shape("db", &outcome, |_| {});
        assert!(matches!(shaped, Err(LoaderError::Get { .. })));
    }

    #[test]
    fn ignore_policy_absorbs_and_logs() {
        let outcome = Outcome::Error(BatchError::backend("down"));
        let mut logged = false;
        let shaped = ErrorPolicy::Ignore.shape("db", &outcome, |_| logged = true);
        assert_eq!(shaped, Ok(GetResult::Missing));
        assert!(logged);
    }

    #[test]
    fn expose_policy_hands_back_the_error() {
        let outcome = Outcome::Error(BatchError::backend("down"));
        let shaped = ErrorPolicy::Expose.shape("db", &outcome, |_| {});
        assert!(matches!(shaped, Ok(GetResult::Failed(_))));
    }

    #[test]
    fn value_outcomes_are_policy_independent() {
        for policy in [ErrorPolicy::Fail, ErrorPolicy::Ignore, ErrorPolicy::Expose] {
            let found = policy.shape("db", &Outcome::Ok(json!(1)), |_| {}).unwrap();
            assert_eq!(found, GetResult::Found(json!(1)));
            let missing = policy.shape("db", &Outcome::NotFound, |_| {}).unwrap();
            assert_eq!(missing, GetResult::Missing);
        }
    }

    #[test]
    fn counts_tally_by_kind() {
        let mut counts = OutcomeCounts::default();
        counts.record(&Outcome::Ok(json!(1)));
        counts.record(&Outcome::NotFound);
        counts.record(&Outcome::Error(BatchError::backend("x")));
        counts.record(&Outcome::Ok(json!(2)));
        assert_eq!(counts, OutcomeCounts { ok: 2, not_found: 1, error: 1 });
        assert_eq!(counts.total(), 4);
    }
}

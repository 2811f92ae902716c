use crate::decode::JobEvent;
use std::collections::BTreeMap;

/// Running totals for one job type within a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobTally {
    pub completed: u64,
    pub total_duration_secs: i64,
}

/// Per-job totals for the current window, keyed by job type.
///
/// Completion count and total duration live in the same entry, so a job
/// that has a count always has a duration and vice versa.
pub type AggregateState = BTreeMap<String, JobTally>;

/// Folds decoded job events into per-window totals.
///
/// Folding is plain accumulation: the same event folded twice counts twice.
/// The state is only cleared by [`JobAggregator::reset`], never by a flush.
#[derive(Debug, Default)]
pub struct JobAggregator {
    state: AggregateState,
}

impl JobAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one completed job to the window.
    pub fn fold(&mut self, event: &JobEvent) {
        let tally = self.state.entry(event.job_type.clone()).or_default();
        tally.completed = tally.completed.saturating_add(1);
        tally.total_duration_secs = tally
            .total_duration_secs
            .saturating_add(event.duration_secs);
    }

    /// Start a new window with empty totals.
    pub fn reset(&mut self) {
        self.state.clear();
    }

    pub fn state(&self) -> &AggregateState {
        &self.state
    }

    pub fn completed_count(&self, job_type: &str) -> Option<u64> {
        self.state.get(job_type).map(|t| t.completed)
    }

    pub fn total_duration(&self, job_type: &str) -> Option<i64> {
        self.state.get(job_type).map(|t| t.total_duration_secs)
    }

    /// Job types seen this window, in ascending order.
    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.state.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

/// End-of-window metric export.
///
/// Converts aggregated job totals into abstract `(name, value, description)`
/// readings. Encoding them for a particular metrics backend is left to the
/// caller.
use crate::aggregate::AggregateState;
use serde::Serialize;

pub const COMPLETED_DESCRIPTION: &str = "Jobs completed";
pub const EXECUTION_TIME_DESCRIPTION: &str = "Job execution time";

/// One named metric value produced by a flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricReading {
    pub name: String,
    pub value: i64,
    pub description: String,
}

/// Optional dotted prefix and suffix wrapped around every metric name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricNaming {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

impl MetricNaming {
    /// Build a naming scheme, treating empty strings as unset.
    pub fn new(prefix: Option<String>, suffix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
            suffix: suffix.filter(|s| !s.is_empty()),
        }
    }

    /// `<prefix>.<job>.<metric>.<suffix>`, skipping unset parts.
    pub fn name(&self, job_type: &str, metric: &str) -> String {
        let mut name = String::new();
        if let Some(prefix) = &self.prefix {
            name.push_str(prefix);
            name.push('.');
        }
        name.push_str(job_type);
        name.push('.');
        name.push_str(metric);
        if let Some(suffix) = &self.suffix {
            name.push('.');
            name.push_str(suffix);
        }
        name
    }
}

/// Produce the readings for every job in `state`, in job-name order.
///
/// Each job yields a `completed` reading followed by an `execution_time`
/// reading. The state itself is left untouched.
pub fn flush(state: &AggregateState, naming: &MetricNaming) -> Vec<MetricReading> {
    let mut readings = Vec::with_capacity(state.len() * 2);
    for (job, tally) in state {
        readings.push(MetricReading {
            name: naming.name(job, "completed"),
            value: i64::try_from(tally.completed).unwrap_or(i64::MAX),
            description: COMPLETED_DESCRIPTION.to_string(),
        });
        readings.push(MetricReading {
            name: naming.name(job, "execution_time"),
            value: tally.total_duration_secs,
            description: EXECUTION_TIME_DESCRIPTION.to_string(),
        });
    }
    readings
}

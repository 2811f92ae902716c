//! Job-execution metrics from ECConnect gateway logs.
//!
//! [`decode`] turns a log line into a [`decode::JobEvent`], [`aggregate`]
//! keeps per-job totals for a window, and [`export`] flushes those totals
//! as metric readings. [`driver`] and [`logtail`] run one window per
//! invocation over the part of the log that is new since the last run.

pub mod aggregate;
pub mod config;
pub mod decode;
pub mod driver;
pub mod export;
pub mod logtail;

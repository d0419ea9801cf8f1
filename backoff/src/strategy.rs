//! Backoff strategies are plain iterators of [std::time::Duration]. Bounding the number of retries
//! is done with [Iterator::take] or with the strategy's own attempt limit.

pub mod exponential;
pub mod fixed;

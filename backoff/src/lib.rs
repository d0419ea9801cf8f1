//! Retry a fallible async operation, sleeping between attempts as prescribed by a [strategy].
//!
//! ```no_run
//! use backoff::retry::Retry;
//! use backoff::strategy::fixed;
//!
//! # async fn connect() -> Result<(), String> { Ok(()) }
//! # async fn example() -> Result<(), String> {
//! let interval = fixed::Interval::from_millis(100).take(5);
//! Retry::new(interval, || connect(), |_: &String| true).await
//! # }
//! ```

use std::future::Future;

pub mod retry;
pub mod strategy;

/// An operation that can be run more than once. Every run produces a fresh future.
pub trait Operation {
    type Future: Future<Output = Result<Self::Item, Self::Error>>;
    type Item;
    type Error;

    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    F: FnMut() -> T,
    T: Future<Output = Result<I, E>>,
{
    type Future = T;
    type Item = I;
    type Error = E;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether a failed attempt is worth another try.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}

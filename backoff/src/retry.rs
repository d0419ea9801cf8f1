use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::{Condition, Operation};

/// The retry future alternates between running the [`Operation`] and sleeping for the next
/// duration handed out by the strategy.
///
/// ```text
///  Running --Ok--> done(Ok)
///     |
///    Err --not retryable / strategy exhausted / cancelled--> done(Err)
///     |
///  Sleeping --elapsed--> Running
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Retry an operation based on a backoff strategy.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    state: RetryState<O>,
    backoff: I,
    operation: O,
    condition: C,
    cancel: Option<CancellationToken>,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<B>(backoff: B, mut operation: O, condition: C) -> Self
    where
        B: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Self {
            state: RetryState::Running(operation.run()),
            backoff: backoff.into_iter(),
            operation,
            condition,
            cancel: None,
        }
    }

    /// Stop retrying once the token is cancelled; the last error is returned as is.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Schedules the next attempt, or hands the error back when no more attempts are allowed.
    fn cool_off(self: Pin<&mut Self>, err: O::Error) -> Result<(), O::Error> {
        let mut this = self.project();
        if this.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(err);
        }
        match this.backoff.next() {
            None => Err(err),
            Some(delay) => {
                this.state
                    .set(RetryState::Sleeping(sleep_until(Instant::now() + delay)));
                Ok(())
            }
        }
    }

    fn reattempt(self: Pin<&mut Self>) {
        let mut this = self.project();
        let future = this.operation.run();
        this.state.set(RetryState::Running(future));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project().state.project() {
                RetryStateProj::Running(op) => match op.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                    Poll::Ready(Err(e)) => {
                        if !self.condition.can_retry(&e) {
                            return Poll::Ready(Err(e));
                        }
                        if let Err(e) = self.as_mut().cool_off(e) {
                            return Poll::Ready(Err(e));
                        }
                    }
                },
                RetryStateProj::Sleeping(sleep) => match sleep.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => self.as_mut().reattempt(),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::strategy::{exponential, fixed};

    fn counting_failure(
        counter: Arc<AtomicUsize>,
    ) -> impl FnMut() -> future::Ready<Result<(), usize>> {
        move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            future::ready(Err(attempt))
        }
    }

    #[tokio::test]
    async fn first_attempt_succeeds() {
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            || async { Ok::<_, ()>("connected") },
            |_: &()| true,
        )
        .await;
        assert_eq!(result, Ok("connected"));
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            counting_failure(Arc::clone(&counter)),
            |_: &usize| false,
        )
        .await;
        assert_eq!(result, Err(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&counter);
        let result = Retry::new(
            exponential::Exponential::from_millis(1, 5),
            move || {
                let attempt = cloned.fetch_add(1, Ordering::SeqCst) + 1;
                future::ready(if attempt < 4 { Err(attempt) } else { Ok(attempt) })
            },
            |_: &usize| true,
        )
        .await;
        assert_eq!(result, Ok(4));
    }

    #[tokio::test]
    async fn gives_up_when_strategy_is_exhausted() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = Retry::new(
            fixed::Interval::from_millis(1).take(3),
            counting_failure(Arc::clone(&counter)),
            |_: &usize| true,
        )
        .await;
        // one initial attempt plus three retries
        assert_eq!(result, Err(4));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelled_token_stops_retrying() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = Arc::new(AtomicUsize::new(0));
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            counting_failure(Arc::clone(&counter)),
            |_: &usize| true,
        )
        .with_cancellation(cancel)
        .await;
        assert_eq!(result, Err(1));
    }
}

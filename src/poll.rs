// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Deduplication of long-poll results.

use crate::{
    OtError,
    config::{Backoff, RetryPolicy},
};
use std::future::Future;

/// Turns a repeatable query into a long poll that only returns changed values.
///
/// [`poll`](Self::poll) re-runs the query until it yields something different from the value
/// returned last, sleeping with exponential backoff between identical answers. The backoff
/// starts over whenever a new value is returned.
#[derive(Debug, Clone)]
pub struct PollSanitizer<T> {
    last: Option<T>,
    backoff: Backoff,
}

impl<T: Clone + PartialEq> PollSanitizer<T> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            last: None,
            backoff: policy.backoff(),
        }
    }

    /// Treats `value` as already seen.
    pub fn with_last(mut self, value: T) -> Self {
        self.last = Some(value);
        self
    }

    pub fn last(&self) -> Option<&T> {
        self.last.as_ref()
    }

    /// Runs `query` until it returns a value different from the last one.
    ///
    /// Errors of `query` are returned as they are; the last seen value is kept.
    pub async fn poll<F, Fut>(&mut self, mut query: F) -> Result<T, OtError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OtError>>,
    {
        loop {
            let value = query().await?;
            if self.last.as_ref() != Some(&value) {
                self.last = Some(value.clone());
                self.backoff.reset();
                return Ok(value);
            }
            let delay = self.backoff.next_delay();
            tracing::trace!(?delay, "poll returned the same value, backing off");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[tokio::test(start_paused = true)]
    async fn repeated_values_are_swallowed() {
        let calls = AtomicUsize::new(0);
        let answers = [1, 1, 1, 2, 2, 3];
        let mut sanitizer = PollSanitizer::new(
            RetryPolicy::default().with_initial_delay(Duration::from_millis(5)),
        )
        .with_last(1);

        let started = tokio::time::Instant::now();
        let query = || {
            let answer = answers[calls.fetch_add(1, Ordering::SeqCst)];
            async move { Ok(answer) }
        };
        assert_eq!(sanitizer.poll(query).await.unwrap(), 2);
        // Three identical answers, three sleeps: 5 + 10 + 20 ms.
        assert!(started.elapsed() >= Duration::from_millis(35));

        let query = || {
            let answer = answers[calls.fetch_add(1, Ordering::SeqCst)];
            async move { Ok(answer) }
        };
        assert_eq!(sanitizer.poll(query).await.unwrap(), 3);
        assert_eq!(sanitizer.last(), Some(&3));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let mut sanitizer = PollSanitizer::<u8>::new(RetryPolicy::default());
        let result = sanitizer
            .poll(|| async { Err(OtError::commit_not_found(&7)) })
            .await;
        assert!(matches!(result, Err(OtError::CommitNotFound(_))));
        assert_eq!(sanitizer.last(), None);
    }
}

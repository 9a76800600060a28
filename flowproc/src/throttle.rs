//! Leading-edge rate limiting (`spec.md` §4.2).

use std::{sync::Arc, time::Instant};

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    clock::{self, Clock},
    processor::{processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::Res,
};

/// Emits the first success that arrives, then drops any success arriving
/// within `cooldown` of the last emission. Failures always pass through
/// and never reset or consume the cooldown.
pub struct Throttle<T> {
    name: String,
    cooldown: std::time::Duration,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Throttle<T>
where
    T: Send + 'static,
{
    pub fn new(cooldown: std::time::Duration) -> Self {
        Self {
            name: "throttle".to_owned(),
            cooldown,
            clock: clock::real(),
            _marker: std::marker::PhantomData,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Drives the throttle to completion: one task, reading `input`
    /// until it closes or `cancel` fires.
    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<T> {
        let (tx, rx): (Outbox<T>, Inbox<T>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let span = processor_span("throttle", &self.name);
        tokio::spawn(
            async move {
                let mut last_emit: Option<Instant> = None;
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        item = input.recv() => {
                            let Some(item) = item else { break };
                            if item.is_failure() {
                                let item = item.passed_through(self.name.clone());
                                if tx.send(item).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                            let now = self.clock.now();
                            let emit = match last_emit {
                                None => true,
                                Some(t) => now.saturating_duration_since(t) >= self.cooldown,
                            };
                            if emit {
                                last_emit = Some(now);
                                if tx.send(item).await.is_err() {
                                    break;
                                }
                            } else {
                                tracing::trace!("dropped success within cooldown");
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
        rx
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        clock::FakeClock,
        error::{ErrorKind, FlowError, MessageError},
    };

    fn dummy_failure(input: i32) -> Res<i32> {
        Res::failure(
            input,
            FlowError::user("source", Box::new(MessageError::new("boom")), ErrorKind::Transient),
            "source",
            std::time::SystemTime::now(),
        )
    }

    #[tokio::test]
    async fn d100ms_scenario_from_spec() {
        let clock = Arc::new(FakeClock::new());
        let (tx, input) = mpsc::channel(16);
        let output = Throttle::new(Duration::from_millis(100))
            .with_clock(clock.clone())
            .process(input, CancelToken::new());

        tx.send(Res::success(0)).await.unwrap();
        clock.block_until_ready().await;

        clock.advance(Duration::from_millis(50));
        tx.send(Res::success(50)).await.unwrap();
        clock.block_until_ready().await;

        clock.advance(Duration::from_millis(10)); // now 60
        tx.send(dummy_failure(60)).await.unwrap();
        clock.block_until_ready().await;

        clock.advance(Duration::from_millis(39)); // now 99
        tx.send(Res::success(99)).await.unwrap();
        clock.block_until_ready().await;

        clock.advance(Duration::from_millis(1)); // now 100
        tx.send(Res::success(100)).await.unwrap();
        clock.block_until_ready().await;

        clock.advance(Duration::from_millis(150)); // now 250
        tx.send(Res::success(250)).await.unwrap();
        clock.block_until_ready().await;

        drop(tx);

        let mut received = Vec::new();
        let mut output = output;
        while let Some(item) = output.recv().await {
            received.push(item);
        }
        assert_eq!(4, received.len());
        assert_eq!(Some(&0), received[0].value());
        assert!(received[1].is_failure());
        assert_eq!(Some(&100), received[2].value());
        assert_eq!(Some(&250), received[3].value());
    }

    #[tokio::test]
    async fn failures_never_consume_cooldown() {
        let clock = Arc::new(FakeClock::new());
        let (tx, input) = mpsc::channel(16);
        let mut output = Throttle::new(Duration::from_millis(100))
            .with_clock(clock.clone())
            .process(input, CancelToken::new());

        tx.send(Res::success(1)).await.unwrap();
        clock.block_until_ready().await;
        for _ in 0..5 {
            tx.send(dummy_failure(0)).await.unwrap();
        }
        drop(tx);

        let mut count_success = 0;
        let mut count_failure = 0;
        while let Some(item) = output.recv().await {
            if item.is_success() {
                count_success += 1;
            } else {
                count_failure += 1;
            }
        }
        assert_eq!(1, count_success);
        assert_eq!(5, count_failure);
    }
}

//! The trivial processors: thin, single-purpose stages with no timing
//! obligations (`spec.md` §4.12).

use std::{future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc};

use futures::FutureExt;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    error::{wall_now, BoxError, ErrorKind, FlowError},
    processor::{
        catch_panic, default_name, processor_span, recast_failure, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY,
    },
    result::Res,
};

/// Drops successes where `predicate` is false; failures pass through.
pub struct Filter<T> {
    name: String,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T: Send + 'static> Filter<T> {
    pub fn new(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name: default_name("filter"),
            predicate: Arc::new(predicate),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<T> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let span = processor_span("filter", &self.name);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        item = input.recv() => {
                            let Some(item) = item else { return };
                            if item.is_failure() {
                                if tx.send(item.passed_through(self.name.clone())).await.is_err() {
                                    return;
                                }
                                continue;
                            }
                            match catch_panic(&self.name, || (self.predicate)(item.value().expect("checked success above"))) {
                                Ok(true) => {
                                    if tx.send(item).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(false) => {}
                                Err(err) => {
                                    tracing::warn!("predicate panicked");
                                    let failure = Res::failure(
                                        item.into_value().expect("checked success above"),
                                        err,
                                        self.name.clone(),
                                        wall_now(),
                                    );
                                    if tx.send(failure).await.is_err() {
                                        return;
                                    }
                                }
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

type MapperFuture<U> = Pin<Box<dyn Future<Output = Result<U, BoxError>> + Send>>;

/// Transforms each success with an async function, one item at a time.
/// A function error or panic becomes a `Failure`; see
/// [`crate::processor::recast_failure`] for why its `input` is
/// `U::default()` rather than the original `T`. For bounded worker
/// parallelism, use [`crate::mapper::AsyncMapper`] instead.
pub struct Mapper<T, U> {
    name: String,
    func: Arc<dyn Fn(T) -> MapperFuture<U> + Send + Sync>,
}

impl<T, U> Mapper<T, U>
where
    T: Clone + Send + 'static,
    U: Default + Send + 'static,
{
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, BoxError>> + Send + 'static,
    {
        Self {
            name: default_name("mapper"),
            func: Arc::new(move |t| Box::pin(func(t))),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<U> {
        let (tx, rx): (Outbox<U>, Inbox<U>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let span = processor_span("mapper", &self.name);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        item = input.recv() => {
                            let Some(item) = item else { return };
                            if item.is_failure() {
                                let item: Res<U> = recast_failure(item, &self.name);
                                if tx.send(item).await.is_err() {
                                    return;
                                }
                                continue;
                            }
                            let value = item.into_value().expect("checked success above");
                            let outcome = AssertUnwindSafe((self.func)(value)).catch_unwind().await;
                            let res = match outcome {
                                Ok(Ok(mapped)) => Res::success(mapped),
                                Ok(Err(source)) => Res::failure(
                                    U::default(),
                                    FlowError::user(self.name.clone(), source, ErrorKind::Validation),
                                    self.name.clone(),
                                    wall_now(),
                                ),
                                Err(payload) => {
                                    tracing::warn!("mapper function panicked");
                                    Res::failure(
                                        U::default(),
                                        FlowError::panicked(self.name.clone(), payload),
                                        self.name.clone(),
                                        wall_now(),
                                    )
                                }
                            };
                            if tx.send(res).await.is_err() {
                                return;
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

/// Runs a side effect on each success, then forwards it unchanged.
/// Failures pass through untouched; a panic in `func` is recovered into
/// a `Failure` preserving the original input.
pub struct Tap<T> {
    name: String,
    func: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T: Clone + Send + 'static> Tap<T> {
    pub fn new(func: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self {
            name: default_name("tap"),
            func: Arc::new(func),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<T> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    item = input.recv() => {
                        let Some(item) = item else { return };
                        if item.is_success() {
                            let result = catch_panic(&self.name, || (self.func)(item.value().expect("checked success above")));
                            if let Err(err) = result {
                                let failure = Res::failure(
                                    item.into_value().expect("checked success above"),
                                    err,
                                    self.name.clone(),
                                    wall_now(),
                                );
                                if tx.send(failure).await.is_err() {
                                    return;
                                }
                                continue;
                            }
                        }
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Forwards the first `n` successes (and every failure seen before
/// then), then closes the output and stops reading input.
pub struct Take<T> {
    n: usize,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Take<T> {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<T> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut taken = 0usize;
            while taken < self.n {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    item = input.recv() => {
                        let Some(item) = item else { return };
                        let is_success = item.is_success();
                        if tx.send(item).await.is_err() {
                            return;
                        }
                        if is_success {
                            taken += 1;
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Drops the first `n` successes; remaining successes and every failure
/// pass through.
pub struct Skip<T> {
    n: usize,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Skip<T> {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<T> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut skipped = 0usize;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    item = input.recv() => {
                        let Some(item) = item else { return };
                        if item.is_success() && skipped < self.n {
                            skipped += 1;
                            continue;
                        }
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Input is `Res<Vec<T>>`; emits each element as its own `Res<T>`
/// success, or the single failure unchanged. Identical to
/// [`Unbatcher`].
pub struct Flatten<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Default + Send + 'static> Default for Flatten<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default + Send + 'static> Flatten<T> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }

    pub fn process(self, input: Inbox<Vec<T>>, cancel: CancelToken) -> Inbox<T> {
        flatten_driver(input, cancel)
    }
}

/// Semantically identical to [`Flatten`]; kept as a distinct type so a
/// pipeline reads as "undo a batcher" at the call site.
pub struct Unbatcher<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Default + Send + 'static> Default for Unbatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default + Send + 'static> Unbatcher<T> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }

    pub fn process(self, input: Inbox<Vec<T>>, cancel: CancelToken) -> Inbox<T> {
        flatten_driver(input, cancel)
    }
}

fn flatten_driver<T: Default + Send + 'static>(mut input: Inbox<Vec<T>>, cancel: CancelToken) -> Inbox<T> {
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                item = input.recv() => {
                    let Some(item) = item else { return };
                    match item {
                        Res::Success { value, .. } => {
                            for element in value {
                                if tx.send(Res::success(element)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        failure @ Res::Failure { .. } => {
                            let failure: Res<T> = recast_failure(failure, "flatten");
                            if tx.send(failure).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    });
    rx
}

/// Keeps each success with independent probability `rate`; failures
/// pass through.
pub struct Sample<T> {
    rate: f64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Sample<T> {
    pub fn new(rate: f64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "rate must be in [0, 1]");
        Self {
            rate,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<T> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    item = input.recv() => {
                        let Some(item) = item else { return };
                        if item.is_success() && rand::thread_rng().gen::<f64>() >= self.rate {
                            continue;
                        }
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Interposes a bounded queue of size `n`. Smooths bursts against a
/// slower consumer; does not otherwise transform the stream.
pub struct Buffer<T> {
    n: usize,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Buffer<T> {
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "n must be positive");
        Self {
            n,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<T> {
        let (tx, rx) = mpsc::channel(self.n);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    item = input.recv() => {
                        let Some(item) = item else { return };
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MessageError;

    #[tokio::test]
    async fn filter_drops_successes_failing_the_predicate() {
        let (tx, input) = mpsc::channel(16);
        let mut output = Filter::new(|n: &i32| *n % 2 == 0).process(input, CancelToken::new());
        for n in 1..=4 {
            tx.send(Res::success(n)).await.unwrap();
        }
        drop(tx);
        let mut received = Vec::new();
        while let Some(item) = output.recv().await {
            received.push(*item.value().unwrap());
        }
        assert_eq!(vec![2, 4], received);
    }

    #[tokio::test]
    async fn mapper_transforms_successes_and_recovers_errors() {
        let (tx, input) = mpsc::channel(16);
        let mut output = Mapper::new(|n: i32| async move {
            if n == 2 {
                return Err::<i32, BoxError>(Box::new(MessageError::new("bad")));
            }
            Ok(n * 10)
        })
        .process(input, CancelToken::new());

        tx.send(Res::success(1)).await.unwrap();
        tx.send(Res::success(2)).await.unwrap();
        drop(tx);

        let first = output.recv().await.unwrap();
        assert_eq!(Some(&10), first.value());
        let second = output.recv().await.unwrap();
        assert!(second.is_failure());
    }

    #[tokio::test]
    async fn tap_observes_without_changing_the_stream() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let (tx, input) = mpsc::channel(16);
        let mut output = Tap::new(move |n: &i32| seen2.lock().unwrap().push(*n)).process(input, CancelToken::new());

        tx.send(Res::success(1)).await.unwrap();
        tx.send(Res::success(2)).await.unwrap();
        drop(tx);

        assert_eq!(Some(&1), output.recv().await.unwrap().value());
        assert_eq!(Some(&2), output.recv().await.unwrap().value());
        assert_eq!(vec![1, 2], *seen.lock().unwrap());
    }

    #[tokio::test]
    async fn take_stops_after_n_successes() {
        let (tx, input) = mpsc::channel(16);
        let mut output = Take::new(2).process(input, CancelToken::new());
        for n in 1..=5 {
            let _ = tx.try_send(Res::success(n));
        }
        let mut received = Vec::new();
        while let Some(item) = output.recv().await {
            received.push(*item.value().unwrap());
        }
        assert_eq!(vec![1, 2], received);
    }

    #[tokio::test]
    async fn skip_drops_only_the_first_n_successes() {
        let (tx, input) = mpsc::channel(16);
        let mut output = Skip::new(2).process(input, CancelToken::new());
        for n in 1..=4 {
            tx.send(Res::success(n)).await.unwrap();
        }
        drop(tx);
        let mut received = Vec::new();
        while let Some(item) = output.recv().await {
            received.push(*item.value().unwrap());
        }
        assert_eq!(vec![3, 4], received);
    }

    #[tokio::test]
    async fn flatten_emits_each_element_as_its_own_success() {
        let (tx, input) = mpsc::channel(16);
        let mut output = Flatten::new().process(input, CancelToken::new());
        tx.send(Res::success(vec![1, 2, 3])).await.unwrap();
        drop(tx);
        let mut received = Vec::new();
        while let Some(item) = output.recv().await {
            received.push(*item.value().unwrap());
        }
        assert_eq!(vec![1, 2, 3], received);
    }

    #[tokio::test]
    async fn sample_rate_zero_drops_every_success() {
        let (tx, input) = mpsc::channel(16);
        let mut output = Sample::new(0.0).process(input, CancelToken::new());
        for n in 1..=10 {
            tx.send(Res::success(n)).await.unwrap();
        }
        drop(tx);
        assert!(output.recv().await.is_none());
    }

    #[tokio::test]
    async fn sample_rate_one_keeps_every_success() {
        let (tx, input) = mpsc::channel(16);
        let mut output = Sample::new(1.0).process(input, CancelToken::new());
        for n in 1..=5 {
            tx.send(Res::success(n)).await.unwrap();
        }
        drop(tx);
        let mut count = 0;
        while output.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(5, count);
    }

    #[tokio::test]
    async fn buffer_forwards_everything_unchanged() {
        let (tx, input) = mpsc::channel(16);
        let mut output = Buffer::new(4).process(input, CancelToken::new());
        for n in 1..=3 {
            tx.send(Res::success(n)).await.unwrap();
        }
        drop(tx);
        let mut received = Vec::new();
        while let Some(item) = output.recv().await {
            received.push(*item.value().unwrap());
        }
        assert_eq!(vec![1, 2, 3], received);
    }
}

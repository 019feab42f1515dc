//! Data sources: the batched executors behind queries.
//!
//! A [`DataSource`] answers an entire batch of [`Request`]s in one call.
//! The engine never hands a source one request at a time when it can help
//! it; it accumulates every request the current evaluation round is blocked
//! on, deduplicates them, and presents them as a single `Vec`. A source
//! built over a backend with a native multi-get (`SELECT .. WHERE id IN
//! (..)`, `MGET`, a bulk endpoint) turns the classic N+1 access pattern
//! into one round trip without the query author doing anything.
//!
//! Sources are usually built with [`make_batched`] (from a whole-batch
//! function) or [`make`] (from a per-request function, fanned out
//! concurrently), then shaped with combinators: [`DataSourceExt::batch_n`]
//! caps batch sizes, [`combine`] unions two sources behind one request
//! type.
//!
//! ## Contract
//!
//! `run_all` must record an outcome for **every** request it was given.
//! Returning `Err` fails the whole batch: every request resolves to that
//! error. Silently omitting a request from the returned
//! [`CompletedRequestMap`] is a contract violation and surfaces as a
//! [`Defect::MissingResult`](crate::error::Defect::MissingResult) naming
//! the source and the dropped request.
use std::{collections::HashSet, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use futures::{future, Future, FutureExt};
use tracing::debug;

use crate::{
    blocked::BlockedRequest,
    request::{CompletedRequestMap, Request},
};

/// A batched executor for one family of requests.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// The requests this source knows how to answer.
    type Request: Request;

    /// A stable, human-readable identifier, used in logs and defect
    /// reports.
    fn name(&self) -> &str;

    /// Execute a whole batch, returning an outcome per request.
    ///
    /// `Err` fails the entire batch. The batch is already deduplicated;
    /// no two requests in it compare equal.
    async fn run_all(
        &self,
        requests: Vec<Self::Request>,
    ) -> Result<CompletedRequestMap, <Self::Request as Request>::Error>;
}

/// Build a data source from an async function over a whole batch.
///
/// ## Example
///
/// ```
/// use gather::{
///     request::{CompletedRequestMap, Request},
///     source::make_batched,
/// };
///
/// #[derive(Clone, Debug, PartialEq, Eq, Hash)]
/// struct GetSquare(u32);
///
/// impl Request for GetSquare {
///     type Value = u64;
///     type Error = String;
/// }
///
/// let source = make_batched("SquareDataSource", |requests: Vec<GetSquare>| async move {
///     let mut completed = CompletedRequestMap::new();
///     for request in requests {
///         let value = u64::from(request.0) * u64::from(request.0);
///         completed.insert(request, Ok(value));
///     }
///     Ok(completed)
/// });
/// ```
pub fn make_batched<R, F, Fut>(name: impl Into<String>, run: F) -> BatchedFnSource<R, F>
where
    R: Request,
    F: Fn(Vec<R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CompletedRequestMap, R::Error>> + Send + 'static,
{
    BatchedFnSource {
        name: name.into(),
        run,
        _requests: PhantomData,
    }
}

/// Build a data source from an async function over a single request.
///
/// The batch is fanned out concurrently, one invocation per distinct
/// request, and the outcomes are collected into one map. A failed
/// invocation fails only its own request.
pub fn make<R, F, Fut>(name: impl Into<String>, run: F) -> PerRequestFnSource<R, F>
where
    R: Request,
    F: Fn(R) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R::Value, R::Error>> + Send + 'static,
{
    PerRequestFnSource {
        name: name.into(),
        run,
        _requests: PhantomData,
    }
}

/// Combine two data sources into one answering either side's requests.
///
/// A batch of [`EitherRequest`]s is partitioned by side and both partitions
/// run in parallel against their respective sources. Both sources must
/// share an error type.
pub fn combine<A, B>(left: A, right: B) -> CombinedSource<A, B>
where
    A: DataSource,
    B: DataSource,
    B::Request: Request<Error = <A::Request as Request>::Error>,
{
    CombinedSource {
        name: format!("{}+{}", left.name(), right.name()),
        left,
        right,
    }
}

/// A data source built from a whole-batch function. See [`make_batched`].
pub struct BatchedFnSource<R, F> {
    name: String,
    run: F,
    _requests: PhantomData<fn(R) -> R>,
}

#[async_trait]
impl<R, F, Fut> DataSource for BatchedFnSource<R, F>
where
    R: Request,
    F: Fn(Vec<R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CompletedRequestMap, R::Error>> + Send + 'static,
{
    type Request = R;

    fn name(&self) -> &str {
        &self.name
    }

    async fn run_all(&self, requests: Vec<R>) -> Result<CompletedRequestMap, R::Error> {
        (self.run)(requests).await
    }
}

/// A data source built from a per-request function. See [`make`].
pub struct PerRequestFnSource<R, F> {
    name: String,
    run: F,
    _requests: PhantomData<fn(R) -> R>,
}

#[async_trait]
impl<R, F, Fut> DataSource for PerRequestFnSource<R, F>
where
    R: Request,
    F: Fn(R) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R::Value, R::Error>> + Send + 'static,
{
    type Request = R;

    fn name(&self) -> &str {
        &self.name
    }

    async fn run_all(&self, requests: Vec<R>) -> Result<CompletedRequestMap, R::Error> {
        let outcomes =
            future::join_all(requests.iter().map(|request| (self.run)(request.clone()))).await;

        let mut completed = CompletedRequestMap::new();
        for (request, outcome) in requests.into_iter().zip(outcomes) {
            completed.insert(request, outcome);
        }
        Ok(completed)
    }
}

/// Shaping combinators available on every [`DataSource`].
pub trait DataSourceExt: DataSource + Sized {
    /// Cap batches at `limit` requests.
    ///
    /// An oversized batch is split into sub-batches that run **in
    /// sequence**, not in parallel, so the cap also acts as a crude rate
    /// limit. The wrapped source reports itself as
    /// `"{name}.batchN({limit})"`.
    fn batch_n(self, limit: usize) -> BatchLimitedSource<Self> {
        BatchLimitedSource {
            name: format!("{}.batchN({})", self.name(), limit),
            inner: self,
            limit,
        }
    }
}

impl<D: DataSource> DataSourceExt for D {}

/// A source with a maximum batch size. See [`DataSourceExt::batch_n`].
pub struct BatchLimitedSource<D> {
    name: String,
    inner: D,
    limit: usize,
}

#[async_trait]
impl<D: DataSource> DataSource for BatchLimitedSource<D> {
    type Request = D::Request;

    fn name(&self) -> &str {
        &self.name
    }

    async fn run_all(
        &self,
        requests: Vec<D::Request>,
    ) -> Result<CompletedRequestMap, <D::Request as Request>::Error> {
        if self.limit == 0 || requests.len() <= self.limit {
            return self.inner.run_all(requests).await;
        }
        let mut completed = CompletedRequestMap::new();
        for chunk in requests.chunks(self.limit) {
            completed.merge(self.inner.run_all(chunk.to_vec()).await?);
        }
        Ok(completed)
    }
}

/// A request answered by one side of a [`CombinedSource`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EitherRequest<L, R> {
    Left(L),
    Right(R),
}

/// A value produced by one side of a [`CombinedSource`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EitherValue<L, R> {
    Left(L),
    Right(R),
}

impl<L, R> Request for EitherRequest<L, R>
where
    L: Request,
    R: Request<Error = L::Error>,
{
    type Value = EitherValue<L::Value, R::Value>;
    type Error = L::Error;
}

/// The union of two data sources. See [`combine`].
pub struct CombinedSource<A, B> {
    name: String,
    left: A,
    right: B,
}

#[async_trait]
impl<A, B> DataSource for CombinedSource<A, B>
where
    A: DataSource,
    B: DataSource,
    B::Request: Request<Error = <A::Request as Request>::Error>,
{
    type Request = EitherRequest<A::Request, B::Request>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn run_all(
        &self,
        requests: Vec<Self::Request>,
    ) -> Result<CompletedRequestMap, <A::Request as Request>::Error> {
        let mut lefts = Vec::new();
        let mut rights = Vec::new();
        for request in requests {
            match request {
                EitherRequest::Left(request) => lefts.push(request),
                EitherRequest::Right(request) => rights.push(request),
            }
        }

        let run_left = async {
            if lefts.is_empty() {
                Ok(CompletedRequestMap::new())
            } else {
                self.left.run_all(lefts.clone()).await
            }
        };
        let run_right = async {
            if rights.is_empty() {
                Ok(CompletedRequestMap::new())
            } else {
                self.right.run_all(rights.clone()).await
            }
        };
        let (left_done, right_done) = future::try_join(run_left, run_right).await?;

        // Re-key each side's outcomes under the union request type. An
        // outcome a side dropped stays dropped here, so the violation is
        // reported against the combined source.
        let mut completed = CompletedRequestMap::new();
        for request in lefts {
            if let Some(outcome) = left_done.lookup(&request) {
                completed.insert(
                    EitherRequest::<A::Request, B::Request>::Left(request),
                    outcome.map(EitherValue::Left),
                );
            }
        }
        for request in rights {
            if let Some(outcome) = right_done.lookup(&request) {
                completed.insert(
                    EitherRequest::<A::Request, B::Request>::Right(request),
                    outcome.map(EitherValue::Right),
                );
            }
        }
        Ok(completed)
    }
}

/// The object-safe executor face of a [`DataSource`], used by the pending
/// request tree where sources of different request types share one batch
/// schedule.
pub(crate) trait ErasedSource: Send + Sync {
    fn name(&self) -> &str;

    /// Execute one batch, filling the destination cell of every blocked
    /// request that resolves.
    fn run_batch(&self, batch: Vec<BlockedRequest>) -> future::BoxFuture<'static, ()>;
}

/// Adapter giving a typed [`DataSource`] its [`ErasedSource`] face.
pub(crate) struct SourceHandle<D>(Arc<D>);

impl<D: DataSource> SourceHandle<D> {
    pub(crate) fn erased(source: Arc<D>) -> Arc<dyn ErasedSource> {
        Arc::new(Self(source))
    }
}

impl<D: DataSource> ErasedSource for SourceHandle<D> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn run_batch(&self, batch: Vec<BlockedRequest>) -> future::BoxFuture<'static, ()> {
        let source = Arc::clone(&self.0);
        async move {
            // Duplicates in the batch share one execution; order of first
            // appearance is preserved for the source.
            let mut seen = HashSet::new();
            let mut requests: Vec<D::Request> = Vec::with_capacity(batch.len());
            for blocked in &batch {
                if let Some(request) = blocked.request().downcast_ref::<D::Request>() {
                    if seen.insert(request.clone()) {
                        requests.push(request.clone());
                    }
                }
            }
            if requests.is_empty() {
                return;
            }

            debug!(
                source = source.name(),
                requests = requests.len(),
                blocked = batch.len(),
                "executing batch"
            );
            match source.run_all(requests).await {
                Ok(completed) => {
                    for blocked in &batch {
                        if let Some(request) = blocked.request().downcast_ref::<D::Request>() {
                            if let Some(outcome) = completed.lookup(request) {
                                blocked.destination().fill(outcome);
                            }
                            // A dropped outcome leaves the cell pending; the
                            // waiting continuation reports the violated
                            // contract.
                        }
                    }
                }
                Err(error) => {
                    for blocked in &batch {
                        let outcome: Result<
                            <D::Request as Request>::Value,
                            <D::Request as Request>::Error,
                        > = Err(error.clone());
                        blocked.destination().fill(outcome);
                    }
                }
            }
        }
        .boxed()
    }
}

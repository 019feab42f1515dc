//! Composable queries and the batching interpreter.
//!
//! A [`Query`] is a description of a data-fetching computation. Nothing
//! happens when queries are composed; requests are only executed when the
//! finished query is [`run`](Query::run). That split is what lets the
//! interpreter look at an entire evaluation front before touching any data
//! source: every request the current step is blocked on is collected,
//! deduplicated, grouped by source, and dispatched as batches.
//!
//! Sequential composition ([`and_then`](Query::and_then), [`zip`](Query::zip))
//! expresses an ordering constraint: later requests run in later batches,
//! either as a fresh round or, for [`zip`](Query::zip)ped fetches against
//! one source, as ordered sub-batches of the same round. Parallel
//! composition ([`for_each_par`](Query::for_each_par),
//! [`collect_all_par`](Query::collect_all_par)) expresses independence, and
//! independent requests against one source collapse into a single batch.
//! The classic N+1 access pattern, fetch a list then fetch each element,
//! therefore executes in exactly two batches regardless of the list length.
//!
//! ## Example
//!
//! ```
//! use std::sync::{
//!     atomic::{AtomicUsize, Ordering},
//!     Arc,
//! };
//!
//! use gather::{
//!     query::Query,
//!     request::{CompletedRequestMap, Request},
//!     source::make_batched,
//! };
//!
//! #[derive(Clone, Debug, PartialEq, Eq, Hash)]
//! struct GetUserName(u32);
//!
//! impl Request for GetUserName {
//!     type Value = String;
//!     type Error = String;
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let calls = Arc::new(AtomicUsize::new(0));
//!     let source = {
//!         let calls = Arc::clone(&calls);
//!         Arc::new(make_batched(
//!             "UserDataSource",
//!             move |requests: Vec<GetUserName>| {
//!                 let calls = Arc::clone(&calls);
//!                 async move {
//!                     calls.fetch_add(1, Ordering::SeqCst);
//!                     let mut completed = CompletedRequestMap::new();
//!                     for request in requests {
//!                         let name = format!("user-{}", request.0);
//!                         completed.insert(request, Ok(name));
//!                     }
//!                     Ok(completed)
//!                 }
//!             },
//!         ))
//!     };
//!
//!     let names = Query::for_each_par(1..=3, |id| {
//!         Query::from_request(GetUserName(id), Arc::clone(&source))
//!     })
//!     .run()
//!     .await?;
//!
//!     assert_eq!(names, vec!["user-1", "user-2", "user-3"]);
//!     // Three naive lookups, one executed batch.
//!     assert_eq!(calls.load(Ordering::SeqCst), 1);
//!     Ok(())
//! }
//! ```
use std::{fmt, sync::Arc, time::Duration};

use futures::{
    future::{self, BoxFuture, Either},
    Future, FutureExt,
};
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::{
    blocked::{BlockedRequest, BlockedRequests},
    cache::{Cache, Lookup, PendingGuard, ResultCell},
    error::{Defect, Fault},
    request::{ErasedRequest, Request},
    source::{DataSource, SourceHandle},
};

/// Ambient state threaded through every evaluation step: the active cache
/// and whether new requests should consult it.
#[derive(Clone)]
struct Context {
    cache: Cache,
    caching: bool,
}

/// The result of evaluating a query one step.
enum Step<T, E> {
    /// The query finished with a value.
    Done(T),
    /// The query failed; no further rounds are initiated on this branch.
    Fail(Fault<E>),
    /// The query is suspended on the given requests. Once they resolve,
    /// evaluation resumes with the continuation.
    Blocked(BlockedRequests, Continue<T, E>),
}

/// The continuation of a suspended query, tagged by what resuming it may do.
enum Continue<T, E> {
    /// Resuming only reads destination cells the suspended requests already
    /// registered. Sequential combinators may inspect their right side
    /// early and pipeline its requests behind a `Get`'s tree, since nothing
    /// in the continuation depends on the results arriving first.
    Get(Query<T, E>),
    /// Resuming runs arbitrary query logic; its requests cannot be known
    /// until the suspended ones resolve.
    Effect(Query<T, E>),
}

impl<T, E> Continue<T, E> {
    fn into_query(self) -> Query<T, E> {
        match self {
            Self::Get(query) | Self::Effect(query) => query,
        }
    }

    fn is_get(&self) -> bool {
        matches!(self, Self::Get(_))
    }

    fn map_query<U, F2>(self, f: impl FnOnce(Query<T, E>) -> Query<U, F2>) -> Continue<U, F2> {
        match self {
            Self::Get(query) => Continue::Get(f(query)),
            Self::Effect(query) => Continue::Effect(f(query)),
        }
    }
}

/// A composable, batching data-fetching computation producing a `T` or
/// failing with an `E`.
///
/// Queries are inert descriptions; execution happens in [`run`](Query::run)
/// or [`run_with`](Query::run_with). A query is one-shot: running consumes
/// it.
pub struct Query<T, E> {
    step: Box<dyn FnOnce(Context) -> BoxFuture<'static, Step<T, E>> + Send>,
}

impl<T, E> Query<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn new<F, Fut>(step: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Step<T, E>> + Send + 'static,
    {
        Self {
            step: Box::new(move |context| step(context).boxed()),
        }
    }

    fn eval(self, context: Context) -> BoxFuture<'static, Step<T, E>> {
        (self.step)(context)
    }

    /// A query that immediately succeeds with the given value.
    pub fn succeed(value: T) -> Self {
        Self::new(move |_| future::ready(Step::Done(value)))
    }

    /// A query that immediately fails with the given domain error.
    pub fn fail(error: E) -> Self {
        Self::new(move |_| future::ready(Step::Fail(Fault::Error(error))))
    }

    fn from_fault(fault: Fault<E>) -> Self {
        Self::new(move |_| future::ready(Step::Fail(fault)))
    }

    /// Lift a `Result` into a query.
    pub fn from_result(result: Result<T, E>) -> Self {
        Self::new(move |_| {
            future::ready(match result {
                Ok(value) => Step::Done(value),
                Err(error) => Step::Fail(Fault::Error(error)),
            })
        })
    }

    /// Lift an `Option` into a query. An absent value is a defect, not a
    /// domain failure: binding against nothing is a programming error.
    pub fn from_option(option: Option<T>) -> Self {
        Self::new(move |_| {
            future::ready(match option {
                Some(value) => Step::Done(value),
                None => Step::Fail(Fault::Defect(Defect::MissingValue)),
            })
        })
    }

    /// Embed an arbitrary effect into a query.
    ///
    /// The effect runs when this point of the query is evaluated; it takes
    /// no part in batching.
    pub fn from_effect<Fut>(effect: Fut) -> Self
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::new(move |_| async move {
            match effect.await {
                Ok(value) => Step::Done(value),
                Err(error) => Step::Fail(Fault::Error(error)),
            }
        })
    }

    /// A query that never completes.
    pub fn never() -> Self {
        Self::new(|_| future::pending())
    }

    /// The fundamental constructor: a query that fetches `request` from
    /// `source`.
    ///
    /// With caching active (the default), the run's cache is consulted
    /// first. A cached outcome resolves immediately, a request already in
    /// flight is awaited rather than re-executed, and a novel request is
    /// registered and suspended so the interpreter can batch it with
    /// whatever else the current round is blocked on.
    pub fn from_request<R, D>(request: R, source: Arc<D>) -> Query<R::Value, R::Error>
    where
        T: Clone + Sync,
        E: Clone + Sync,
        R: Request<Value = T, Error = E>,
        D: DataSource<Request = R>,
    {
        Query::new(move |context| async move {
            let erased = ErasedRequest::new(request.clone());

            if !context.caching {
                // Caching opted out: a private cell, executed every time.
                let cell = ResultCell::new();
                let blocked = BlockedRequest::new(erased, cell.clone());
                return Step::Blocked(
                    BlockedRequests::single(SourceHandle::erased(Arc::clone(&source)), blocked),
                    Continue::Get(read_destination(source, request, cell)),
                );
            }

            match context.cache.lookup_or_insert(erased.clone()) {
                Lookup::Miss(cell) => {
                    let guard =
                        PendingGuard::new(context.cache.clone(), erased.clone(), cell.clone());
                    let blocked = BlockedRequest::guarded(erased, cell.clone(), guard);
                    Step::Blocked(
                        BlockedRequests::single(
                            SourceHandle::erased(Arc::clone(&source)),
                            blocked,
                        ),
                        Continue::Get(read_destination(source, request, cell)),
                    )
                }
                Lookup::Hit(cell) => match cell.read::<Result<R::Value, R::Error>>() {
                    Some(Ok(value)) => Step::Done(value),
                    Some(Err(error)) => Step::Fail(Fault::Error(error)),
                    // In flight under another evaluation: suspend with
                    // nothing of our own to execute and share its outcome.
                    None => Step::Blocked(
                        BlockedRequests::Empty,
                        Continue::Effect(await_destination(request, source, cell)),
                    ),
                },
            }
        })
    }

    /// Transform the success value.
    pub fn map<U, F>(self, f: F) -> Query<U, E>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Query::new(move |context| async move {
            match self.eval(context).await {
                Step::Done(value) => Step::Done(f(value)),
                Step::Fail(fault) => Step::Fail(fault),
                Step::Blocked(tree, next) => {
                    Step::Blocked(tree, next.map_query(|next| next.map(f)))
                }
            }
        })
    }

    /// Transform the domain error. Defects pass through untouched, and the
    /// structure of the query is preserved, so mapping errors never costs
    /// a batching opportunity.
    pub fn map_error<F2, F>(self, f: F) -> Query<T, F2>
    where
        F2: Send + 'static,
        F: FnOnce(E) -> F2 + Send + 'static,
    {
        Query::new(move |context| async move {
            match self.eval(context).await {
                Step::Done(value) => Step::Done(value),
                Step::Fail(fault) => Step::Fail(fault.map(f)),
                Step::Blocked(tree, next) => {
                    Step::Blocked(tree, next.map_query(|next| next.map_error(f)))
                }
            }
        })
    }

    /// Sequential composition: feed the result of this query into `f`. The
    /// continuation cannot be inspected before the value exists, so the
    /// requests it makes always land in a later round.
    pub fn and_then<U, F>(self, f: F) -> Query<U, E>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Query<U, E> + Send + 'static,
    {
        Query::new(move |context| async move {
            match self.eval(context.clone()).await {
                Step::Done(value) => f(value).eval(context).await,
                Step::Fail(fault) => Step::Fail(fault),
                Step::Blocked(tree, next) => {
                    Step::Blocked(tree, Continue::Effect(next.into_query().and_then(f)))
                }
            }
        })
    }

    /// Sequential pairing.
    pub fn zip<U>(self, that: Query<U, E>) -> Query<(T, U), E>
    where
        U: Send + 'static,
    {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Sequential pairing through a combining function.
    ///
    /// When the left side suspends on requests and its continuation is a
    /// pure destination read, the right side is inspected in the same step
    /// and its requests are sequenced behind the left side's. Consecutive
    /// fetches against one data source therefore flatten into ordered
    /// sub-batches of a single round instead of separate interpreter
    /// iterations.
    pub fn zip_with<U, V, F>(self, that: Query<U, E>, f: F) -> Query<V, E>
    where
        U: Send + 'static,
        V: Send + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        Query::new(move |context| async move {
            match self.eval(context.clone()).await {
                Step::Done(a) => match that.eval(context).await {
                    Step::Done(b) => Step::Done(f(a, b)),
                    Step::Fail(fault) => Step::Fail(fault),
                    Step::Blocked(tree, next) => {
                        Step::Blocked(tree, next.map_query(move |next| next.map(move |b| f(a, b))))
                    }
                },
                Step::Fail(fault) => Step::Fail(fault),
                Step::Blocked(tree, Continue::Effect(next)) => {
                    Step::Blocked(tree, Continue::Effect(next.zip_with(that, f)))
                }
                Step::Blocked(tree, Continue::Get(next)) => match that.eval(context).await {
                    Step::Done(b) => {
                        Step::Blocked(tree, Continue::Get(next.map(move |a| f(a, b))))
                    }
                    // The left side's requests still execute; its failure,
                    // if any, takes precedence over the right side's.
                    Step::Fail(fault) => Step::Blocked(
                        tree,
                        Continue::Effect(next.and_then(move |_| Query::from_fault(fault))),
                    ),
                    Step::Blocked(that_tree, that_next) => {
                        let keep_get = that_next.is_get();
                        let combined = next.zip_with(that_next.into_query(), f);
                        let combined = if keep_get {
                            Continue::Get(combined)
                        } else {
                            Continue::Effect(combined)
                        };
                        Step::Blocked(tree.then(that_tree), combined)
                    }
                },
            }
        })
    }

    /// Parallel pairing.
    pub fn zip_par<U>(self, that: Query<U, E>) -> Query<(T, U), E>
    where
        U: Send + 'static,
    {
        self.zip_with_par(that, |a, b| (a, b))
    }

    /// Parallel pairing through a combining function.
    ///
    /// Both sides are evaluated as independent concurrent sub-runs sharing
    /// this run's cache, so duplicated requests across the two sides still
    /// execute once. If both sides fail, the left failure is surfaced,
    /// deterministically.
    pub fn zip_with_par<U, V, F>(self, that: Query<U, E>, f: F) -> Query<V, E>
    where
        U: Send + 'static,
        V: Send + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        Query::new(move |context| async move {
            let (left, right) =
                future::join(run_loop(self, context.clone()), run_loop(that, context)).await;
            match (left, right) {
                (Ok(a), Ok(b)) => Step::Done(f(a, b)),
                (Err(fault), _) => Step::Fail(fault),
                (_, Err(fault)) => Step::Fail(fault),
            }
        })
    }

    /// Apply `f` to every item and evaluate the resulting queries in
    /// parallel, preserving order.
    ///
    /// This is the N+1 killer: requests made by the per-item queries are
    /// merged round-by-round, so same-source lookups collapse into single
    /// batches no matter how many items there are.
    pub fn for_each_par<A, I, F>(items: I, f: F) -> Query<Vec<T>, E>
    where
        I: IntoIterator<Item = A>,
        F: FnMut(A) -> Query<T, E>,
    {
        Self::collect_all_par(items.into_iter().map(f))
    }

    /// Evaluate all queries in parallel, collecting results in order.
    ///
    /// Blocked branches contribute their request trees to one combined
    /// parallel tree; the leftmost failure wins when several branches fail
    /// in the same step.
    pub fn collect_all_par<I>(queries: I) -> Query<Vec<T>, E>
    where
        I: IntoIterator<Item = Query<T, E>>,
    {
        let queries: Vec<_> = queries.into_iter().collect();
        Query::new(move |context| async move {
            let steps =
                future::join_all(queries.into_iter().map(|query| query.eval(context.clone())))
                    .await;

            let mut pending = Vec::with_capacity(steps.len());
            for step in steps {
                match step {
                    Step::Fail(fault) => return Step::Fail(fault),
                    step => pending.push(step),
                }
            }

            if pending.iter().all(|step| matches!(step, Step::Done(_))) {
                let mut values = Vec::with_capacity(pending.len());
                for step in pending {
                    if let Step::Done(value) = step {
                        values.push(value);
                    }
                }
                return Step::Done(values);
            }

            let mut tree = BlockedRequests::Empty;
            let mut continuations = Vec::with_capacity(pending.len());
            let mut all_gets = true;
            for step in pending {
                match step {
                    Step::Done(value) => continuations.push(Query::succeed(value)),
                    Step::Blocked(branch, next) => {
                        tree = tree.both(branch);
                        all_gets &= next.is_get();
                        continuations.push(next.into_query());
                    }
                    Step::Fail(fault) => return Step::Fail(fault),
                }
            }
            let next = Query::collect_all_par(continuations);
            let next = if all_gets {
                Continue::Get(next)
            } else {
                Continue::Effect(next)
            };
            Step::Blocked(tree, next)
        })
    }

    /// Evaluate all queries one after another, collecting results in order.
    pub fn collect_all<I>(queries: I) -> Query<Vec<T>, E>
    where
        I: IntoIterator<Item = Query<T, E>>,
    {
        queries
            .into_iter()
            .fold(Query::succeed(Vec::new()), |acc, query| {
                acc.and_then(move |mut values| {
                    query.map(move |value| {
                        values.push(value);
                        values
                    })
                })
            })
    }

    /// Convert a data source's missing-result defect into `None`.
    ///
    /// This is how "fetch by key" sources express absence: a source that
    /// legitimately has no row for a key simply leaves the request
    /// unresolved, and `optional` turns the resulting defect into an
    /// absent value. Domain failures and other defects pass through.
    pub fn optional(self) -> Query<Option<T>, E> {
        Query::new(move |context| async move {
            match self.eval(context).await {
                Step::Done(value) => Step::Done(Some(value)),
                Step::Fail(Fault::Defect(Defect::MissingResult { .. })) => Step::Done(None),
                Step::Fail(fault) => Step::Fail(fault),
                Step::Blocked(tree, next) => {
                    Step::Blocked(tree, next.map_query(|next| next.optional()))
                }
            }
        })
    }

    /// Bound the query's total running time.
    ///
    /// Expiry yields `Ok(None)` rather than a failure. The query runs as a
    /// complete sub-evaluation raced against the deadline, so expiry cuts
    /// it off wherever it stands: mid evaluation, or mid round while a data
    /// source hangs. No further rounds are initiated after expiry. A batch
    /// already dispatched runs to completion in the background and its
    /// outcomes still land in the cache; requests registered but never
    /// dispatched are unregistered so later runs re-issue them.
    pub fn timeout(self, duration: Duration) -> Query<Option<T>, E> {
        Query::new(move |context| async move {
            let deadline = Instant::now() + duration;
            match tokio::time::timeout_at(deadline, run_loop(self, context)).await {
                Ok(Ok(value)) => Step::Done(Some(value)),
                Ok(Err(fault)) => Step::Fail(fault),
                Err(_) => Step::Done(None),
            }
        })
    }

    /// Measure how long the query takes, across every round it triggers.
    pub fn timed(self) -> Query<(Duration, T), E> {
        Query::new(move |context| async move {
            let started = Instant::now();
            self.timed_from(started).eval(context).await
        })
    }

    fn timed_from(self, started: Instant) -> Query<(Duration, T), E> {
        Query::new(move |context| async move {
            match self.eval(context).await {
                Step::Done(value) => Step::Done((started.elapsed(), value)),
                Step::Fail(fault) => Step::Fail(fault),
                Step::Blocked(tree, next) => {
                    Step::Blocked(tree, next.map_query(|next| next.timed_from(started)))
                }
            }
        })
    }

    /// Evaluate both queries concurrently against the shared cache and
    /// take whichever finishes first; the loser is cancelled.
    pub fn race(self, that: Query<T, E>) -> Query<T, E> {
        Query::new(move |context| async move {
            let left = Box::pin(run_loop(self, context.clone()));
            let right = Box::pin(run_loop(that, context));
            let result = match future::select(left, right).await {
                Either::Left((result, _)) | Either::Right((result, _)) => result,
            };
            match result {
                Ok(value) => Step::Done(value),
                Err(fault) => Step::Fail(fault),
            }
        })
    }

    /// Opt this region of the query out of caching: its requests execute
    /// every time, into private cells, without touching the run's cache.
    pub fn uncached(self) -> Self {
        self.with_caching(false)
    }

    /// Re-enable caching inside a region wrapped by
    /// [`uncached`](Query::uncached).
    pub fn cached(self) -> Self {
        self.with_caching(true)
    }

    fn with_caching(self, enabled: bool) -> Self {
        Query::new(move |mut context| async move {
            context.caching = enabled;
            match self.eval(context).await {
                Step::Blocked(tree, next) => {
                    Step::Blocked(tree, next.map_query(|next| next.with_caching(enabled)))
                }
                step => step,
            }
        })
    }

    /// Run the query against a fresh cache.
    pub async fn run(self) -> Result<T, Fault<E>> {
        self.run_with(&Cache::new()).await
    }

    /// Run the query against an explicit cache.
    ///
    /// Sharing one cache across several runs extends deduplication across
    /// them: a request resolved by an earlier run is a hit for later runs
    /// until [`Cache::remove`]d.
    #[instrument(skip_all, level = "debug")]
    pub async fn run_with(self, cache: &Cache) -> Result<T, Fault<E>> {
        run_loop(
            self,
            Context {
                cache: cache.clone(),
                caching: true,
            },
        )
        .await
    }
}

impl<T, E> fmt::Debug for Query<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query").finish_non_exhaustive()
    }
}

/// The interpreter: evaluate a step, dispatch whatever it is blocked on,
/// resume, until the query completes.
async fn run_loop<T, E>(query: Query<T, E>, context: Context) -> Result<T, Fault<E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let mut query = query;
    loop {
        match query.eval(context.clone()).await {
            Step::Done(value) => return Ok(value),
            Step::Fail(fault) => return Err(fault),
            Step::Blocked(tree, next) => {
                let rounds = tree.flatten();
                debug!(rounds = rounds.len(), "dispatching blocked requests");
                for round in rounds {
                    // Rounds run as detached tasks so an abandoned run
                    // cannot strand cells that concurrent evaluations are
                    // already waiting on.
                    if tokio::spawn(round.execute()).await.is_err() {
                        debug!("round execution task failed");
                    }
                }
                query = next.into_query();
            }
        }
    }
}

/// Continuation for the evaluation that owns executing a request. After its
/// round ran, the cell must hold an outcome; a pending cell here means the
/// data source broke its contract.
fn read_destination<R, D>(
    source: Arc<D>,
    request: R,
    cell: ResultCell,
) -> Query<R::Value, R::Error>
where
    R: Request,
    D: DataSource<Request = R>,
{
    Query::new(move |_| async move {
        match cell.read::<Result<R::Value, R::Error>>() {
            Some(Ok(value)) => Step::Done(value),
            Some(Err(error)) => Step::Fail(Fault::Error(error)),
            None => Step::Fail(Fault::Defect(Defect::MissingResult {
                data_source: source.name().to_string(),
                request: format!("{request:?}"),
            })),
        }
    })
}

/// Continuation for a duplicate of a request that another evaluation owns:
/// wait for the owner to resolve the shared cell. If the owner is dropped
/// before executing the request, the cell is abandoned and the request is
/// re-issued here.
fn await_destination<R, D>(request: R, source: Arc<D>, cell: ResultCell) -> Query<R::Value, R::Error>
where
    R: Request,
    D: DataSource<Request = R>,
{
    Query::new(move |context| async move {
        match cell.wait::<Result<R::Value, R::Error>>().await {
            Some(Ok(value)) => Step::Done(value),
            Some(Err(error)) => Step::Fail(Fault::Error(error)),
            None => Query::from_request(request, source).eval(context).await,
        }
    })
}

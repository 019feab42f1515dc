//! Pending-request trees and their flattening into executable rounds.
//!
//! When a query evaluation suspends, it leaves behind a tree describing
//! every request it is blocked on and the order constraints between them:
//! [`BlockedRequests::Then`] for requests separated by a data dependency,
//! [`BlockedRequests::Both`] for requests that are independent. The shape
//! of the tree mirrors the shape of the query that produced it.
//!
//! Flattening turns that tree into a list of [`Round`]s. Each round is the
//! maximal parallel frontier of the remaining tree: everything in it may
//! run at once, and requests aimed at the same data source are merged into
//! a single batch. This is where the N+1 collapse happens; a thousand
//! independent lookups against one source flatten to one round holding one
//! batch of a thousand requests.
//!
//! One refinement is applied while collecting rounds: when consecutive
//! frontiers touch exactly the same single data source, the later frontier
//! is folded into the earlier round as an ordered sub-batch instead of
//! opening a new round.
use std::{
    collections::{hash_map, HashMap},
    sync::Arc,
};

use futures::future;
use tracing::debug;

use crate::{
    cache::{PendingGuard, ResultCell},
    request::ErasedRequest,
    source::ErasedSource,
};

/// A single suspended request paired with the write-once cell its outcome
/// must land in.
///
/// A cache-registered request also carries its [`PendingGuard`]: if the
/// request is dropped before a round executed it, the guard unregisters the
/// pending cache entry.
#[derive(Clone)]
pub(crate) struct BlockedRequest {
    request: ErasedRequest,
    destination: ResultCell,
    _guard: Option<Arc<PendingGuard>>,
}

impl BlockedRequest {
    pub(crate) fn new(request: ErasedRequest, destination: ResultCell) -> Self {
        Self {
            request,
            destination,
            _guard: None,
        }
    }

    pub(crate) fn guarded(
        request: ErasedRequest,
        destination: ResultCell,
        guard: PendingGuard,
    ) -> Self {
        Self {
            request,
            destination,
            _guard: Some(Arc::new(guard)),
        }
    }

    pub(crate) fn request(&self) -> &ErasedRequest {
        &self.request
    }

    pub(crate) fn destination(&self) -> &ResultCell {
        &self.destination
    }
}

/// Everything a suspended evaluation is blocked on, with ordering intact.
#[derive(Clone)]
pub(crate) enum BlockedRequests {
    Empty,
    Single {
        source: Arc<dyn ErasedSource>,
        request: BlockedRequest,
    },
    /// The left side must fully resolve before the right side may start.
    Then(Box<BlockedRequests>, Box<BlockedRequests>),
    /// Both sides are independent and may resolve together.
    Both(Box<BlockedRequests>, Box<BlockedRequests>),
}

impl BlockedRequests {
    pub(crate) fn single(source: Arc<dyn ErasedSource>, request: BlockedRequest) -> Self {
        Self::Single { source, request }
    }

    /// Sequential composition. Empty sides collapse away.
    pub(crate) fn then(self, that: Self) -> Self {
        match (self, that) {
            (Self::Empty, other) | (other, Self::Empty) => other,
            (left, right) => Self::Then(Box::new(left), Box::new(right)),
        }
    }

    /// Parallel composition. Empty sides collapse away.
    pub(crate) fn both(self, that: Self) -> Self {
        match (self, that) {
            (Self::Empty, other) | (other, Self::Empty) => other,
            (left, right) => Self::Both(Box::new(left), Box::new(right)),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Flatten the tree into rounds. Pure: the same tree always yields the
    /// same rounds.
    pub(crate) fn flatten(self) -> Vec<Round> {
        let mut rounds = Vec::new();
        let mut tree = self;
        loop {
            let (frontier, rest) = tree.step();
            merge_round(&mut rounds, frontier);
            if rest.is_empty() {
                return rounds;
            }
            tree = rest;
        }
    }

    /// Peel the maximal parallel frontier off the tree, returning it along
    /// with the residual tree it unblocks.
    fn step(self) -> (Frontier, BlockedRequests) {
        match self {
            Self::Empty => (Frontier::default(), Self::Empty),
            Self::Single { source, request } => {
                (Frontier::single(source, request), Self::Empty)
            }
            Self::Both(left, right) => {
                let (left_frontier, left_rest) = left.step();
                let (right_frontier, right_rest) = right.step();
                (left_frontier.combine(right_frontier), left_rest.both(right_rest))
            }
            Self::Then(left, right) => match *left {
                Self::Empty => right.step(),
                // Reassociate left-nested sequences so the leftmost leaves
                // are peeled first.
                Self::Then(inner_left, inner_right) => {
                    Self::Then(inner_left, Box::new(Self::Then(inner_right, right))).step()
                }
                leaf => {
                    let (frontier, rest) = leaf.step();
                    (frontier, rest.then(*right))
                }
            },
        }
    }
}

/// The parallel frontier of a tree: per data source, one merged batch.
#[derive(Default)]
struct Frontier {
    batches: HashMap<String, (Arc<dyn ErasedSource>, Vec<BlockedRequest>)>,
}

impl Frontier {
    fn single(source: Arc<dyn ErasedSource>, request: BlockedRequest) -> Self {
        let mut batches = HashMap::new();
        batches.insert(source.name().to_string(), (source, vec![request]));
        Self { batches }
    }

    /// Merge two frontiers; batches aimed at the same source concatenate.
    fn combine(mut self, other: Self) -> Self {
        for (name, (source, mut requests)) in other.batches {
            match self.batches.entry(name) {
                hash_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().1.append(&mut requests);
                }
                hash_map::Entry::Vacant(entry) => {
                    entry.insert((source, requests));
                }
            }
        }
        self
    }

    fn single_source_name(&self) -> Option<&String> {
        if self.batches.len() == 1 {
            self.batches.keys().next()
        } else {
            None
        }
    }

    fn into_round(self) -> Round {
        Round {
            batches: self
                .batches
                .into_iter()
                .map(|(name, (source, requests))| (name, (source, vec![requests])))
                .collect(),
        }
    }
}

/// One executable round: per data source, the ordered batches to run.
pub(crate) struct Round {
    batches: HashMap<String, (Arc<dyn ErasedSource>, Vec<Vec<BlockedRequest>>)>,
}

impl Round {
    /// Run the round. Distinct sources run concurrently; the batches of a
    /// single source run in order.
    pub(crate) async fn execute(self) {
        debug!(sources = self.batches.len(), "executing round");
        future::join_all(self.batches.into_values().map(|(source, batches)| {
            async move {
                for batch in batches {
                    source.run_batch(batch).await;
                }
            }
        }))
        .await;
    }
}

fn merge_round(rounds: &mut Vec<Round>, frontier: Frontier) {
    if frontier.batches.is_empty() {
        return;
    }

    // Consecutive frontiers touching exactly one and the same data source
    // pipeline into the previous round as an ordered sub-batch.
    let same_single_source = match (rounds.last(), frontier.single_source_name()) {
        (Some(last), Some(name)) if last.batches.len() == 1 => last.batches.contains_key(name),
        _ => false,
    };
    if same_single_source {
        if let Some(last) = rounds.last_mut() {
            for (name, (_source, requests)) in frontier.batches {
                if let Some((_, batches)) = last.batches.get_mut(&name) {
                    batches.push(requests);
                }
            }
        }
        return;
    }

    rounds.push(frontier.into_round());
}

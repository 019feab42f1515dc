//! The request contract and per-batch result maps.
//!
//! A [`Request`] is a plain value describing a single fetch: which entity,
//! by which key. Requests are compared structurally, and that structural
//! identity is what drives both deduplication within a batch and caching
//! across a run. Two requests that are `==` will be executed at most once.
//!
//! Data sources answer a batch of requests by building a
//! [`CompletedRequestMap`], associating each request with its outcome. The
//! map is intentionally request-keyed rather than positional so a source can
//! resolve requests in any order, resolve extras it happened to learn about,
//! or (erroneously) drop some. A dropped request is detected downstream and
//! reported as a contract violation.
//!
//! ## Example
//!
//! ```
//! use gather::request::Request;
//!
//! #[derive(Clone, Debug, PartialEq, Eq, Hash)]
//! struct GetUserName {
//!     id: u32,
//! }
//!
//! impl Request for GetUserName {
//!     type Value = String;
//!     type Error = String;
//! }
//! ```
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt::{self, Debug},
    hash::{Hash, Hasher},
    sync::Arc,
};

/// A description of a single fetch against some data source.
///
/// Implementations are inert values; all execution lives in the
/// [`DataSource`](crate::source::DataSource) that answers them. Structural
/// equality and hashing are the identity used for deduplication and caching,
/// so two logically identical requests must compare equal.
pub trait Request: Clone + Debug + Eq + Hash + Send + Sync + 'static {
    /// The type a successful fetch resolves to.
    type Value: Clone + Send + Sync + 'static;
    /// The domain error a fetch may fail with.
    type Error: Clone + Send + Sync + 'static;
}

/// Object-safe mirror of [`Request`] used to store heterogeneous requests in
/// one map.
///
/// Equality and hashing are forwarded to the concrete type through `Any`
/// downcasting; the hash is seeded with the concrete `TypeId` so equal-ish
/// values of different request types never collide into one identity.
pub(crate) trait AnyRequest: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_erased(&self, other: &dyn AnyRequest) -> bool;
    fn hash_erased(&self, state: &mut dyn Hasher);
    fn fmt_erased(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<R: Request> AnyRequest for R {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_erased(&self, other: &dyn AnyRequest) -> bool {
        other
            .as_any()
            .downcast_ref::<R>()
            .map_or(false, |other| self == other)
    }

    fn hash_erased(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<R>().hash(&mut state);
        self.hash(&mut state);
    }

    fn fmt_erased(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// A cheaply cloneable, type-erased request, usable as a map key across
/// request types.
#[derive(Clone)]
pub(crate) struct ErasedRequest(Arc<dyn AnyRequest>);

impl ErasedRequest {
    pub(crate) fn new<R: Request>(request: R) -> Self {
        Self(Arc::new(request))
    }

    pub(crate) fn downcast_ref<R: Request>(&self) -> Option<&R> {
        self.0.as_any().downcast_ref()
    }
}

impl PartialEq for ErasedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_erased(other.0.as_ref())
    }
}

impl Eq for ErasedRequest {}

impl Hash for ErasedRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_erased(state);
    }
}

impl Debug for ErasedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_erased(f)
    }
}

/// The outcomes of one executed batch, keyed by request.
///
/// Built by a [`DataSource`](crate::source::DataSource) while answering
/// [`run_all`](crate::source::DataSource::run_all); consumed once to resolve
/// the destinations of every request blocked on the batch.
#[derive(Default)]
pub struct CompletedRequestMap {
    entries: HashMap<ErasedRequest, Box<dyn Any + Send + Sync>>,
}

impl CompletedRequestMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a single request. A later insert for an equal
    /// request overwrites the earlier outcome.
    pub fn insert<R: Request>(&mut self, request: R, result: Result<R::Value, R::Error>) {
        self.entries.insert(ErasedRequest::new(request), Box::new(result));
    }

    /// The recorded outcome for a request, cloned out.
    pub fn lookup<R: Request>(&self, request: &R) -> Option<Result<R::Value, R::Error>> {
        self.entries
            .get(&ErasedRequest::new(request.clone()))
            .and_then(|outcome| outcome.downcast_ref::<Result<R::Value, R::Error>>())
            .cloned()
    }

    /// Whether an outcome was recorded for the given request.
    pub fn contains<R: Request>(&self, request: &R) -> bool {
        self.entries.contains_key(&ErasedRequest::new(request.clone()))
    }

    /// Absorb the outcomes of another map, overwriting on key collision.
    pub fn merge(&mut self, other: CompletedRequestMap) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Debug for CompletedRequestMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct GetName(u32);

    impl Request for GetName {
        type Value = String;
        type Error = String;
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct GetAge(u32);

    impl Request for GetAge {
        type Value = u32;
        type Error = String;
    }

    #[test]
    fn erased_identity_is_structural() {
        let a = ErasedRequest::new(GetName(1));
        let b = ErasedRequest::new(GetName(1));
        let c = ErasedRequest::new(GetName(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn erased_identity_distinguishes_request_types() {
        // Same payload, different request type: never the same key.
        let name = ErasedRequest::new(GetName(1));
        let age = ErasedRequest::new(GetAge(1));
        assert_ne!(name, age);
    }

    #[test]
    fn map_lookup_round_trips_typed_outcomes() {
        let mut map = CompletedRequestMap::new();
        map.insert(GetName(1), Ok("alice".to_string()));
        map.insert(GetAge(1), Err("unavailable".to_string()));

        assert_eq!(map.lookup(&GetName(1)), Some(Ok("alice".to_string())));
        assert_eq!(map.lookup(&GetAge(1)), Some(Err("unavailable".to_string())));
        assert_eq!(map.lookup(&GetName(2)), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn merge_overwrites_on_collision() {
        let mut left = CompletedRequestMap::new();
        left.insert(GetName(1), Ok("old".to_string()));

        let mut right = CompletedRequestMap::new();
        right.insert(GetName(1), Ok("new".to_string()));
        right.insert(GetName(2), Ok("other".to_string()));

        left.merge(right);
        assert_eq!(left.lookup(&GetName(1)), Some(Ok("new".to_string())));
        assert_eq!(left.len(), 2);
    }
}

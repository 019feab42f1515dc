#![cfg_attr(docsrs, feature(doc_cfg))]

//! Automatic request batching and deduplication for async Rust.
//!
//! Gather lets you write data-fetching code as if every lookup stood alone,
//! then executes it with the access pattern you would have hand-optimized.
//! Queries are inert descriptions; when one is run, the interpreter collects
//! everything the current evaluation is blocked on, deduplicates equal
//! requests, groups the rest by data source, and dispatches each group as a
//! single batch.
//!
//! Features:
//! - **N+1 elimination**: fetch a list, then fetch each element; the element
//!   fetches execute as one batch, regardless of list length.
//! - **Deduplication**: structurally equal requests execute at most once per
//!   run, including across concurrently evaluated branches.
//! - **Caching**: outcomes, including failures, are cached for the life of a
//!   run, or across runs via an explicit [`Cache`](crate::cache::Cache);
//!   regions can opt out with [`uncached`](crate::query::Query::uncached).
//! - **Plain async**: data sources are ordinary async functions; queries run
//!   on the ambient tokio runtime.
//!
//! # How to use Gather
//!
//! You will interact with two core APIs:
//! [`Request`](crate::request::Request)s describe *what* can be fetched, and
//! [`DataSource`](crate::source::DataSource)s describe *how* a whole batch
//! of them is fetched. [`Query`](crate::query::Query) combinators compose
//! fetches into programs: [`and_then`](crate::query::Query::and_then) where
//! one fetch depends on another,
//! [`for_each_par`](crate::query::Query::for_each_par) and friends where
//! fetches are independent and should batch.
//!
//! ## Defining requests
//!
//! A request is a plain value; equality is identity for batching and
//! caching.
//!
//! ```
//! use gather::request::Request;
//!
//! #[derive(Clone, Debug, PartialEq, Eq, Hash)]
//! enum UserRequest {
//!     GetNameById { id: u32 },
//! }
//!
//! impl Request for UserRequest {
//!     type Value = String;
//!     type Error = String;
//! }
//! ```
//!
//! ## Defining data sources
//!
//! A source answers a deduplicated batch in one call, typically by hitting a
//! backend's native multi-get.
//!
//! ```
//! # use gather::request::Request;
//! use gather::{request::CompletedRequestMap, source::make_batched};
//! #
//! # #[derive(Clone, Debug, PartialEq, Eq, Hash)]
//! # enum UserRequest {
//! #     GetNameById { id: u32 },
//! # }
//! #
//! # impl Request for UserRequest {
//! #     type Value = String;
//! #     type Error = String;
//! # }
//!
//! let source = make_batched("UserDataSource", |requests: Vec<UserRequest>| async move {
//!     // One round trip for the whole batch.
//!     let mut completed = CompletedRequestMap::new();
//!     for request in requests {
//!         let UserRequest::GetNameById { id } = &request;
//!         let name = format!("user-{id}");
//!         completed.insert(request, Ok(name));
//!     }
//!     Ok(completed)
//! });
//! ```
//!
//! ## Composing and running queries
//!
//! ```
//! # use std::sync::Arc;
//! # use gather::{
//! #     query::Query,
//! #     request::{CompletedRequestMap, Request},
//! #     source::make_batched,
//! # };
//! # #[derive(Clone, Debug, PartialEq, Eq, Hash)]
//! # enum UserRequest {
//! #     GetNameById { id: u32 },
//! # }
//! # impl Request for UserRequest {
//! #     type Value = String;
//! #     type Error = String;
//! # }
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let source = Arc::new(make_batched(
//! #     "UserDataSource",
//! #     |requests: Vec<UserRequest>| async move {
//! #         let mut completed = CompletedRequestMap::new();
//! #         for request in requests {
//! #             let UserRequest::GetNameById { id } = &request;
//! #             let name = format!("user-{id}");
//! #             completed.insert(request, Ok(name));
//! #         }
//! #         Ok(completed)
//! #     },
//! # ));
//! let names = Query::for_each_par(1..=100, |id| {
//!     Query::from_request(UserRequest::GetNameById { id }, Arc::clone(&source))
//! })
//! .run()
//! .await?;
//!
//! assert_eq!(names.len(), 100);
//! # Ok(())
//! # }
//! ```
//!
//! See the [`query`] module documentation for the full combinator surface
//! and the [`source`] module for batch-size capping and source composition.

mod blocked;
pub mod cache;
pub mod error;
pub mod query;
pub mod request;
pub mod source;

pub use async_trait::async_trait;
pub use futures;
pub use tracing;

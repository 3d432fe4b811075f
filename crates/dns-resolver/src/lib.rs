#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::similar_names)]

//! The authoritative query-resolution core described in the design
//! this crate implements: given a question and a client's network
//! context, walk the zone hierarchy, resolve CNAME/ANAME indirection,
//! apply geo/ASN/weighted filtering, and assemble a DNS answer.
//!
//! Five pieces compose the core, each in its own module:
//!
//! - [`zone_index`] (component A) answers "which zone, if any, is
//!   authoritative for this name".
//! - [`record_store`] (component B) fetches a node's record bundle
//!   and a zone's config from the external key-value store.
//! - [`engine`] (component C) drives resolution: authority checks,
//!   wildcard synthesis, CNAME/ANAME chaining, record emission.
//! - [`filter`] (component D) applies geo/ASN/location filtering and
//!   count/order selection to A/AAAA candidate sets.
//! - [`reload`] (component E) keeps the zone index and record store
//!   cache in sync with the external store.
//!
//! [`context`] is per-query bookkeeping used by the engine;
//! [`geo`], [`edns`], and [`upstream`] are the external-database and
//! fallback-resolver collaborators the engine consumes.

pub mod context;
pub mod edns;
pub mod engine;
pub mod filter;
pub mod geo;
pub mod metrics;
pub mod record_store;
pub mod reload;
pub mod upstream;
pub mod zone_index;

pub use context::Context;
pub use engine::{Resolution, ResolverEngine};

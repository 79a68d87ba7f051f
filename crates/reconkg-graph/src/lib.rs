//! Knowledge-graph store and builder
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      GRAPH PIPELINE                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  schemas ──┐                                                │
//! │  pairs ────┼──► builder ──► pattern edges ──┐               │
//! │  prefs ────┘        │                       ├──► dedup ──►  │
//! │                     └──► LLM enhancement ───┘     store     │
//! │                              │                              │
//! │                              └──► table aliases             │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The builder is the single entry point for both single- and multi-schema
//! requests (a single-schema build is the N=1 case). The store persists one
//! JSON document per KG name with read-your-writes semantics; any backend
//! that round-trips `nodes`/`relationships`/`metadata` can replace it.

pub mod builder;
pub mod enhance;
pub mod store;

pub use builder::{BuildReport, GraphBuildRequest, GraphBuilder};
pub use store::{FsGraphStore, GraphStore, PatternMatch, StoreError};

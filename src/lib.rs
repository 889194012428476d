//! Canopy: hierarchical namespaces and virtual-cluster syncing for
//! Kubernetes.
//!
//! Two halves share this crate. The hierarchy controllers keep a forest of
//! namespaces converged to declared parent/child relations and propagate
//! selected object kinds down the tree. The syncer projects tenant control
//! planes into a super cluster and back-populates runtime state.

pub mod api;
pub mod config;
pub mod errors;
pub mod forest;
pub mod reconcilers;
pub mod router;
pub mod server;
pub mod state;
pub mod syncer;

pub use errors::{Error, Result};

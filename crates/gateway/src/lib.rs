//! Podscope gateway — the local orchestrator daemon for AI-assisted
//! Kubernetes investigations.
//!
//! Embedders can depend on this crate, supply their own
//! [`runtime::kube::ClusterBackend`], and mount [`api::router`] in a larger
//! service; the bundled `podscope` binary wires the unconfigured stub.

pub mod api;
pub mod cli;
pub mod runtime;
pub mod state;

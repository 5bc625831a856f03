//! Roundwork role-specific nodes.
//!
//! This crate provides [`Node`], the per-call entry point of a local site or
//! the remote aggregator. It wires a call's input and state through a
//! [`pipeline::Pipeline`], chains local-only phases, derives the cross-party
//! advance consensus on the remote role, and shapes the response envelope.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Nodes sequence phase executions against the state
//! machine in the [`pipeline`] crate. They contain no transport code; the
//! `listener` and `cli` crates deliver calls to them.

pub mod builtin;
pub mod call_log;
pub mod node;

pub use builtin::EndWithSuccess;
pub use node::{all_sites_ready, Node, NodeOptions};

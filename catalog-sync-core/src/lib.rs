#![doc = "catalog-sync-core: the bulk synchronisation engine behind catalog-sync."]

//! This crate contains the engine that drives large streams of "apply this change to a remote
//! resource" operations against a rate-limited remote service. It knows nothing about HTTP or
//! business payloads: callers supply the input file and a [`contract::SessionFactory`].
//!
//! # Usage
//! Build a [`synchronise::SynchroniseConfig`], implement [`contract::RemoteCall`] for the target
//! service and call [`synchronise::synchronise`].

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod contract;
pub mod error;
pub mod pool;
pub mod rate_limit;
pub mod report;
pub mod result;
pub mod retry;
pub mod source;
pub mod synchronise;
pub mod validate;

//! Galleria - A scale-to-zero reverse proxy for exhibit backends
//!
//! This library provides an on-demand application gateway that:
//! - Exposes exhibit backends under a stable `/exhibit/{id}/...` path
//! - Starts backend containers on the first proxied request
//! - Polls backend readiness before publishing an address
//! - Rewrites request/response content between the external and internal namespaces
//! - Automatically stops idle backends after a configurable TTL
//! - Coordinates replicas through store-backed distributed RW locks
//! - Uses connection pooling for efficient backend communication

pub mod api;
pub mod cleanup;
pub mod config;
pub mod domain;
pub mod error;
pub mod eventing;
pub mod exhibit;
pub mod handler;
pub mod livecheck;
pub mod lock;
pub mod pool;
pub mod provisioner;
pub mod proxy;
pub mod resolver;
pub mod rewrite;
pub mod runtime;
pub mod runtime_info;
pub mod state;

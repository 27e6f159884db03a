//! File Gateway: a multi-tenant, multi-backend file gateway with a
//! concurrent, resumable chunked upload engine, an in-process upload
//! session registry with idle reaping, a bidirectional message hub
//! (duplex websocket and long-poll transports), and an authorization
//! evaluator that sits in front of every verb.
//!
//! Module map:
//! - [`error`]: the shared error taxonomy every layer maps into.
//! - [`identity`]: caller identity and the anonymous-session cascade key.
//! - [`config`]: the configuration data model and TOML loader.
//! - [`authz`]: the pure authorization evaluator.
//! - [`backend`]: the uniform backend adapter contract and its two
//!   concrete implementations.
//! - [`provider`]: the process-wide backend registry built from config.
//! - [`session`]: the upload session registry and its idle reaper.
//! - [`hub`]: the message hub and its two transports.
//! - [`api`]: the HTTP-facing upload and download endpoints.
//! - [`state`]: [`state::GatewayState`], the bundle every handler closes over.
//! - [`server`]: the hyper server wiring that ties the above together.

pub mod api;
pub mod authz;
pub mod backend;
pub mod config;
pub mod error;
pub mod hub;
pub mod identity;
pub mod provider;
pub mod server;
pub mod session;
pub mod state;

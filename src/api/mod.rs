//! HTTP-facing API surface: the Upload Orchestrator and the download
//! endpoint. Both are thin adapters over the domain-level functions in
//! [`upload`], which the rest of the crate (and the test suite) calls
//! directly without going through HTTP at all.

pub mod download;
pub mod upload;

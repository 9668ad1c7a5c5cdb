//! Relay Server Library
//!
//! Temporary file relay: chunked uploads are merged into one file that can be
//! downloaded with a short code for an hour.
//!
//! # Modules
//!
//! - `relay`: chunk store, reassembler, code registry, retrieval and sweeper
//! - `routes`: HTTP endpoints
//! - `config`, `error`, `state`: server plumbing

pub mod config;
pub mod error;
pub mod relay;
pub mod routes;
pub mod state;

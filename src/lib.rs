//! `pgmux` is a wire-compatible PostgreSQL proxy. It terminates client
//! sessions (including TLS and SCRAM-SHA-256 authentication), classifies each
//! statement as read or write, relays reads to a single replica endpoint and
//! applies writes to every configured primary under a coordinated
//! begin/execute/commit envelope.
//!
//! The crate is organized in three layers:
//!
//! * `messages` holds the PostgreSQL v3 message definitions and their codec.
//! * `api`, `server` and `client` are the protocol machinery: the
//!   client-facing session loop and the backend-facing wire client.
//! * `proxy` and `credentials` carry the proxy semantics: routing, fan-out
//!   and the SCRAM verifier store.

pub mod api;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod messages;
pub mod proxy;
pub mod server;

#[macro_use]
extern crate derive_new;

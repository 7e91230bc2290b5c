//! Network-backed store: RPC wire format, HTTP client, and server.
//!
//! The client satisfies the same [`crate::store::Store`] contract as the
//! local store, so the session orchestrator is indifferent to which one
//! it drives. The server serializes concurrent sessions per `(repo,
//! job)` database and keeps session state with a 30-minute TTL.

pub mod client;
pub mod server;
pub mod wire;

pub use client::NetStore;
pub use server::{ServerState, router};

//! Rust SDK for the SimpliSafe v3 cloud API.
//!
//! The crate is organized by transport surface:
//! - `api`: HTTP client, session/token lifecycle, and account operations.
//! - `retry`: bounded refresh/re-login recovery used by the HTTP client.
//! - `stream`: realtime push-channel client and event taxonomy.

/// HTTP API client and session management.
pub mod api;
/// Bounded authentication recovery policy.
pub mod retry;
/// Realtime push-channel client, frame codec, and event taxonomy.
pub mod stream;

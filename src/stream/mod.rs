//! Realtime push-channel modules.
//!
//! - `client`: websocket connection lifecycle and listener dispatch.
//! - `proto`: socket frame codec and the event-code taxonomy.

/// Push-channel connection and subscription handling.
pub mod client;
/// Frame codec and semantic event tags.
pub mod proto;

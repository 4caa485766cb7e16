//! Shard manager: the remote surface that drives member sync state.
//!
//! Three pieces:
//! - [`protocol`] — the call surface ([`ShardManagerProtocol`]) and the
//!   request/response wire messages,
//! - [`client`] — the orchestrator-side proxy fanning calls out to shard
//!   members over the transport,
//! - [`server`] — the member-side handler that owns the local sync record
//!   and executes the atomic cutover on the source shard's leader.

mod client;
mod protocol;
mod server;

pub use client::RemoteShardManagerClient;
pub use protocol::{
    decode_request, decode_response, encode_request, encode_response, ShardManagerProtocol,
    ShardManagerRequest, ShardManagerResponse,
};
pub use server::ShardManagerServer;

//! Matrix side of the gateway: data model, room-state cache, API client,
//! and the sync loop that drives the IRC side.

pub mod client;
pub mod events;
pub mod store;
pub mod sync;
pub mod types;

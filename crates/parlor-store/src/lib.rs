//! Realtime keyed store: the client capability the sync core talks to, an
//! in-process implementation with optional SQLite durability, and a client
//! for the store server.

pub mod client;
pub mod db;
pub mod error;
pub mod memory;
pub mod remote;
pub mod tree;

pub use client::{StoreClient, Watch, WatchSender};
pub use db::Database;
pub use error::StoreError;
pub use memory::{ConnectionId, MemoryClient, MemoryStore};
pub use remote::{RemoteConfig, RemoteStore};

//! Presence and membership synchronization on top of a realtime keyed store.
//!
//! Every component takes its store capability (`Arc<dyn StoreClient>`)
//! explicitly. [`Session`] wires them together for one signed-in user.

pub mod channels;
pub mod config;
pub mod connection;
pub mod error;
mod fetch;
pub mod listeners;
pub mod membership;
pub mod presence;
pub mod session;
pub mod unread;
pub mod users;

pub use channels::ChannelDirectory;
pub use config::SyncConfig;
pub use connection::ConnectionMonitor;
pub use error::SyncError;
pub use listeners::{Attach, ListenerKey, ListenerKind, ListenerRegistry, ListenerState};
pub use membership::{MembershipHealth, MembershipMirror, MirrorSide};
pub use presence::{PresenceController, PresencePhase};
pub use session::{Session, SessionEvent};
pub use unread::UnreadTracker;
pub use users::{ProfileChanges, UserDirectory};

//! In-process fan-out between sessions: row changes, ephemeral signals
//! and scoped presence, all built on tokio broadcast channels.

pub mod dispatcher;

pub use dispatcher::{ChangeStream, Dispatcher, PresenceGuard, SignalStream};

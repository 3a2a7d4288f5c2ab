//! Per-connection conversation state: the directory cache, the active
//! message feed, drafts, presence and typing. A [`Session`] subscribes to
//! the realtime dispatcher, folds change events into its local state, and
//! pushes [`corridor_types::api::SessionUpdate`] snapshots for the
//! transport to deliver.

pub mod backend;
pub mod composer;
pub mod directory;
pub mod error;
pub mod feed;
pub mod presence;
pub mod roster;
pub mod session;
pub mod typing;

pub use backend::Backend;
pub use error::SessionError;
pub use session::Session;

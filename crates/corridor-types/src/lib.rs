//! Shared types for the corridor conversation service: domain models,
//! realtime event shapes, and the client-session wire protocol.

pub mod api;
pub mod events;
pub mod models;

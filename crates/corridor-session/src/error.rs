use thiserror::Error;

/// Failures a session reports back to its client. Everything here becomes a
/// Notice; nothing blanks already-rendered state.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a message needs text or an attachment")]
    EmptyMessage,

    #[error("a {0} conversation needs a name")]
    MissingName(&'static str),

    #[error("you cannot open a direct conversation with yourself")]
    SelfConversation,

    #[error("direct conversations are opened by picking a contact, not created as rooms")]
    DirectRoom,

    #[error("attachment exceeds the {0} byte limit")]
    AttachmentTooLarge(u64),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

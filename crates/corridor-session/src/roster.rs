use tracing::{info, warn};
use uuid::Uuid;

use corridor_store::is_unique_violation;
use corridor_types::models::{Conversation, ConversationKind};

use crate::backend::Backend;
use crate::error::SessionError;

/// Open the 1:1 conversation with a peer, creating one only when no active
/// direct conversation exists for the pair. Two sessions racing for the
/// same pair both land on the surviving row: the loser's insert hits the
/// unique pair index and re-resolves instead of failing.
pub async fn open_direct(backend: &Backend, me: Uuid, peer: Uuid) -> Result<Uuid, SessionError> {
    if me == peer {
        return Err(SessionError::SelfConversation);
    }

    if let Some(existing) = backend.find_direct(me, peer).await? {
        return Ok(existing);
    }

    match backend.create_direct(me, peer).await {
        Ok(conversation) => {
            info!("Created direct conversation {} for {} and {}", conversation.id, me, peer);
            Ok(conversation.id)
        }
        Err(err) if is_unique_violation(&err) => {
            // Lost the race; somebody else's row won
            backend
                .find_direct(me, peer)
                .await?
                .ok_or(SessionError::Backend(err))
        }
        Err(err) => Err(err.into()),
    }
}

/// Create a named unit or group room and attach the initial members.
/// Attach failures are reported back, never rolled back: the room stands
/// without the missing members.
pub async fn create_room(
    backend: &Backend,
    me: Uuid,
    name: &str,
    kind: ConversationKind,
    unit: Option<Uuid>,
    applicable_units: Option<Vec<Uuid>>,
    member_ids: Vec<Uuid>,
) -> Result<(Conversation, Vec<Uuid>), SessionError> {
    if kind == ConversationKind::Direct {
        return Err(SessionError::DirectRoom);
    }
    if name.trim().is_empty() {
        return Err(SessionError::MissingName(kind.as_str()));
    }

    let (conversation, attached, failed) = backend
        .create_room(me, name.trim(), kind, unit, applicable_units, member_ids)
        .await?;

    if failed.is_empty() {
        info!(
            "Created {} conversation {} with {} members",
            kind.as_str(),
            conversation.id,
            attached.len() + 1
        );
    } else {
        warn!(
            "Created {} conversation {} but {} of {} members could not be attached",
            kind.as_str(),
            conversation.id,
            failed.len(),
            attached.len() + failed.len()
        );
    }

    Ok((conversation, failed))
}

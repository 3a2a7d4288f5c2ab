use reqwest::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use corridor_realtime::Dispatcher;
use corridor_session::Backend;
use corridor_types::events::{Change, ChangeFilter, PresenceScope, Table};
use corridor_types::models::{ConversationKind, Message};

/// Watch message inserts and ping the phone gateway for direct messages
/// whose recipient is offline but has a phone on file. Fire and forget;
/// a failed ping never blocks message flow.
pub async fn run(
    backend: Backend,
    dispatcher: Dispatcher,
    gateway_url: String,
    token: Option<String>,
) {
    let client = Client::new();
    let mut changes = dispatcher.changes(ChangeFilter::for_table(Table::Messages));

    info!("Phone gateway notifier active, posting to {}", gateway_url);

    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("Notifier lagged {} changes behind", n);
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        let Change::MessageInserted { message } = change else {
            continue;
        };

        if let Err(e) = ping_for(
            &backend,
            &dispatcher,
            &client,
            &gateway_url,
            token.as_deref(),
            &message,
        )
        .await
        {
            warn!("Phone ping for message {} failed: {}", message.id, e);
        }
    }
}

async fn ping_for(
    backend: &Backend,
    dispatcher: &Dispatcher,
    client: &Client,
    gateway_url: &str,
    token: Option<&str>,
    message: &Message,
) -> anyhow::Result<()> {
    match backend.conversation(message.conversation_id).await? {
        Some(c) if c.kind == ConversationKind::Direct => {}
        _ => return Ok(()),
    }

    // The peer is whoever in the chat did not send this
    let participants = backend.participants(message.conversation_id).await?;
    let Some(peer) = participants.iter().find(|p| p.user_id != message.sender_id) else {
        return Ok(());
    };

    // Online users see the message arrive; no call needed
    let online = dispatcher
        .presence_members(PresenceScope::Global)
        .iter()
        .any(|m| m.user_id == peer.user_id);
    if online {
        return Ok(());
    }

    let Some(profile) = backend.profile(peer.user_id).await? else {
        return Ok(());
    };
    let Some(phone) = profile.phone else {
        debug!("{} is offline with no phone on file", profile.display_name);
        return Ok(());
    };

    let sender_name = backend
        .profile(message.sender_id)
        .await?
        .map(|p| p.display_name)
        .unwrap_or_else(|| "A colleague".to_string());

    let body = json!({
        "phone": phone,
        "user_id": peer.user_id,
        "conversation_id": message.conversation_id,
        "from": sender_name,
    });

    let mut request = client.post(gateway_url).json(&body);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        anyhow::bail!("gateway answered {}", response.status());
    }

    debug!("Pinged {} about an offline direct message", profile.display_name);
    Ok(())
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use corridor_realtime::Dispatcher;
use corridor_types::api::{ClientCommand, FeedPhase, NoticeLevel, SessionUpdate};
use corridor_types::events::{Change, ChangeFilter, PresenceEvent, PresenceScope};
use corridor_types::models::ConversationKind;

use crate::backend::Backend;
use crate::composer::{Composer, Draft, StagedAttachment};
use crate::directory::Directory;
use crate::error::SessionError;
use crate::feed::{FEED_WINDOW, Feed};
use crate::presence::PresenceTracker;
use crate::roster;
use crate::typing::{TYPING_SWEEP, TypingRoster, TypingSignaler};

/// Wall-clock budget for the message insert of a send.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Wall-clock budget for an attachment upload. Uploads run before the
/// insert; a message row never references a blob that is not stored.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// One connected client. Owns the directory cache, the active feed, the
/// drafts and the presence/typing subscriptions, and pushes state
/// snapshots over an unbounded channel the transport drains. Dropping the
/// session tears down every background task and leaves all presence
/// scopes.
pub struct Session {
    user_id: Uuid,
    display_name: String,
    backend: Backend,
    dispatcher: Dispatcher,
    state: Arc<Mutex<SessionState>>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    refresh: Arc<Notify>,
    tasks: Arc<Mutex<Tasks>>,
}

struct SessionState {
    directory: Directory,
    composer: Composer,
    signaler: TypingSignaler,
    feed: Option<Feed>,
    generation: u64,
    contacts_watched: bool,
}

#[derive(Default)]
struct Tasks {
    core: Vec<JoinHandle<()>>,
    /// The per-selection worker (room presence + typing); swapped on Select
    active: Option<JoinHandle<()>>,
}

impl Session {
    pub fn start(
        user_id: Uuid,
        display_name: String,
        backend: Backend,
    ) -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let dispatcher = backend.dispatcher();
        let state = Arc::new(Mutex::new(SessionState {
            directory: Directory::new(),
            composer: Composer::new(),
            signaler: TypingSignaler::new(user_id),
            feed: None,
            generation: 0,
            contacts_watched: false,
        }));
        let refresh = Arc::new(Notify::new());
        let tasks = Arc::new(Mutex::new(Tasks::default()));

        let session = Self {
            user_id,
            display_name: display_name.clone(),
            backend: backend.clone(),
            dispatcher: dispatcher.clone(),
            state: Arc::clone(&state),
            updates: updates.clone(),
            refresh: Arc::clone(&refresh),
            tasks: Arc::clone(&tasks),
        };

        session.push(SessionUpdate::Ready { user_id });

        {
            let mut tasks = tasks.lock().expect("session lock poisoned");
            tasks.core.push(tokio::spawn(watch_changes(
                user_id,
                dispatcher.clone(),
                backend.clone(),
                Arc::clone(&state),
                Arc::clone(&session.tasks),
                Arc::clone(&refresh),
                updates.clone(),
            )));
            tasks.core.push(tokio::spawn(refresh_directory(
                backend,
                user_id,
                state,
                refresh,
                updates.clone(),
            )));
            tasks.core.push(tokio::spawn(track_global_presence(
                dispatcher,
                user_id,
                display_name,
                updates,
            )));
        }

        (session, rx)
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub async fn handle(&self, command: ClientCommand) {
        match command {
            ClientCommand::Refresh => {
                self.state
                    .lock()
                    .expect("session lock poisoned")
                    .directory
                    .invalidate();
                self.refresh.notify_one();
            }
            ClientCommand::Contacts => {
                self.state
                    .lock()
                    .expect("session lock poisoned")
                    .contacts_watched = true;
                self.push_contacts().await;
            }
            ClientCommand::Select { conversation_id } => self.select(conversation_id),
            ClientCommand::LoadOlder => self.load_older(),
            ClientCommand::Compose { conversation_id, text } => self.compose(conversation_id, text),
            ClientCommand::StageAttachment {
                conversation_id,
                file_name,
                mime_type,
                data,
            } => self.stage_attachment(conversation_id, file_name, mime_type, data),
            ClientCommand::ClearAttachment { conversation_id } => {
                let update = {
                    let mut state = self.state.lock().expect("session lock poisoned");
                    state.composer.clear_attachment(conversation_id);
                    draft_update(&state.composer, conversation_id)
                };
                self.push(update);
            }
            ClientCommand::Send { conversation_id } => self.send(conversation_id),
            ClientCommand::OpenDirect { user_id } => self.open_direct(user_id).await,
            ClientCommand::CreateRoom {
                name,
                kind,
                unit,
                applicable_units,
                member_ids,
            } => {
                self.create_room(name, kind, unit, applicable_units, member_ids)
                    .await
            }
            ClientCommand::MarkRead { conversation_id } => {
                if let Err(e) = self.backend.mark_read(conversation_id, self.user_id).await {
                    self.push(notice(
                        NoticeLevel::Warning,
                        format!("Could not update the read marker: {e}"),
                    ));
                }
            }
            ClientCommand::EditMessage { message_id, content } => {
                if content.trim().is_empty() {
                    self.push(notice(NoticeLevel::Warning, SessionError::EmptyMessage.to_string()));
                } else if let Err(e) = self
                    .backend
                    .edit_message(message_id, self.user_id, &content)
                    .await
                {
                    self.push(notice(NoticeLevel::Error, format!("Edit failed: {e}")));
                }
            }
            ClientCommand::DeleteMessage { message_id } => {
                if let Err(e) = self.backend.delete_message(message_id, self.user_id).await {
                    self.push(notice(NoticeLevel::Error, format!("Delete failed: {e}")));
                }
            }
            ClientCommand::Archive { conversation_id } => {
                if let Err(e) = self.backend.archive(conversation_id, self.user_id).await {
                    self.push(notice(NoticeLevel::Error, format!("Archive failed: {e}")));
                }
            }
            ClientCommand::Leave { conversation_id } => {
                if let Err(e) = self.backend.leave(conversation_id, self.user_id).await {
                    self.push(notice(NoticeLevel::Error, format!("Leave failed: {e}")));
                }
            }
        }
    }

    /// Make a conversation the active one: fresh feed generation, room
    /// presence, typing roster, and a window fetch. Any in-flight fetch
    /// for the previous selection dies on the generation check.
    fn select(&self, conversation_id: Uuid) {
        let (generation, stop) = {
            let mut state = self.state.lock().expect("session lock poisoned");
            state.generation += 1;
            let generation = state.generation;
            state.feed = Some(Feed::begin(conversation_id, generation));
            (generation, state.signaler.stop())
        };
        if let Some(signal) = stop {
            self.dispatcher.signal(signal);
        }

        let (loading, draft) = {
            let state = self.state.lock().expect("session lock poisoned");
            let loading = state.feed.as_ref().map(feed_update);
            (loading, draft_update(&state.composer, conversation_id))
        };
        if let Some(update) = loading {
            self.push(update);
        }
        self.push(draft);

        let worker = tokio::spawn(drive_active(
            self.dispatcher.clone(),
            conversation_id,
            self.user_id,
            self.display_name.clone(),
            self.updates.clone(),
        ));
        let old = {
            let mut tasks = self.tasks.lock().expect("session lock poisoned");
            tasks.active.replace(worker)
        };
        if let Some(old) = old {
            old.abort();
        }

        tokio::spawn(load_window(
            self.backend.clone(),
            Arc::clone(&self.state),
            self.updates.clone(),
            conversation_id,
            generation,
        ));
    }

    fn load_older(&self) {
        let request = {
            let mut state = self.state.lock().expect("session lock poisoned");
            state.feed.as_mut().and_then(|feed| {
                feed.begin_older()
                    .map(|cursor| (feed.conversation_id(), feed.generation(), cursor))
            })
        };
        let Some((conversation_id, generation, cursor)) = request else {
            return;
        };

        let backend = self.backend.clone();
        let state = Arc::clone(&self.state);
        let updates = self.updates.clone();
        tokio::spawn(async move {
            let result = backend
                .messages_before(conversation_id, FEED_WINDOW, Some(cursor))
                .await;
            let update = {
                let mut state = state.lock().expect("session lock poisoned");
                match state.feed.as_mut() {
                    Some(feed) if feed.generation() == generation => match result {
                        Ok(older) => {
                            feed.merge_older(older, FEED_WINDOW);
                            Some(feed_update(feed))
                        }
                        Err(e) => {
                            warn!("Older page for {} failed: {}", conversation_id, e);
                            feed.fail_older();
                            Some(notice(
                                NoticeLevel::Warning,
                                format!("Could not load older messages: {e}"),
                            ))
                        }
                    },
                    _ => None,
                }
            };
            if let Some(update) = update {
                let _ = updates.send(update);
            }
        });
    }

    fn compose(&self, conversation_id: Uuid, text: String) {
        let signals = {
            let mut state = self.state.lock().expect("session lock poisoned");
            let stopped = text.trim().is_empty();
            state.composer.set_text(conversation_id, text);
            if stopped {
                state.signaler.stop().into_iter().collect()
            } else {
                state.signaler.keystroke(conversation_id, Instant::now())
            }
        };
        for signal in signals {
            self.dispatcher.signal(signal);
        }
    }

    fn stage_attachment(
        &self,
        conversation_id: Uuid,
        file_name: String,
        mime_type: String,
        data: String,
    ) {
        let bytes = match B64.decode(data.as_bytes()) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                self.push(notice(
                    NoticeLevel::Error,
                    format!("Attachment {file_name} is not valid base64: {e}"),
                ));
                return;
            }
        };

        let cap = self.backend.max_attachment_bytes();
        if bytes.len() as u64 > cap {
            self.push(notice(
                NoticeLevel::Warning,
                SessionError::AttachmentTooLarge(cap).to_string(),
            ));
            return;
        }

        let update = {
            let mut state = self.state.lock().expect("session lock poisoned");
            state.composer.stage(
                conversation_id,
                StagedAttachment {
                    file_name,
                    mime_type,
                    data: bytes,
                },
            );
            draft_update(&state.composer, conversation_id)
        };
        self.push(update);
    }

    /// Validate, take the draft, and run the upload-then-insert pipeline
    /// off-task. A validation miss never touches the network; any failure
    /// puts the draft back.
    fn send(&self, conversation_id: Uuid) {
        let (draft, stop) = {
            let mut state = self.state.lock().expect("session lock poisoned");
            if let Err(e) = state.composer.draft(conversation_id).validate() {
                drop(state);
                self.push(notice(NoticeLevel::Warning, e.to_string()));
                return;
            }
            (state.composer.take(conversation_id), state.signaler.stop())
        };
        if let Some(signal) = stop {
            self.dispatcher.signal(signal);
        }

        tokio::spawn(send_pipeline(
            self.backend.clone(),
            Arc::clone(&self.state),
            self.updates.clone(),
            conversation_id,
            self.user_id,
            draft,
        ));
    }

    async fn open_direct(&self, peer: Uuid) {
        match roster::open_direct(&self.backend, self.user_id, peer).await {
            Ok(conversation_id) => self.push(SessionUpdate::Opened { conversation_id }),
            Err(e) => self.push(notice(NoticeLevel::Error, e.to_string())),
        }
    }

    async fn create_room(
        &self,
        name: String,
        kind: ConversationKind,
        unit: Option<Uuid>,
        applicable_units: Option<Vec<Uuid>>,
        member_ids: Vec<Uuid>,
    ) {
        match roster::create_room(
            &self.backend,
            self.user_id,
            &name,
            kind,
            unit,
            applicable_units,
            member_ids,
        )
        .await
        {
            Ok((conversation, failed)) => {
                if !failed.is_empty() {
                    self.push(notice(
                        NoticeLevel::Warning,
                        format!("{} member(s) could not be added", failed.len()),
                    ));
                }
                self.push(SessionUpdate::Opened {
                    conversation_id: conversation.id,
                });
            }
            Err(e) => self.push(notice(NoticeLevel::Error, e.to_string())),
        }
    }

    async fn push_contacts(&self) {
        match self.backend.contacts(self.user_id).await {
            Ok(profiles) => self.push(SessionUpdate::Contacts { profiles }),
            Err(e) => self.push(notice(
                NoticeLevel::Warning,
                format!("Could not load contacts: {e}"),
            )),
        }
    }

    fn push(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        for task in tasks.core.drain(..) {
            task.abort();
        }
        if let Some(task) = tasks.active.take() {
            task.abort();
        }
    }
}

/// Watch the change firehose and route each event: feeds get their own
/// conversation's messages, everything else folds into directory and
/// contact invalidations.
async fn watch_changes(
    user_id: Uuid,
    dispatcher: Dispatcher,
    backend: Backend,
    state: Arc<Mutex<SessionState>>,
    tasks: Arc<Mutex<Tasks>>,
    refresh: Arc<Notify>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
) {
    let mut changes = dispatcher.changes(ChangeFilter::any());
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(RecvError::Lagged(n)) => {
                warn!("Session {} lagged {} changes behind, resyncing", user_id, n);
                {
                    let mut state = state.lock().expect("session lock poisoned");
                    state.directory.invalidate();
                }
                refresh.notify_one();
                reload_feed(&backend, &state, &updates);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        route_change(user_id, &backend, &state, &tasks, &refresh, &updates, change);
    }
}

fn route_change(
    user_id: Uuid,
    backend: &Backend,
    state: &Arc<Mutex<SessionState>>,
    tasks: &Arc<Mutex<Tasks>>,
    refresh: &Arc<Notify>,
    updates: &mpsc::UnboundedSender<SessionUpdate>,
    change: Change,
) {
    let mut feed_emit = None;
    let mut invalidate = false;
    let mut refetch_contacts = false;
    let mut deactivate = None;

    {
        let mut st = state.lock().expect("session lock poisoned");
        let known = st
            .directory
            .entries()
            .iter()
            .any(|e| e.conversation.id == change.conversation_id());

        match change {
            Change::MessageInserted { message } => {
                // Every insert system-wide dirties the directory; the
                // preview is at most one refetch behind
                invalidate = true;
                if let Some(feed) = st.feed.as_mut()
                    && feed.conversation_id() == message.conversation_id
                    && feed.apply_insert(message)
                {
                    feed_emit = Some(feed_update(feed));
                }
            }
            Change::MessageUpdated { message } => {
                invalidate = known;
                if let Some(feed) = st.feed.as_mut()
                    && feed.conversation_id() == message.conversation_id
                    && feed.apply_update(message)
                {
                    feed_emit = Some(feed_update(feed));
                }
            }
            Change::ConversationInserted { conversation } => {
                // Participant rows carry the membership; the creator is the
                // only one who can tell from the conversation row alone
                invalidate = conversation.created_by == user_id;
            }
            Change::ConversationUpdated { conversation } => {
                invalidate = known;
                if !conversation.active {
                    if known && conversation.kind == ConversationKind::Direct {
                        // The pair is free again
                        refetch_contacts = true;
                    }
                    if st
                        .feed
                        .as_ref()
                        .is_some_and(|f| f.conversation_id() == conversation.id)
                    {
                        st.feed = None;
                        st.generation += 1;
                        deactivate = Some(conversation.id);
                    }
                }
            }
            Change::ParticipantInserted { participant } => {
                if participant.user_id == user_id {
                    invalidate = true;
                    refetch_contacts = true;
                }
            }
            Change::ParticipantUpdated { participant } => {
                if participant.user_id == user_id {
                    invalidate = true;
                    if participant.left_at.is_some()
                        && st
                            .feed
                            .as_ref()
                            .is_some_and(|f| f.conversation_id() == participant.conversation_id)
                    {
                        st.feed = None;
                        st.generation += 1;
                        deactivate = Some(participant.conversation_id);
                    }
                }
            }
        }

        if invalidate {
            st.directory.invalidate();
        }
        if refetch_contacts && !st.contacts_watched {
            refetch_contacts = false;
        }
    }

    if invalidate {
        refresh.notify_one();
    }
    if let Some(update) = feed_emit {
        let _ = updates.send(update);
    }
    if let Some(conversation_id) = deactivate {
        if let Some(worker) = tasks.lock().expect("session lock poisoned").active.take() {
            worker.abort();
        }
        let _ = updates.send(SessionUpdate::Feed {
            conversation_id,
            phase: FeedPhase::Empty,
            messages: Vec::new(),
            exhausted: false,
        });
    }
    if refetch_contacts {
        let backend = backend.clone();
        let updates = updates.clone();
        tokio::spawn(async move {
            match backend.contacts(user_id).await {
                Ok(profiles) => {
                    let _ = updates.send(SessionUpdate::Contacts { profiles });
                }
                Err(e) => warn!("Contact refresh failed for {}: {}", user_id, e),
            }
        });
    }
}

/// Re-fetch the active conversation's window under a fresh generation.
/// Used when the change stream lagged and single-event patching is no
/// longer sound.
fn reload_feed(
    backend: &Backend,
    state: &Arc<Mutex<SessionState>>,
    updates: &mpsc::UnboundedSender<SessionUpdate>,
) {
    let target = {
        let mut st = state.lock().expect("session lock poisoned");
        match st.feed.as_ref().map(Feed::conversation_id) {
            Some(cid) => {
                st.generation += 1;
                let generation = st.generation;
                st.feed = Some(Feed::begin(cid, generation));
                Some((cid, generation))
            }
            None => None,
        }
    };
    let Some((conversation_id, generation)) = target else {
        return;
    };
    tokio::spawn(load_window(
        backend.clone(),
        Arc::clone(state),
        updates.clone(),
        conversation_id,
        generation,
    ));
}

/// Fetch the newest window and commit it, unless the selection moved on in
/// the meantime.
async fn load_window(
    backend: Backend,
    state: Arc<Mutex<SessionState>>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    conversation_id: Uuid,
    generation: u64,
) {
    let result = backend
        .messages_before(conversation_id, FEED_WINDOW, None)
        .await;

    let emit = {
        let mut state = state.lock().expect("session lock poisoned");
        match state.feed.as_mut() {
            Some(feed) if feed.generation() == generation => match result {
                Ok(window) => {
                    feed.commit_initial(window, FEED_WINDOW);
                    vec![feed_update(feed)]
                }
                Err(e) => {
                    warn!("Window fetch for {} failed: {}", conversation_id, e);
                    // The client saw Loading; close that out before the
                    // notice so it never hangs on a spinner
                    state.feed = None;
                    vec![
                        SessionUpdate::Feed {
                            conversation_id,
                            phase: FeedPhase::Empty,
                            messages: Vec::new(),
                            exhausted: false,
                        },
                        notice(NoticeLevel::Error, format!("Could not load messages: {e}")),
                    ]
                }
            },
            // Stale answer for a conversation the user already left
            _ => Vec::new(),
        }
    };
    for update in emit {
        let _ = updates.send(update);
    }
}

/// Refetch the directory whenever it ages out or an invalidation lands.
/// Failures keep the last-good snapshot and mark it stale.
async fn refresh_directory(
    backend: Backend,
    user_id: Uuid,
    state: Arc<Mutex<SessionState>>,
    refresh: Arc<Notify>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
) {
    loop {
        let wait = {
            let state = state.lock().expect("session lock poisoned");
            state.directory.time_to_refresh(Instant::now())
        };
        if !wait.is_zero() {
            tokio::select! {
                _ = refresh.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            continue;
        }

        {
            let mut state = state.lock().expect("session lock poisoned");
            state.directory.begin_refresh();
        }

        let update = match backend.directory(user_id).await {
            Ok(entries) => {
                let mut state = state.lock().expect("session lock poisoned");
                state.directory.commit(entries, Instant::now());
                SessionUpdate::Directory {
                    entries: state.directory.entries().to_vec(),
                    stale: false,
                }
            }
            Err(e) => {
                warn!("Directory refresh for {} failed: {}", user_id, e);
                let mut state = state.lock().expect("session lock poisoned");
                state.directory.fail(Instant::now());
                SessionUpdate::Directory {
                    entries: state.directory.entries().to_vec(),
                    stale: true,
                }
            }
        };
        let _ = updates.send(update);
    }
}

/// Keep the global online set current for the sidebar.
async fn track_global_presence(
    dispatcher: Dispatcher,
    user_id: Uuid,
    display_name: String,
    updates: mpsc::UnboundedSender<SessionUpdate>,
) {
    let mut guard = dispatcher.join_presence(
        PresenceScope::Global,
        user_id,
        serde_json::json!({ "name": display_name }),
    );
    let mut tracker = PresenceTracker::new(PresenceScope::Global);
    tracker.apply(PresenceEvent::Sync {
        members: guard.snapshot().to_vec(),
    });
    let _ = updates.send(SessionUpdate::Presence {
        scope: PresenceScope::Global,
        online: tracker.online(),
    });

    loop {
        let event = match guard.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("Global presence stream lagged by {}", n);
                PresenceEvent::Sync {
                    members: dispatcher.presence_members(PresenceScope::Global),
                }
            }
            Err(RecvError::Closed) => break,
        };
        if tracker.apply(event) {
            let _ = updates.send(SessionUpdate::Presence {
                scope: PresenceScope::Global,
                online: tracker.online(),
            });
        }
    }
}

/// Per-selection worker: room presence plus the typing roster for the
/// active conversation. Aborted (and therefore left) when the selection
/// changes or the conversation goes away.
async fn drive_active(
    dispatcher: Dispatcher,
    conversation_id: Uuid,
    user_id: Uuid,
    display_name: String,
    updates: mpsc::UnboundedSender<SessionUpdate>,
) {
    let scope = PresenceScope::Room(conversation_id);
    let mut guard = dispatcher.join_presence(
        scope,
        user_id,
        serde_json::json!({ "name": display_name }),
    );
    let mut tracker = PresenceTracker::new(scope);
    tracker.apply(PresenceEvent::Sync {
        members: guard.snapshot().to_vec(),
    });
    let _ = updates.send(SessionUpdate::Presence {
        scope,
        online: tracker.online(),
    });

    let mut signals = dispatcher.signals(Some(conversation_id));
    let mut roster = TypingRoster::new(user_id);
    let mut sweep = tokio::time::interval(TYPING_SWEEP);

    loop {
        tokio::select! {
            event = guard.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Room presence stream lagged by {}", n);
                        PresenceEvent::Sync { members: dispatcher.presence_members(scope) }
                    }
                    Err(RecvError::Closed) => break,
                };
                if tracker.apply(event) {
                    let _ = updates.send(SessionUpdate::Presence {
                        scope,
                        online: tracker.online(),
                    });
                }
            }
            signal = signals.recv() => {
                match signal {
                    Ok(signal) => {
                        if roster.apply(&signal, Instant::now()) {
                            let _ = updates.send(SessionUpdate::Typing {
                                conversation_id,
                                user_ids: roster.typists(),
                            });
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        // Roster self-heals through the TTL
                        warn!("Typing stream lagged by {}", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = sweep.tick() => {
                if roster.sweep(Instant::now()) {
                    let _ = updates.send(SessionUpdate::Typing {
                        conversation_id,
                        user_ids: roster.typists(),
                    });
                }
            }
        }
    }
}

/// Run the upload (if staged) and the insert, restoring the draft on any
/// failure so nothing typed is lost.
async fn send_pipeline(
    backend: Backend,
    state: Arc<Mutex<SessionState>>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    conversation_id: Uuid,
    user_id: Uuid,
    draft: Draft,
) {
    let staged = draft.attachment.clone();
    let mut attachment = None;

    if let Some(staged) = &staged {
        match tokio::time::timeout(
            UPLOAD_TIMEOUT,
            backend.upload(&staged.file_name, &staged.mime_type, &staged.data),
        )
        .await
        {
            Ok(Ok(stored)) => attachment = Some(stored),
            Ok(Err(e)) => {
                warn!("Upload of {} failed: {}", staged.file_name, e);
                restore_draft(&state, &updates, conversation_id, draft);
                let _ = updates.send(notice(NoticeLevel::Error, format!("Upload failed: {e}")));
                return;
            }
            Err(_) => {
                warn!("Upload of {} timed out", staged.file_name);
                restore_draft(&state, &updates, conversation_id, draft);
                let _ = updates.send(notice(
                    NoticeLevel::Error,
                    SessionError::Timeout("upload").to_string(),
                ));
                return;
            }
        }
    }

    match tokio::time::timeout(
        SEND_TIMEOUT,
        backend.send_message(conversation_id, user_id, &draft.text, attachment.clone()),
    )
    .await
    {
        Ok(Ok(message)) => {
            let _ = updates.send(SessionUpdate::Sent { message });
            let update = {
                let state = state.lock().expect("session lock poisoned");
                draft_update(&state.composer, conversation_id)
            };
            let _ = updates.send(update);
        }
        Ok(Err(e)) => {
            warn!("Send to {} failed: {}", conversation_id, e);
            if let Some(stored) = &attachment {
                backend.discard_upload(&stored.url).await;
            }
            restore_draft(&state, &updates, conversation_id, draft);
            let _ = updates.send(notice(
                NoticeLevel::Error,
                format!("Message was not sent: {e}"),
            ));
        }
        Err(_) => {
            // The insert may still land; the blob stays for that case
            warn!("Send to {} timed out", conversation_id);
            restore_draft(&state, &updates, conversation_id, draft);
            let _ = updates.send(notice(
                NoticeLevel::Error,
                SessionError::Timeout("send").to_string(),
            ));
        }
    }
}

fn restore_draft(
    state: &Mutex<SessionState>,
    updates: &mpsc::UnboundedSender<SessionUpdate>,
    conversation_id: Uuid,
    draft: Draft,
) {
    let update = {
        let mut state = state.lock().expect("session lock poisoned");
        state.composer.restore(conversation_id, draft);
        draft_update(&state.composer, conversation_id)
    };
    let _ = updates.send(update);
}

fn feed_update(feed: &Feed) -> SessionUpdate {
    SessionUpdate::Feed {
        conversation_id: feed.conversation_id(),
        phase: feed.phase(),
        messages: feed.messages().to_vec(),
        exhausted: feed.exhausted(),
    }
}

fn draft_update(composer: &Composer, conversation_id: Uuid) -> SessionUpdate {
    let draft = composer.draft(conversation_id);
    SessionUpdate::Draft {
        conversation_id,
        text: draft.text,
        attachment_name: draft.attachment.map(|a| a.file_name),
    }
}

fn notice(level: NoticeLevel, text: impl Into<String>) -> SessionUpdate {
    SessionUpdate::Notice {
        level,
        text: text.into(),
    }
}

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use uuid::Uuid;

use corridor_types::events::{
    Change, ChangeFilter, PresenceEvent, PresenceMember, PresenceScope, Signal,
};

/// Capacity of every broadcast channel the dispatcher hands out.
const CHANNEL_CAPACITY: usize = 1024;

/// Fan-out hub shared by every session and background worker.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Row changes — every subscriber receives every change, filtering is local
    changes_tx: broadcast::Sender<Change>,

    /// Ephemeral signals (typing). Never persisted, never replayed.
    signals_tx: broadcast::Sender<Signal>,

    /// Presence registry: scope -> live members plus the scope's event channel
    scopes: RwLock<HashMap<PresenceScope, ScopeState>>,
}

struct ScopeState {
    members: HashMap<Uuid, TrackedMember>,
    events_tx: broadcast::Sender<PresenceEvent>,
}

struct TrackedMember {
    /// Join token. A newer join for the same user takes ownership; the
    /// older guard's drop then leaves the membership alone.
    token: Uuid,
    payload: serde_json::Value,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (signals_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                changes_tx,
                signals_tx,
                scopes: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Publish a row change to every subscriber.
    pub fn publish(&self, change: Change) {
        let _ = self.inner.changes_tx.send(change);
    }

    /// Subscribe to row changes matching a filter.
    pub fn changes(&self, filter: ChangeFilter) -> ChangeStream {
        ChangeStream {
            rx: self.inner.changes_tx.subscribe(),
            filter,
        }
    }

    /// Fire an ephemeral signal.
    pub fn signal(&self, signal: Signal) {
        let _ = self.inner.signals_tx.send(signal);
    }

    /// Subscribe to signals, optionally restricted to one conversation.
    pub fn signals(&self, conversation: Option<Uuid>) -> SignalStream {
        SignalStream {
            rx: self.inner.signals_tx.subscribe(),
            conversation,
        }
    }

    /// Enter a presence scope. The returned guard carries the member set as
    /// of the join (self included) and the scope's event stream; dropping it
    /// leaves the scope and announces the departure.
    pub fn join_presence(
        &self,
        scope: PresenceScope,
        user_id: Uuid,
        payload: serde_json::Value,
    ) -> PresenceGuard {
        let token = Uuid::new_v4();
        let mut scopes = self.inner.scopes.write().expect("presence lock poisoned");
        let state = scopes.entry(scope).or_insert_with(|| ScopeState {
            members: HashMap::new(),
            events_tx: broadcast::channel(CHANNEL_CAPACITY).0,
        });

        state.members.insert(
            user_id,
            TrackedMember {
                token,
                payload: payload.clone(),
            },
        );

        let snapshot: Vec<PresenceMember> = state
            .members
            .iter()
            .map(|(id, m)| PresenceMember {
                user_id: *id,
                payload: m.payload.clone(),
            })
            .collect();

        // Subscribe first, so the stream starts with our own join announcement
        let events = state.events_tx.subscribe();
        let _ = state.events_tx.send(PresenceEvent::Join {
            member: PresenceMember { user_id, payload },
        });

        PresenceGuard {
            dispatcher: self.clone(),
            scope,
            user_id,
            token,
            snapshot,
            events,
        }
    }

    /// Current members of a scope.
    pub fn presence_members(&self, scope: PresenceScope) -> Vec<PresenceMember> {
        let scopes = self.inner.scopes.read().expect("presence lock poisoned");
        scopes
            .get(&scope)
            .map(|state| {
                state
                    .members
                    .iter()
                    .map(|(id, m)| PresenceMember {
                        user_id: *id,
                        payload: m.payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn leave_presence(&self, scope: PresenceScope, user_id: Uuid, token: Uuid) {
        let Ok(mut scopes) = self.inner.scopes.write() else {
            return;
        };
        let Some(state) = scopes.get_mut(&scope) else {
            return;
        };

        // A newer join for the same user owns the membership now
        match state.members.get(&user_id) {
            Some(m) if m.token == token => {}
            _ => return,
        }

        if let Some(m) = state.members.remove(&user_id) {
            let _ = state.events_tx.send(PresenceEvent::Leave {
                member: PresenceMember {
                    user_id,
                    payload: m.payload,
                },
            });
        }

        if state.members.is_empty() && state.events_tx.receiver_count() == 0 {
            scopes.remove(&scope);
        }
    }
}

/// A filtered view over the change firehose.
pub struct ChangeStream {
    rx: broadcast::Receiver<Change>,
    filter: ChangeFilter,
}

impl ChangeStream {
    /// Next change matching the filter. Lagged is returned rather than
    /// swallowed; callers resync from the store on it.
    pub async fn recv(&mut self) -> Result<Change, broadcast::error::RecvError> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.filter.matches(&change) => return Ok(change),
                Ok(_) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// A filtered view over the signal channel.
pub struct SignalStream {
    rx: broadcast::Receiver<Signal>,
    conversation: Option<Uuid>,
}

impl SignalStream {
    pub async fn recv(&mut self) -> Result<Signal, broadcast::error::RecvError> {
        loop {
            match self.rx.recv().await {
                Ok(signal) => {
                    if self.conversation.is_none_or(|c| c == signal.conversation_id()) {
                        return Ok(signal);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Live membership in one presence scope. Dropping it leaves the scope.
pub struct PresenceGuard {
    dispatcher: Dispatcher,
    scope: PresenceScope,
    user_id: Uuid,
    token: Uuid,
    snapshot: Vec<PresenceMember>,
    events: broadcast::Receiver<PresenceEvent>,
}

impl PresenceGuard {
    pub fn scope(&self) -> PresenceScope {
        self.scope
    }

    /// Member set as of the join, self included.
    pub fn snapshot(&self) -> &[PresenceMember] {
        &self.snapshot
    }

    /// Next presence event for the scope. The first event is always this
    /// member's own join.
    pub async fn recv(&mut self) -> Result<PresenceEvent, broadcast::error::RecvError> {
        self.events.recv().await
    }
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        self.dispatcher
            .leave_presence(self.scope, self.user_id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use corridor_types::events::Table;
    use corridor_types::models::Message;
    use serde_json::json;

    fn message(conversation_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            content: "hello".into(),
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
            attachment: None,
        }
    }

    fn member_ids(members: &[PresenceMember]) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = members.iter().map(|m| m.user_id).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn change_streams_honor_filters() {
        let dispatcher = Dispatcher::new();
        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut stream = dispatcher.changes(ChangeFilter::for_conversation(Table::Messages, watched));

        dispatcher.publish(Change::MessageInserted {
            message: message(other),
        });
        dispatcher.publish(Change::MessageInserted {
            message: message(watched),
        });

        let change = stream.recv().await.unwrap();
        assert_eq!(change.conversation_id(), watched);
    }

    #[tokio::test]
    async fn presence_join_and_leave_reach_other_members() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut alice_guard =
            dispatcher.join_presence(PresenceScope::Global, alice, json!({"name": "Alice"}));
        assert_eq!(member_ids(alice_guard.snapshot()), vec![alice]);

        // Own join is the first event on the stream
        match alice_guard.recv().await.unwrap() {
            PresenceEvent::Join { member } => assert_eq!(member.user_id, alice),
            other => panic!("expected join, got {other:?}"),
        }

        let bob_guard = dispatcher.join_presence(PresenceScope::Global, bob, json!({"name": "Bob"}));
        assert_eq!(bob_guard.snapshot().len(), 2);

        match alice_guard.recv().await.unwrap() {
            PresenceEvent::Join { member } => assert_eq!(member.user_id, bob),
            other => panic!("expected join, got {other:?}"),
        }

        drop(bob_guard);
        match alice_guard.recv().await.unwrap() {
            PresenceEvent::Leave { member } => assert_eq!(member.user_id, bob),
            other => panic!("expected leave, got {other:?}"),
        }

        let remaining = dispatcher.presence_members(PresenceScope::Global);
        assert_eq!(member_ids(&remaining), vec![alice]);
    }

    #[tokio::test]
    async fn room_scopes_are_independent() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let room = Uuid::new_v4();

        let _global = dispatcher.join_presence(PresenceScope::Global, user, json!({}));
        let room_guard = dispatcher.join_presence(PresenceScope::Room(room), user, json!({}));

        assert_eq!(dispatcher.presence_members(PresenceScope::Room(room)).len(), 1);

        drop(room_guard);
        assert!(dispatcher.presence_members(PresenceScope::Room(room)).is_empty());
        assert_eq!(dispatcher.presence_members(PresenceScope::Global).len(), 1);
    }

    #[tokio::test]
    async fn stale_guard_does_not_evict_a_newer_join() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let first = dispatcher.join_presence(PresenceScope::Global, user, json!({"conn": 1}));
        let second = dispatcher.join_presence(PresenceScope::Global, user, json!({"conn": 2}));

        drop(first);
        assert_eq!(dispatcher.presence_members(PresenceScope::Global).len(), 1);

        drop(second);
        assert!(dispatcher.presence_members(PresenceScope::Global).is_empty());
    }

    #[tokio::test]
    async fn signal_streams_filter_by_conversation() {
        let dispatcher = Dispatcher::new();
        let watched = Uuid::new_v4();
        let typist = Uuid::new_v4();

        let mut stream = dispatcher.signals(Some(watched));
        dispatcher.signal(Signal::TypingStart {
            conversation_id: Uuid::new_v4(),
            user_id: typist,
        });
        dispatcher.signal(Signal::TypingStart {
            conversation_id: watched,
            user_id: typist,
        });

        let signal = stream.recv().await.unwrap();
        assert_eq!(signal.conversation_id(), watched);
        assert_eq!(signal.user_id(), typist);
    }
}

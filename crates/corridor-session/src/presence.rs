use std::collections::HashMap;

use uuid::Uuid;

use corridor_types::events::{PresenceEvent, PresenceScope};

/// Session-side view of one presence scope, fed by sync/join/leave events.
/// Sync replaces the whole set; join is a union, leave removes exactly the
/// named member.
pub struct PresenceTracker {
    scope: PresenceScope,
    members: HashMap<Uuid, serde_json::Value>,
}

impl PresenceTracker {
    pub fn new(scope: PresenceScope) -> Self {
        Self {
            scope,
            members: HashMap::new(),
        }
    }

    pub fn scope(&self) -> PresenceScope {
        self.scope
    }

    /// Apply an event; returns whether the online set changed.
    pub fn apply(&mut self, event: PresenceEvent) -> bool {
        match event {
            PresenceEvent::Sync { members } => {
                let next: HashMap<Uuid, serde_json::Value> =
                    members.into_iter().map(|m| (m.user_id, m.payload)).collect();
                let changed = {
                    let mut before: Vec<&Uuid> = self.members.keys().collect();
                    let mut after: Vec<&Uuid> = next.keys().collect();
                    before.sort();
                    after.sort();
                    before != after
                };
                self.members = next;
                changed
            }
            PresenceEvent::Join { member } => {
                self.members.insert(member.user_id, member.payload).is_none()
            }
            PresenceEvent::Leave { member } => self.members.remove(&member.user_id).is_some(),
        }
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.members.contains_key(&user_id)
    }

    /// Sorted for stable output.
    pub fn online(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.members.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corridor_types::events::PresenceMember;
    use serde_json::json;

    fn member(user_id: Uuid) -> PresenceMember {
        PresenceMember {
            user_id,
            payload: json!({}),
        }
    }

    #[test]
    fn sync_replaces_the_whole_set() {
        let mut tracker = PresenceTracker::new(PresenceScope::Global);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(tracker.apply(PresenceEvent::Sync {
            members: vec![member(a), member(b)],
        }));
        assert!(tracker.apply(PresenceEvent::Sync {
            members: vec![member(c)],
        }));

        assert_eq!(tracker.online(), vec![c]);
        assert!(!tracker.contains(a));
    }

    #[test]
    fn join_is_a_union_and_idempotent() {
        let mut tracker = PresenceTracker::new(PresenceScope::Global);
        let a = Uuid::new_v4();

        assert!(tracker.apply(PresenceEvent::Join { member: member(a) }));
        // Replayed join changes nothing
        assert!(!tracker.apply(PresenceEvent::Join { member: member(a) }));
        assert_eq!(tracker.online(), vec![a]);
    }

    #[test]
    fn leave_removes_exactly_the_named_member() {
        let mut tracker = PresenceTracker::new(PresenceScope::Room(Uuid::new_v4()));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        tracker.apply(PresenceEvent::Sync {
            members: vec![member(a), member(b)],
        });

        assert!(tracker.apply(PresenceEvent::Leave { member: member(a) }));
        assert!(!tracker.apply(PresenceEvent::Leave { member: member(a) }));

        assert_eq!(tracker.online(), vec![b]);
        assert!(tracker.contains(b));
    }
}

use std::ops::Range;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use corridor_types::api::FeedPhase;
use corridor_types::models::Message;

/// Messages fetched per window, both for the initial load and when paging
/// backwards.
pub const FEED_WINDOW: u32 = 100;

/// Same-sender messages closer together than this render as one group.
const GROUPING_GAP_SECS: i64 = 5 * 60;

/// Split an ordered message list into display runs: consecutive messages
/// from one sender, none further apart than the grouping gap. A view over
/// the slice for render layers; stored order is untouched.
pub fn display_runs(messages: &[Message]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = 0;
    for (i, pair) in messages.windows(2).enumerate() {
        let gap = pair[1].created_at - pair[0].created_at;
        if pair[1].sender_id != pair[0].sender_id || gap.num_seconds() >= GROUPING_GAP_SECS {
            runs.push(start..i + 1);
            start = i + 1;
        }
    }
    if !messages.is_empty() {
        runs.push(start..messages.len());
    }
    runs
}

/// The active conversation's message list, always oldest first, ordered by
/// `(created_at, id)`. Owned by exactly one selection: the generation is
/// checked before any fetch result is committed, so answers for a
/// conversation the user already left are dropped.
pub struct Feed {
    conversation_id: Uuid,
    generation: u64,
    phase: FeedPhase,
    messages: Vec<Message>,
    exhausted: bool,
    loading_older: bool,
}

fn sort_key(message: &Message) -> (DateTime<Utc>, Uuid) {
    (message.created_at, message.id)
}

impl Feed {
    pub fn begin(conversation_id: Uuid, generation: u64) -> Self {
        Self {
            conversation_id,
            generation,
            phase: FeedPhase::Loading,
            messages: Vec::new(),
            exhausted: false,
            loading_older: false,
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> FeedPhase {
        self.phase
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Commit the initial window. Live inserts that raced the fetch are
    /// already in `messages`; they get folded back in rather than lost.
    pub fn commit_initial(&mut self, window: Vec<Message>, window_size: u32) {
        self.exhausted = (window.len() as u32) < window_size;
        let live = std::mem::take(&mut self.messages);
        self.messages = window;
        for message in live {
            self.apply_insert(message);
        }
        self.phase = FeedPhase::Ready;
    }

    /// Arm a backwards page. Returns the `(created_at, id)` cursor of the
    /// oldest loaded message when a fetch should happen, None when paging
    /// is pointless or one is already in flight.
    pub fn begin_older(&mut self) -> Option<(DateTime<Utc>, Uuid)> {
        if self.phase != FeedPhase::Ready || self.exhausted || self.loading_older {
            return None;
        }
        let oldest = self.messages.first()?;
        let cursor = sort_key(oldest);
        self.loading_older = true;
        Some(cursor)
    }

    /// Splice an older window in front of the current list.
    pub fn merge_older(&mut self, older: Vec<Message>, window_size: u32) {
        self.loading_older = false;
        if (older.len() as u32) < window_size {
            self.exhausted = true;
        }
        let mut merged: Vec<Message> = older
            .into_iter()
            .filter(|m| !self.messages.iter().any(|known| known.id == m.id))
            .collect();
        merged.append(&mut self.messages);
        self.messages = merged;
    }

    pub fn fail_older(&mut self) {
        self.loading_older = false;
    }

    /// Route a live INSERT. In-order messages append; late arrivals
    /// insert-sort into place. A known id replaces the stored copy.
    /// Returns whether the list changed.
    pub fn apply_insert(&mut self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        if let Some(pos) = self.messages.iter().position(|m| m.id == message.id) {
            self.messages[pos] = message;
            return true;
        }
        let key = sort_key(&message);
        let pos = self.messages.partition_point(|m| sort_key(m) <= key);
        if pos == self.messages.len() {
            self.messages.push(message);
        } else {
            self.messages.insert(pos, message);
        }
        true
    }

    /// Route a live UPDATE: replace by id, keep position. `created_at`
    /// never changes, so the order is untouched. Updates for messages
    /// outside the loaded window are ignored.
    pub fn apply_update(&mut self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        match self.messages.iter().position(|m| m.id == message.id) {
            Some(pos) => {
                self.messages[pos] = message;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(conversation_id: Uuid, offset_ms: i64, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            content: content.to_string(),
            created_at: DateTime::<Utc>::default() + Duration::milliseconds(offset_ms),
            edited_at: None,
            deleted: false,
            attachment: None,
        }
    }

    fn contents(feed: &Feed) -> Vec<&str> {
        feed.messages().iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn live_inserts_sort_late_arrivals_into_place() {
        let cid = Uuid::new_v4();
        let mut feed = Feed::begin(cid, 1);
        feed.commit_initial(
            vec![message(cid, 10, "first"), message(cid, 30, "third")],
            FEED_WINDOW,
        );

        // In-order append
        assert!(feed.apply_insert(message(cid, 40, "fourth")));
        // Late arrival lands between its neighbors
        assert!(feed.apply_insert(message(cid, 20, "second")));

        assert_eq!(contents(&feed), ["first", "second", "third", "fourth"]);
    }

    #[test]
    fn inserts_for_other_conversations_are_ignored() {
        let cid = Uuid::new_v4();
        let mut feed = Feed::begin(cid, 1);
        feed.commit_initial(vec![message(cid, 10, "only")], FEED_WINDOW);

        assert!(!feed.apply_insert(message(Uuid::new_v4(), 20, "elsewhere")));
        assert_eq!(contents(&feed), ["only"]);
    }

    #[test]
    fn duplicate_insert_replaces_instead_of_doubling() {
        let cid = Uuid::new_v4();
        let mut feed = Feed::begin(cid, 1);
        let mut m = message(cid, 10, "original");
        feed.commit_initial(vec![m.clone()], FEED_WINDOW);

        m.content = "replayed".to_string();
        assert!(feed.apply_insert(m));
        assert_eq!(contents(&feed), ["replayed"]);
    }

    #[test]
    fn updates_replace_in_place_and_ignore_unloaded_ids() {
        let cid = Uuid::new_v4();
        let mut feed = Feed::begin(cid, 1);
        let mut m = message(cid, 10, "typo");
        feed.commit_initial(vec![m.clone(), message(cid, 20, "later")], FEED_WINDOW);

        m.content = "fixed".to_string();
        m.edited_at = Some(Utc::now());
        assert!(feed.apply_update(m));
        assert_eq!(contents(&feed), ["fixed", "later"]);

        assert!(!feed.apply_update(message(cid, 5, "never loaded")));
    }

    #[test]
    fn initial_commit_keeps_messages_that_raced_the_fetch() {
        let cid = Uuid::new_v4();
        let mut feed = Feed::begin(cid, 1);

        // Arrived over the wire while the window fetch was in flight
        assert!(feed.apply_insert(message(cid, 50, "live")));
        assert_eq!(feed.phase(), FeedPhase::Loading);

        feed.commit_initial(vec![message(cid, 10, "stored")], FEED_WINDOW);
        assert_eq!(feed.phase(), FeedPhase::Ready);
        assert_eq!(contents(&feed), ["stored", "live"]);
    }

    #[test]
    fn paging_backwards_prepends_and_stops_at_history_start() {
        let cid = Uuid::new_v4();
        let mut feed = Feed::begin(cid, 1);
        let window: Vec<Message> = (0..3).map(|i| message(cid, 100 + i, "recent")).collect();
        feed.commit_initial(window, 3);
        assert!(!feed.exhausted());

        let cursor = feed.begin_older().expect("cursor");
        assert_eq!(cursor.0, feed.messages()[0].created_at);
        // A second request while one is in flight is a no-op
        assert!(feed.begin_older().is_none());

        feed.merge_older(vec![message(cid, 1, "old"), message(cid, 2, "older")], 3);
        assert_eq!(contents(&feed), ["old", "older", "recent", "recent", "recent"]);
        // Short window means history is exhausted
        assert!(feed.exhausted());
        assert!(feed.begin_older().is_none());
    }

    #[test]
    fn short_initial_window_marks_history_exhausted() {
        let cid = Uuid::new_v4();
        let mut feed = Feed::begin(cid, 7);
        feed.commit_initial(vec![message(cid, 10, "only")], FEED_WINDOW);
        assert!(feed.exhausted());
        assert!(feed.begin_older().is_none());
    }

    #[test]
    fn display_runs_break_on_sender_change_and_long_gaps() {
        let cid = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let from = |sender: Uuid, offset_ms: i64| {
            let mut m = message(cid, offset_ms, "x");
            m.sender_id = sender;
            m
        };

        let minute = 60 * 1_000;
        let messages = vec![
            from(alice, 0),
            from(alice, 1_000),
            from(bob, 2_000),
            from(alice, 3_000),
            from(alice, 3_000 + 6 * minute),
        ];

        assert_eq!(display_runs(&messages), vec![0..2, 2..3, 3..4, 4..5]);
        assert!(display_runs(&[]).is_empty());
    }
}

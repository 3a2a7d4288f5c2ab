use std::time::Duration;

use tokio::time::Instant;

use corridor_types::models::ConversationOverview;

/// How long a directory snapshot stays fresh without a push invalidation.
pub const DIRECTORY_TTL: Duration = Duration::from_secs(30);

/// Cached conversation directory. Entries survive failed refetches as the
/// last-good list, marked stale until a fetch succeeds again.
pub struct Directory {
    entries: Vec<ConversationOverview>,
    fetched_at: Option<Instant>,
    dirty: bool,
    stale: bool,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            fetched_at: None,
            dirty: true,
            stale: false,
        }
    }

    pub fn entries(&self) -> &[ConversationOverview] {
        &self.entries
    }

    pub fn stale(&self) -> bool {
        self.stale
    }

    /// Push invalidation: a change event told us the list is out of date.
    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    /// Time until the snapshot ages out; zero when a refetch is due now.
    pub fn time_to_refresh(&self, now: Instant) -> Duration {
        if self.dirty {
            return Duration::ZERO;
        }
        match self.fetched_at {
            None => Duration::ZERO,
            Some(at) => DIRECTORY_TTL.saturating_sub(now - at),
        }
    }

    pub fn needs_refresh(&self, now: Instant) -> bool {
        self.time_to_refresh(now).is_zero()
    }

    /// Mark the in-flight refetch. Invalidations landing while it runs set
    /// `dirty` again and force another round.
    pub fn begin_refresh(&mut self) {
        self.dirty = false;
    }

    pub fn commit(&mut self, entries: Vec<ConversationOverview>, now: Instant) {
        self.entries = entries;
        self.fetched_at = Some(now);
        self.stale = false;
    }

    /// A refetch failed: keep the last-good entries, mark them stale, and
    /// pace the retry by pretending this was a fetch.
    pub fn fail(&mut self, now: Instant) {
        self.fetched_at = Some(now);
        self.stale = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use corridor_types::models::{Conversation, ConversationKind};
    use uuid::Uuid;

    fn overview(name: &str) -> ConversationOverview {
        ConversationOverview {
            conversation: Conversation {
                id: Uuid::new_v4(),
                name: Some(name.to_string()),
                kind: ConversationKind::Group,
                unit: None,
                applicable_units: None,
                active: true,
                created_by: Uuid::new_v4(),
                created_at: Utc::now(),
                last_message: None,
            },
            display_name: name.to_string(),
            unread: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_ages_out_after_ttl() {
        let mut dir = Directory::new();
        assert!(dir.needs_refresh(Instant::now()));

        dir.begin_refresh();
        dir.commit(vec![overview("ward")], Instant::now());
        assert!(!dir.needs_refresh(Instant::now()));

        tokio::time::advance(DIRECTORY_TTL - Duration::from_secs(1)).await;
        assert!(!dir.needs_refresh(Instant::now()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(dir.needs_refresh(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_cuts_through_a_fresh_snapshot() {
        let mut dir = Directory::new();
        dir.begin_refresh();
        dir.commit(vec![], Instant::now());
        assert!(!dir.needs_refresh(Instant::now()));

        dir.invalidate();
        assert!(dir.needs_refresh(Instant::now()));

        // Invalidation during a refetch survives the commit
        dir.begin_refresh();
        dir.invalidate();
        dir.commit(vec![], Instant::now());
        assert!(dir.needs_refresh(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refetch_keeps_the_last_good_list() {
        let mut dir = Directory::new();
        dir.begin_refresh();
        dir.commit(vec![overview("icu"), overview("er")], Instant::now());

        tokio::time::advance(DIRECTORY_TTL + Duration::from_secs(1)).await;
        dir.begin_refresh();
        dir.fail(Instant::now());

        assert_eq!(dir.entries().len(), 2);
        assert!(dir.stale());
        // Retry is paced, not immediate
        assert!(!dir.needs_refresh(Instant::now()));

        dir.begin_refresh();
        dir.commit(vec![overview("icu")], Instant::now());
        assert!(!dir.stale());
    }
}

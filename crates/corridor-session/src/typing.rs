use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use corridor_types::events::Signal;

/// Receiver-side lifetime of a typing entry. A typist who goes silent
/// without a stop signal disappears after this.
pub const TYPING_TTL: Duration = Duration::from_secs(2);

/// Minimum gap between repeated start signals while typing continues.
/// Shorter than the TTL so an uninterrupted typist never flickers out.
pub const TYPING_KEEPALIVE: Duration = Duration::from_secs(1);

/// Sweep cadence for expiring silent typists.
pub const TYPING_SWEEP: Duration = Duration::from_millis(500);

/// Sender side: turns keystrokes into debounced start/stop signals.
pub struct TypingSignaler {
    user_id: Uuid,
    active: Option<(Uuid, Instant)>,
}

impl TypingSignaler {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            active: None,
        }
    }

    /// A keystroke landed in a conversation's draft. Returns the signals
    /// to publish: at most a stop for a previously typed-in conversation
    /// and a (possibly debounced-away) start for this one.
    pub fn keystroke(&mut self, conversation: Uuid, now: Instant) -> Vec<Signal> {
        let mut signals = Vec::new();

        if let Some((current, _)) = self.active
            && current != conversation
        {
            signals.push(Signal::TypingStop {
                conversation_id: current,
                user_id: self.user_id,
            });
            self.active = None;
        }

        match self.active {
            Some((_, last)) if now.duration_since(last) < TYPING_KEEPALIVE => {}
            _ => {
                signals.push(Signal::TypingStart {
                    conversation_id: conversation,
                    user_id: self.user_id,
                });
                self.active = Some((conversation, now));
            }
        }

        signals
    }

    /// Typing ended: the draft was cleared, sent, or the user moved on.
    pub fn stop(&mut self) -> Option<Signal> {
        self.active.take().map(|(conversation_id, _)| Signal::TypingStop {
            conversation_id,
            user_id: self.user_id,
        })
    }
}

/// Receiver side: who is typing in the watched conversation right now.
/// Entries self-expire; a missed stop only ever shows a short-lived ghost.
pub struct TypingRoster {
    me: Uuid,
    typists: HashMap<Uuid, Instant>,
}

impl TypingRoster {
    pub fn new(me: Uuid) -> Self {
        Self {
            me,
            typists: HashMap::new(),
        }
    }

    /// Apply a signal; returns whether the typist set changed. Own signals
    /// are ignored, a start for a known typist just refreshes its expiry.
    pub fn apply(&mut self, signal: &Signal, now: Instant) -> bool {
        if signal.user_id() == self.me {
            return false;
        }
        match signal {
            Signal::TypingStart { user_id, .. } => {
                self.typists.insert(*user_id, now + TYPING_TTL).is_none()
            }
            Signal::TypingStop { user_id, .. } => self.typists.remove(user_id).is_some(),
        }
    }

    /// Expire silent typists; returns whether the set changed.
    pub fn sweep(&mut self, now: Instant) -> bool {
        let before = self.typists.len();
        self.typists.retain(|_, expires| *expires > now);
        self.typists.len() != before
    }

    pub fn typists(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.typists.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(conversation: Uuid, user: Uuid) -> Signal {
        Signal::TypingStart {
            conversation_id: conversation,
            user_id: user,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_are_debounced_to_the_keepalive() {
        let me = Uuid::new_v4();
        let cid = Uuid::new_v4();
        let mut signaler = TypingSignaler::new(me);

        assert_eq!(signaler.keystroke(cid, Instant::now()).len(), 1);
        // Burst of keystrokes right after: silent
        assert!(signaler.keystroke(cid, Instant::now()).is_empty());

        tokio::time::advance(TYPING_KEEPALIVE + Duration::from_millis(10)).await;
        // Still typing a second later: refresh goes out
        assert_eq!(signaler.keystroke(cid, Instant::now()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_conversations_stops_the_old_one_first() {
        let me = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut signaler = TypingSignaler::new(me);

        signaler.keystroke(a, Instant::now());
        let signals = signaler.keystroke(b, Instant::now());

        assert!(matches!(signals[0], Signal::TypingStop { conversation_id, .. } if conversation_id == a));
        assert!(matches!(signals[1], Signal::TypingStart { conversation_id, .. } if conversation_id == b));

        let stop = signaler.stop().expect("stop signal");
        assert_eq!(stop.conversation_id(), b);
        assert!(signaler.stop().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_typists_expire_after_the_ttl() {
        let me = Uuid::new_v4();
        let cid = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut roster = TypingRoster::new(me);

        assert!(roster.apply(&start(cid, other), Instant::now()));
        assert_eq!(roster.typists(), vec![other]);

        tokio::time::advance(TYPING_TTL - Duration::from_millis(100)).await;
        assert!(!roster.sweep(Instant::now()));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(roster.sweep(Instant::now()));
        assert!(roster.typists().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_starts_push_expiry_out() {
        let me = Uuid::new_v4();
        let cid = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut roster = TypingRoster::new(me);

        roster.apply(&start(cid, other), Instant::now());
        tokio::time::advance(Duration::from_millis(1500)).await;

        // Refresh arrives before expiry; set unchanged but clock restarts
        assert!(!roster.apply(&start(cid, other), Instant::now()));
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!roster.sweep(Instant::now()));

        tokio::time::advance(TYPING_TTL).await;
        assert!(roster.sweep(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn own_signals_and_explicit_stops() {
        let me = Uuid::new_v4();
        let cid = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut roster = TypingRoster::new(me);

        // Own echo never shows up
        assert!(!roster.apply(&start(cid, me), Instant::now()));

        roster.apply(&start(cid, other), Instant::now());
        let stop = Signal::TypingStop {
            conversation_id: cid,
            user_id: other,
        };
        assert!(roster.apply(&stop, Instant::now()));
        assert!(roster.typists().is_empty());
    }
}

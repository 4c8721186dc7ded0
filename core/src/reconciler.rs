/// Ordered, de-duplicated message list for the active conversation
///
/// Merges the initial history, optimistic local sends and relay pushes.
/// Entries are appended in the order this client observes them and are never
/// re-sorted; reconciliation only rewrites an optimistic entry in place.
use crate::types::{ChatEntry, DeliveryStatus, Draft, Message, MessageId, ProvisionalId};
use tracing::debug;

/// Outcome of feeding a relay message into the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Duplicate,
}

#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<ChatEntry>,
    next_provisional: u64,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Seed from the history the relay returned when the conversation started
    pub fn load_history(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.apply_incoming(message);
        }
    }

    /// Insert a relay-delivered message unless its id is already present
    pub fn apply_incoming(&mut self, message: Message) -> Applied {
        if self.position_of(&message.id).is_some() {
            debug!("Dropping duplicate message {}", message.id);
            return Applied::Duplicate;
        }
        self.entries.push(ChatEntry::confirmed(message));
        Applied::Inserted
    }

    /// Append a pending entry so the sender sees it immediately
    pub fn apply_optimistic(&mut self, draft: Draft) -> ProvisionalId {
        let provisional = ProvisionalId::new(self.next_provisional);
        self.next_provisional += 1;
        self.entries.push(ChatEntry::optimistic(provisional, draft));
        provisional
    }

    /// Promote a pending entry to the relay's authoritative message.
    ///
    /// Returns false when no entry carries `provisional` (already reconciled,
    /// or the log was reset).
    pub fn confirm(&mut self, provisional: ProvisionalId, message: Message) -> bool {
        let Some(mut pos) = self.position_of_provisional(provisional) else {
            return false;
        };

        if let Some(existing) = self.position_of(&message.id) {
            // The broadcast echo overtook the ack; the sender's entry keeps its slot
            if existing != pos {
                self.entries.remove(existing);
                if existing < pos {
                    pos -= 1;
                }
            }
        }

        let entry = &mut self.entries[pos];
        entry.id = Some(message.id);
        entry.created_at = message.created_at;
        entry.body = message.body;
        entry.status = DeliveryStatus::Confirmed;
        true
    }

    /// Mark a pending entry as failed; it stays visible
    pub fn fail(&mut self, provisional: ProvisionalId, reason: impl Into<String>) -> bool {
        match self.position_of_provisional(provisional) {
            Some(pos) => {
                self.entries[pos].status = DeliveryStatus::Failed {
                    reason: reason.into(),
                };
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatEntry> {
        self.position_of(id).map(|pos| &self.entries[pos])
    }

    pub fn get_provisional(&self, provisional: ProvisionalId) -> Option<&ChatEntry> {
        self.position_of_provisional(provisional)
            .map(|pos| &self.entries[pos])
    }

    fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.id.as_ref() == Some(id))
    }

    fn position_of_provisional(&self, provisional: ProvisionalId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.provisional == Some(provisional))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationId;
    use chrono::Utc;

    fn conv() -> ConversationId {
        ConversationId::new("c1")
    }

    fn relay_msg(id: &str, sender: &str, body: &str) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: conv(),
            sender_id: sender.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
            read: false,
        }
    }

    fn draft(body: &str) -> Draft {
        Draft {
            conversation_id: conv(),
            sender_id: "alice".to_string(),
            body: body.to_string(),
        }
    }

    fn bodies(log: &MessageLog) -> Vec<&str> {
        log.entries().iter().map(|e| e.body.as_str()).collect()
    }

    fn count_id(log: &MessageLog, id: &str) -> usize {
        log.entries()
            .iter()
            .filter(|e| e.id.as_ref().map(MessageId::as_str) == Some(id))
            .count()
    }

    #[test]
    fn test_incoming_dedup_by_id() {
        let mut log = MessageLog::new();
        assert_eq!(log.apply_incoming(relay_msg("m1", "bob", "hey")), Applied::Inserted);
        assert_eq!(log.apply_incoming(relay_msg("m1", "bob", "hey")), Applied::Duplicate);
        // Same content, different id is a different message
        assert_eq!(log.apply_incoming(relay_msg("m2", "bob", "hey")), Applied::Inserted);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_ack_then_echo_yields_one_entry() {
        let mut log = MessageLog::new();
        let p = log.apply_optimistic(draft("hi"));
        assert_eq!(log.entries()[0].status, DeliveryStatus::Pending);

        assert!(log.confirm(p, relay_msg("m1", "alice", "hi")));
        assert_eq!(log.apply_incoming(relay_msg("m1", "alice", "hi")), Applied::Duplicate);

        assert_eq!(log.len(), 1);
        let entry = &log.entries()[0];
        assert_eq!(entry.id, Some(MessageId::new("m1")));
        assert_eq!(entry.body, "hi");
        assert_eq!(entry.status, DeliveryStatus::Confirmed);
    }

    #[test]
    fn test_echo_then_ack_yields_one_entry() {
        let mut log = MessageLog::new();
        let p = log.apply_optimistic(draft("hi"));
        log.apply_incoming(relay_msg("m1", "alice", "hi"));
        assert_eq!(log.len(), 2);

        assert!(log.confirm(p, relay_msg("m1", "alice", "hi")));
        assert_eq!(log.len(), 1);
        assert_eq!(count_id(&log, "m1"), 1);
        let entry = log.get_provisional(p).unwrap();
        assert_eq!(entry.id, Some(MessageId::new("m1")));
        assert_eq!(entry.status, DeliveryStatus::Confirmed);
    }

    #[test]
    fn test_echo_after_foreign_message_keeps_sender_slot() {
        let mut log = MessageLog::new();
        let p = log.apply_optimistic(draft("b"));
        log.apply_incoming(relay_msg("m9", "bob", "c"));
        log.apply_incoming(relay_msg("m1", "alice", "b"));
        assert_eq!(bodies(&log), vec!["b", "c", "b"]);

        assert!(log.confirm(p, relay_msg("m1", "alice", "b")));
        assert_eq!(bodies(&log), vec!["b", "c"]);
        assert_eq!(log.entries()[0].id, Some(MessageId::new("m1")));
        assert_eq!(log.entries()[0].status, DeliveryStatus::Confirmed);
        assert_eq!(log.entries()[1].id, Some(MessageId::new("m9")));
    }

    #[test]
    fn test_echo_before_optimistic_entry_is_folded_in() {
        let mut log = MessageLog::new();
        log.apply_incoming(relay_msg("m1", "alice", "hi"));
        log.apply_incoming(relay_msg("m9", "bob", "yo"));
        let p = log.apply_optimistic(draft("hi"));

        assert!(log.confirm(p, relay_msg("m1", "alice", "hi")));
        assert_eq!(bodies(&log), vec!["yo", "hi"]);
        assert_eq!(log.get_provisional(p).unwrap().id, Some(MessageId::new("m1")));
    }

    #[test]
    fn test_concurrent_acks_matched_by_provisional_id() {
        let mut log = MessageLog::new();
        let first = log.apply_optimistic(draft("one"));
        let second = log.apply_optimistic(draft("two"));

        // Acks arrive in reverse order
        log.confirm(second, relay_msg("m2", "alice", "two"));
        log.confirm(first, relay_msg("m1", "alice", "one"));

        assert_eq!(bodies(&log), vec!["one", "two"]);
        assert_eq!(log.entries()[0].id, Some(MessageId::new("m1")));
        assert_eq!(log.entries()[1].id, Some(MessageId::new("m2")));
    }

    #[test]
    fn test_reconciliation_keeps_relative_order() {
        let mut log = MessageLog::new();
        log.apply_incoming(relay_msg("m0", "bob", "a"));
        let p1 = log.apply_optimistic(draft("b"));
        log.apply_incoming(relay_msg("m9", "bob", "c"));
        let p2 = log.apply_optimistic(draft("d"));
        log.apply_incoming(relay_msg("m2", "alice", "d"));
        assert_eq!(bodies(&log), vec!["a", "b", "c", "d", "d"]);

        log.confirm(p1, relay_msg("m1", "alice", "b"));
        log.confirm(p2, relay_msg("m2", "alice", "d"));
        assert_eq!(bodies(&log), vec!["a", "b", "c", "d"]);

        log.apply_incoming(relay_msg("m1", "alice", "b"));
        log.apply_incoming(relay_msg("m3", "bob", "e"));
        assert_eq!(bodies(&log), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_dedup_holds_for_every_interleaving() {
        // Optimistic send, ack and echo in all six orders
        let steps = ["optimistic", "ack", "echo"];
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [2, 0, 1],
            [2, 1, 0],
            [1, 0, 2],
            [1, 2, 0],
        ];
        for order in orders {
            let mut log = MessageLog::new();
            let mut provisional = None;
            let mut ack_seen = false;
            for &i in &order {
                match steps[i] {
                    "optimistic" => {
                        let p = log.apply_optimistic(draft("hi"));
                        if ack_seen {
                            log.confirm(p, relay_msg("m1", "alice", "hi"));
                        }
                        provisional = Some(p);
                    }
                    "ack" => {
                        ack_seen = true;
                        if let Some(p) = provisional {
                            log.confirm(p, relay_msg("m1", "alice", "hi"));
                        }
                    }
                    _ => {
                        log.apply_incoming(relay_msg("m1", "alice", "hi"));
                    }
                }
            }
            assert_eq!(count_id(&log, "m1"), 1, "order {:?}", order);
            assert_eq!(log.len(), 1, "order {:?}", order);
        }
    }

    #[test]
    fn test_failed_entry_stays_visible() {
        let mut log = MessageLog::new();
        let p = log.apply_optimistic(draft("lost"));
        assert!(log.fail(p, "relay said no"));
        let entry = log.get_provisional(p).unwrap();
        assert!(entry.is_failed());
        assert!(entry.id.is_none());
        assert!(!log.fail(ProvisionalId::new(99), "unknown"));
    }

    #[test]
    fn test_history_dedup() {
        let mut log = MessageLog::new();
        log.load_history(vec![
            relay_msg("m1", "bob", "a"),
            relay_msg("m2", "alice", "b"),
            relay_msg("m1", "bob", "a"),
        ]);
        assert_eq!(bodies(&log), vec!["a", "b"]);
        assert!(log.get(&MessageId::new("m2")).is_some());
    }

    #[test]
    fn test_provisional_ids_are_unique() {
        let mut log = MessageLog::new();
        let a = log.apply_optimistic(draft("x"));
        let b = log.apply_optimistic(draft("x"));
        assert_ne!(a, b);
    }
}

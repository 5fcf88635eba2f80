use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::models::{HistoryItem, HistoryPair, QueryRecord, ResponseRecord};

// ============================================================================
// IN-FLIGHT ENTRIES
// ============================================================================

#[derive(Debug, Clone)]
struct SlotEntry {
    query: QueryRecord,
    response: Option<ResponseRecord>,
}

/// A query that went out to one or more slots and is still collecting answers.
#[derive(Debug, Clone)]
struct InFlightEntry {
    content: String,
    timestamp: DateTime<Utc>,
    slots: BTreeMap<usize, SlotEntry>,
    /// Slots dropped from this entry unanswered; they never rejoin it.
    departed: BTreeSet<usize>,
}

impl InFlightEntry {
    fn new(query: &QueryRecord) -> Self {
        Self {
            content: query.content.clone(),
            timestamp: query.timestamp,
            slots: BTreeMap::new(),
            departed: BTreeSet::new(),
        }
    }

    fn accepts(&self, slot: usize, content: &str) -> bool {
        self.content == content
            && !self.slots.contains_key(&slot)
            && !self.departed.contains(&slot)
    }

    fn depart(&mut self, slot: usize) {
        self.slots.remove(&slot);
        self.departed.insert(slot);
    }

    fn is_complete(&self) -> bool {
        !self.slots.is_empty() && self.slots.values().all(|e| e.response.is_some())
    }

    fn into_history_item(self) -> HistoryItem {
        let pairs = self
            .slots
            .into_iter()
            .filter_map(|(slot_index, entry)| {
                entry.response.map(|response| HistoryPair {
                    slot_index,
                    query: entry.query,
                    response,
                })
            })
            .collect();

        HistoryItem {
            id: Uuid::now_v7(),
            query: self.content,
            timestamp: self.timestamp,
            pairs,
        }
    }
}

// ============================================================================
// HISTORY CORRELATOR
// ============================================================================

/// Pairs every slot's answer with the query that caused it and emits one
/// [`HistoryItem`] per query once all participating slots have answered.
///
/// Also tracks whether the consumer is browsing history or composing.
#[derive(Debug, Default)]
pub struct HistoryCorrelator {
    in_flight: Vec<InFlightEntry>,
    history: Vec<HistoryItem>,
    history_mode: bool,
    selected_id: Option<Uuid>,
    preparing_new_message: bool,
}

impl HistoryCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries are keyed by query text; a slot joins the oldest entry for that
    /// text it has neither contributed to nor been dropped from, so repeated
    /// identical queries each get their own entry.
    pub fn record_query_sent(&mut self, slot: usize, query: QueryRecord) {
        let index = match self.in_flight.iter().position(|e| e.accepts(slot, &query.content)) {
            Some(index) => index,
            None => {
                self.in_flight.push(InFlightEntry::new(&query));
                self.in_flight.len() - 1
            }
        };

        self.in_flight[index].slots.insert(
            slot,
            SlotEntry {
                query,
                response: None,
            },
        );
    }

    /// Attach a response; returns the history item if this completed its entry.
    pub fn record_response_received(
        &mut self,
        slot: usize,
        response: ResponseRecord,
    ) -> Option<HistoryItem> {
        let Some(index) = self.in_flight.iter().position(|e| {
            e.slots
                .values()
                .any(|s| s.query.id == response.query_id)
        }) else {
            log::debug!(
                "Dropping response from slot {} for unknown query {}",
                slot,
                response.query_id
            );
            return None;
        };

        let entry = &mut self.in_flight[index];
        if let Some(slot_entry) = entry
            .slots
            .values_mut()
            .find(|s| s.query.id == response.query_id)
        {
            if slot_entry.response.is_some() {
                log::debug!("Slot {} answered query {} twice", slot, response.query_id);
                return None;
            }
            slot_entry.response = Some(response);
        }

        self.complete_at(index)
    }

    /// Stop waiting for one slot's answer to one query.
    pub fn abandon_query(&mut self, slot: usize, query_id: Uuid) -> Option<HistoryItem> {
        let index = self.in_flight.iter().position(|e| {
            e.slots
                .get(&slot)
                .is_some_and(|s| s.query.id == query_id && s.response.is_none())
        })?;
        self.in_flight[index].depart(slot);
        log::debug!("Slot {} abandoned query {}", slot, query_id);
        self.complete_at(index)
    }

    /// Stop waiting for every unanswered query on `slot`.
    pub fn abandon_slot(&mut self, slot: usize) -> Vec<HistoryItem> {
        for entry in &mut self.in_flight {
            if entry.slots.get(&slot).is_some_and(|s| s.response.is_none()) {
                entry.depart(slot);
            }
        }
        self.sweep()
    }

    /// Stop waiting on every slot; used when the connection set is rebuilt.
    pub fn abandon_unanswered(&mut self) -> Vec<HistoryItem> {
        for entry in &mut self.in_flight {
            let unanswered: Vec<usize> = entry
                .slots
                .iter()
                .filter(|(_, s)| s.response.is_none())
                .map(|(slot, _)| *slot)
                .collect();
            for slot in unanswered {
                entry.depart(slot);
            }
        }
        self.sweep()
    }

    fn complete_at(&mut self, index: usize) -> Option<HistoryItem> {
        let entry = &self.in_flight[index];
        if entry.slots.is_empty() {
            self.in_flight.remove(index);
            return None;
        }
        if !entry.is_complete() {
            return None;
        }
        let item = self.in_flight.remove(index).into_history_item();
        Some(self.push_history(item))
    }

    fn sweep(&mut self) -> Vec<HistoryItem> {
        let mut completed = Vec::new();
        let mut remaining = Vec::with_capacity(self.in_flight.len());
        for entry in self.in_flight.drain(..) {
            if entry.is_complete() {
                completed.push(entry.into_history_item());
            } else if !entry.slots.is_empty() {
                remaining.push(entry);
            }
        }
        self.in_flight = remaining;
        completed
            .into_iter()
            .map(|item| self.push_history(item))
            .collect()
    }

    fn push_history(&mut self, item: HistoryItem) -> HistoryItem {
        log::info!(
            "📚 History item {} for \"{}\" ({} slot(s))",
            item.id,
            item.query,
            item.pairs.len()
        );
        self.history.insert(0, item.clone());
        item
    }

    // ------------------------------------------------------------------------
    // View state
    // ------------------------------------------------------------------------

    pub fn select_history(&mut self, item_id: Uuid) -> Option<&HistoryItem> {
        let item = self.history.iter().find(|i| i.id == item_id)?;
        self.history_mode = true;
        self.selected_id = Some(item_id);
        self.preparing_new_message = false;
        Some(item)
    }

    /// Leave history view to compose, without resetting anything else.
    pub fn prepare_new_message(&mut self) {
        self.preparing_new_message = true;
        self.history_mode = false;
        self.selected_id = None;
    }

    pub fn exit_history_mode(&mut self) {
        self.history_mode = false;
        self.selected_id = None;
        self.preparing_new_message = false;
    }

    /// Forget everything, including queries still waiting for answers.
    pub fn clear_history(&mut self) {
        self.exit_history_mode();
        self.in_flight.clear();
        self.history.clear();
    }

    pub fn history(&self) -> &[HistoryItem] {
        &self.history
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_history_mode(&self) -> bool {
        self.history_mode
    }

    pub fn selected_id(&self) -> Option<Uuid> {
        self.selected_id
    }

    pub fn is_preparing_new_message(&self) -> bool {
        self.preparing_new_message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatConfig;

    fn send(correlator: &mut HistoryCorrelator, slot: usize, text: &str) -> QueryRecord {
        let query = QueryRecord::new(slot, text, ChatConfig::default());
        correlator.record_query_sent(slot, query.clone());
        query
    }

    fn answer(
        correlator: &mut HistoryCorrelator,
        query: &QueryRecord,
        text: &str,
    ) -> Option<HistoryItem> {
        correlator.record_response_received(
            query.slot_index,
            ResponseRecord::new(query.slot_index, query.id, text),
        )
    }

    #[test]
    fn test_item_emitted_only_when_all_slots_answer() {
        let mut correlator = HistoryCorrelator::new();
        let queries: Vec<_> = (0..3).map(|slot| send(&mut correlator, slot, "Q")).collect();
        assert_eq!(correlator.in_flight_len(), 1);

        assert!(answer(&mut correlator, &queries[2], "c").is_none());
        assert!(answer(&mut correlator, &queries[0], "a").is_none());
        let item = answer(&mut correlator, &queries[1], "b").unwrap();

        assert_eq!(item.query, "Q");
        let slots: Vec<_> = item.pairs.iter().map(|p| p.slot_index).collect();
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(item.response_for(1).unwrap().content, "b");
        assert_eq!(correlator.in_flight_len(), 0);
        assert_eq!(correlator.history().len(), 1);
    }

    #[test]
    fn test_history_is_most_recent_first() {
        let mut correlator = HistoryCorrelator::new();
        let first = send(&mut correlator, 0, "one");
        answer(&mut correlator, &first, "1");
        let second = send(&mut correlator, 0, "two");
        answer(&mut correlator, &second, "2");

        let queries: Vec<_> = correlator.history().iter().map(|i| i.query.as_str()).collect();
        assert_eq!(queries, vec!["two", "one"]);
    }

    #[test]
    fn test_identical_text_does_not_collide() {
        let mut correlator = HistoryCorrelator::new();
        let a0 = send(&mut correlator, 0, "same");
        let a1 = send(&mut correlator, 1, "same");
        let b0 = send(&mut correlator, 0, "same");
        let b1 = send(&mut correlator, 1, "same");
        assert_eq!(correlator.in_flight_len(), 2);

        assert!(answer(&mut correlator, &b0, "b0").is_none());
        assert!(answer(&mut correlator, &a0, "a0").is_none());
        let second = answer(&mut correlator, &b1, "b1").unwrap();
        assert_eq!(second.response_for(0).unwrap().content, "b0");
        let first = answer(&mut correlator, &a1, "a1").unwrap();
        assert_eq!(first.response_for(0).unwrap().content, "a0");
    }

    #[test]
    fn test_dropped_slot_starts_a_fresh_entry() {
        let mut correlator = HistoryCorrelator::new();
        let first0 = send(&mut correlator, 0, "X");
        let first1 = send(&mut correlator, 1, "X");
        assert!(correlator.abandon_query(0, first0.id).is_none());

        let second0 = send(&mut correlator, 0, "X");
        let second1 = send(&mut correlator, 1, "X");
        assert_eq!(correlator.in_flight_len(), 2);

        let earlier = answer(&mut correlator, &first1, "slot1-first").unwrap();
        let slots: Vec<_> = earlier.pairs.iter().map(|p| p.slot_index).collect();
        assert_eq!(slots, vec![1]);

        assert!(answer(&mut correlator, &second0, "slot0-second").is_none());
        let later = answer(&mut correlator, &second1, "slot1-second").unwrap();
        assert_eq!(later.response_for(0).unwrap().content, "slot0-second");
        assert_eq!(later.response_for(1).unwrap().content, "slot1-second");
        assert_eq!(correlator.in_flight_len(), 0);
    }

    #[test]
    fn test_unknown_and_duplicate_responses_are_dropped() {
        let mut correlator = HistoryCorrelator::new();
        let q0 = send(&mut correlator, 0, "Q");
        let q1 = send(&mut correlator, 1, "Q");

        let stray = ResponseRecord::new(0, Uuid::now_v7(), "stray");
        assert!(correlator.record_response_received(0, stray).is_none());

        assert!(answer(&mut correlator, &q0, "first").is_none());
        assert!(answer(&mut correlator, &q0, "again").is_none());
        let item = answer(&mut correlator, &q1, "b").unwrap();
        assert_eq!(item.response_for(0).unwrap().content, "first");
    }

    #[test]
    fn test_abandoned_slot_does_not_stall() {
        let mut correlator = HistoryCorrelator::new();
        let q0 = send(&mut correlator, 0, "hello");
        let q1 = send(&mut correlator, 1, "hello");
        let q2 = send(&mut correlator, 2, "hello");

        assert!(answer(&mut correlator, &q0, "hi").is_none());
        assert!(answer(&mut correlator, &q2, "hey").is_none());

        let item = correlator.abandon_query(1, q1.id).unwrap();
        assert_eq!(item.pairs.len(), 2);
        assert!(item.response_for(1).is_none());

        // A late answer for the abandoned slot is ignored.
        assert!(answer(&mut correlator, &q1, "late").is_none());
        assert_eq!(correlator.history().len(), 1);
    }

    #[test]
    fn test_abandon_slot_and_unanswered() {
        let mut correlator = HistoryCorrelator::new();
        let q0 = send(&mut correlator, 0, "a");
        let _q1 = send(&mut correlator, 1, "a");
        let _only = send(&mut correlator, 1, "b");

        answer(&mut correlator, &q0, "x");
        let done = correlator.abandon_slot(1);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].query, "a");
        // "b" had no other participant and is discarded, not recorded.
        assert_eq!(correlator.in_flight_len(), 0);

        let _q = send(&mut correlator, 0, "c");
        assert!(correlator.abandon_unanswered().is_empty());
        assert_eq!(correlator.in_flight_len(), 0);
        assert_eq!(correlator.history().len(), 1);
    }

    #[test]
    fn test_view_flags() {
        let mut correlator = HistoryCorrelator::new();
        let q = send(&mut correlator, 0, "Q");
        let item = answer(&mut correlator, &q, "A").unwrap();

        correlator.prepare_new_message();
        assert!(correlator.is_preparing_new_message());

        assert!(correlator.select_history(item.id).is_some());
        assert!(correlator.is_history_mode());
        assert_eq!(correlator.selected_id(), Some(item.id));
        assert!(!correlator.is_preparing_new_message());

        assert!(correlator.select_history(Uuid::now_v7()).is_none());

        correlator.exit_history_mode();
        assert!(!correlator.is_history_mode());
        assert!(correlator.selected_id().is_none());
    }

    #[test]
    fn test_clear_history_purges_in_flight() {
        let mut correlator = HistoryCorrelator::new();
        let q = send(&mut correlator, 0, "Q");
        answer(&mut correlator, &q, "A");
        send(&mut correlator, 0, "pending");

        correlator.clear_history();
        assert_eq!(correlator.in_flight_len(), 0);
        assert!(correlator.history().is_empty());
        assert!(!correlator.is_history_mode());
    }
}

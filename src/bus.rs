//! Notification bus
//!
//! Turns raw coordination activity into consumable events. Every consumer has
//! its own queue kept in sequence order; priority only decides which pending
//! events a drain hands out first. Bursts of content changes to one document
//! collapse into a single event, and a full queue sheds its oldest
//! low-priority events behind a synthesized overflow marker.

use crate::clock::{chrono_duration, SharedClock};
use crate::observability::CoordinationMetrics;
use crate::phase::Phase;
use crate::priority::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ContentChanged,
    Signal,
    PhaseChanged,
    EditRejected,
    LockReclaimed,
    Overflow,
}

/// One changed region of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRegion {
    pub holder: String,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Change {
        regions: Vec<ChangeRegion>,
    },
    Message {
        from: String,
        text: String,
    },
    Phase {
        from: Phase,
        to: Phase,
        usage: u64,
        capacity: u64,
    },
    Rejection {
        holder: String,
        reason: String,
        detail: String,
    },
    Reclamation {
        previous_holder: String,
        reclaimed_by: String,
    },
    Overflow {
        dropped: u64,
    },
}

/// An event before the bus stamps it with a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: EventKind,
    pub target: String,
    pub payload: EventPayload,
    pub priority: Priority,
}

impl Notification {
    pub fn content_changed(document: &str, region: ChangeRegion) -> Self {
        Self {
            kind: EventKind::ContentChanged,
            target: document.to_string(),
            payload: EventPayload::Change { regions: vec![region] },
            priority: Priority::Normal,
        }
    }

    pub fn signal(to_agent: &str, from_agent: &str, text: &str) -> Self {
        Self {
            kind: EventKind::Signal,
            target: to_agent.to_string(),
            payload: EventPayload::Message {
                from: from_agent.to_string(),
                text: text.to_string(),
            },
            priority: Priority::Normal,
        }
    }

    pub fn phase_changed(from: Phase, to: Phase, usage: u64, capacity: u64) -> Self {
        Self {
            kind: EventKind::PhaseChanged,
            target: "mission".to_string(),
            payload: EventPayload::Phase {
                from,
                to,
                usage,
                capacity,
            },
            priority: Priority::Urgent,
        }
    }

    pub fn edit_rejected(document: &str, holder: &str, reason: &str, detail: String) -> Self {
        Self {
            kind: EventKind::EditRejected,
            target: document.to_string(),
            payload: EventPayload::Rejection {
                holder: holder.to_string(),
                reason: reason.to_string(),
                detail,
            },
            priority: Priority::Normal,
        }
    }

    pub fn lock_reclaimed(document: &str, previous_holder: &str, reclaimed_by: &str) -> Self {
        Self {
            kind: EventKind::LockReclaimed,
            target: document.to_string(),
            payload: EventPayload::Reclamation {
                previous_holder: previous_holder.to_string(),
                reclaimed_by: reclaimed_by.to_string(),
            },
            priority: Priority::Urgent,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub sequence: u64,
    /// Sequence of the newest event folded into this one.
    pub last_sequence: u64,
    pub kind: EventKind,
    pub target: String,
    pub payload: EventPayload,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub merged: u32,
}

impl NotificationEvent {
    fn can_absorb(&self, incoming: &Notification, now: DateTime<Utc>, window: Duration) -> bool {
        !window.is_zero()
            && self.kind == EventKind::ContentChanged
            && incoming.kind == EventKind::ContentChanged
            && self.target == incoming.target
            && self.priority == incoming.priority
            && now - self.created_at <= chrono_duration(window)
    }

    fn absorb(&mut self, incoming: &Notification, sequence: u64, now: DateTime<Utc>) {
        if let (EventPayload::Change { regions }, EventPayload::Change { regions: more }) =
            (&mut self.payload, &incoming.payload)
        {
            regions.extend(more.iter().cloned());
        }
        self.last_sequence = sequence;
        self.updated_at = now;
        self.merged += 1;
    }
}

#[derive(Debug, Default)]
struct BusState {
    next_sequence: u64,
    queues: HashMap<String, VecDeque<NotificationEvent>>,
}

impl BusState {
    fn take_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}

pub struct NotificationBus {
    state: Mutex<BusState>,
    notify: Notify,
    coalesce_window: Duration,
    queue_cap: usize,
    clock: SharedClock,
    metrics: Arc<CoordinationMetrics>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("coalesce_window", &self.coalesce_window)
            .field("queue_cap", &self.queue_cap)
            .finish()
    }
}

impl NotificationBus {
    pub fn new(
        coalesce_window: Duration,
        queue_cap: usize,
        clock: SharedClock,
        metrics: Arc<CoordinationMetrics>,
    ) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            notify: Notify::new(),
            coalesce_window,
            queue_cap: queue_cap.max(1),
            clock,
            metrics,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a consumer. Only events published after registration are
    /// delivered to it. Returns false if it was already registered.
    pub fn subscribe(&self, consumer: &str) -> bool {
        let mut state = self.lock_state();
        if state.queues.contains_key(consumer) {
            return false;
        }
        state.queues.insert(consumer.to_string(), VecDeque::new());
        debug!(consumer = %consumer, "Notification consumer registered");
        true
    }

    pub fn unsubscribe(&self, consumer: &str) -> bool {
        self.lock_state().queues.remove(consumer).is_some()
    }

    pub fn consumers(&self) -> Vec<String> {
        let mut consumers: Vec<String> = self.lock_state().queues.keys().cloned().collect();
        consumers.sort();
        consumers
    }

    pub fn pending(&self, consumer: &str) -> usize {
        self.lock_state().queues.get(consumer).map_or(0, VecDeque::len)
    }

    /// Publish to every registered consumer. Never blocks beyond the bus's own
    /// short critical section. Returns the assigned sequence number.
    pub fn publish(&self, notification: Notification) -> u64 {
        let now = self.clock.now();
        let mut state = self.lock_state();
        let sequence = state.take_sequence();

        let event = NotificationEvent {
            sequence,
            last_sequence: sequence,
            kind: notification.kind,
            target: notification.target.clone(),
            payload: notification.payload.clone(),
            priority: notification.priority,
            created_at: now,
            updated_at: now,
            merged: 0,
        };

        let mut next_sequence = state.next_sequence;
        let mut merged = 0u64;
        let mut dropped = 0u64;
        for (consumer, queue) in state.queues.iter_mut() {
            if let Some(last) = queue.back_mut() {
                if last.can_absorb(&notification, now, self.coalesce_window) {
                    last.absorb(&notification, sequence, now);
                    merged += 1;
                    continue;
                }
            }
            queue.push_back(event.clone());
            let shed = enforce_cap(queue, self.queue_cap, &mut next_sequence, now);
            if shed > 0 {
                warn!(consumer = %consumer, dropped = shed, "Notification queue overflow, dropped oldest events");
                dropped += shed;
            }
        }
        state.next_sequence = next_sequence;
        drop(state);

        self.metrics.record_event_published();
        for _ in 0..merged {
            self.metrics.record_event_merged();
        }
        if dropped > 0 {
            self.metrics.record_events_dropped(dropped);
        }
        debug!(sequence, kind = ?event.kind, target = %event.target, "Notification published");
        self.notify.notify_waiters();
        sequence
    }

    /// Remove and return up to `max` pending events for `consumer`, highest
    /// priority first and in sequence order within a priority. Consumers must
    /// [`subscribe`](Self::subscribe) first; an unknown id gets nothing and
    /// is not registered.
    pub fn drain(&self, consumer: &str, max: usize) -> Vec<NotificationEvent> {
        let mut state = self.lock_state();
        let Some(queue) = state.queues.get_mut(consumer) else {
            debug!(consumer = %consumer, "Drain from unsubscribed consumer");
            return Vec::new();
        };

        let mut batch = Vec::with_capacity(max.min(queue.len()));
        for priority in Priority::DESCENDING {
            if batch.len() >= max {
                break;
            }
            let mut index = 0;
            while index < queue.len() && batch.len() < max {
                if queue[index].priority == priority {
                    if let Some(event) = queue.remove(index) {
                        batch.push(event);
                    }
                } else {
                    index += 1;
                }
            }
        }
        batch
    }

    /// Like [`drain`](Self::drain) but parks until at least one event is
    /// pending or `wait` elapses. Returns immediately for an unknown consumer.
    pub async fn wait_and_drain(&self, consumer: &str, max: usize, wait: Duration) -> Vec<NotificationEvent> {
        if !self.lock_state().queues.contains_key(consumer) {
            debug!(consumer = %consumer, "Wait from unsubscribed consumer");
            return Vec::new();
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let batch = self.drain(consumer, max);
            if !batch.is_empty() {
                return batch;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }
}

/// Sheds the oldest lowest-priority events once `cap` regular events are
/// exceeded, folding the loss into one overflow marker. Returns how many
/// events were dropped.
fn enforce_cap(
    queue: &mut VecDeque<NotificationEvent>,
    cap: usize,
    next_sequence: &mut u64,
    now: DateTime<Utc>,
) -> u64 {
    let regular = |queue: &VecDeque<NotificationEvent>| {
        queue.iter().filter(|event| event.kind != EventKind::Overflow).count()
    };

    let mut dropped = 0u64;
    while regular(queue) > cap {
        let victim = Priority::DESCENDING.iter().rev().find_map(|priority| {
            queue
                .iter()
                .position(|event| event.kind != EventKind::Overflow && event.priority == *priority)
        });
        match victim {
            Some(index) => {
                queue.remove(index);
                dropped += 1;
            }
            None => break,
        }
    }

    if dropped == 0 {
        return 0;
    }

    let existing = queue.iter_mut().find(|event| event.kind == EventKind::Overflow);
    match existing {
        Some(marker) => {
            if let EventPayload::Overflow { dropped: total } = &mut marker.payload {
                *total += dropped;
            }
            marker.updated_at = now;
        }
        None => {
            *next_sequence += 1;
            queue.push_back(NotificationEvent {
                sequence: *next_sequence,
                last_sequence: *next_sequence,
                kind: EventKind::Overflow,
                target: "bus".to_string(),
                payload: EventPayload::Overflow { dropped },
                priority: Priority::Urgent,
                created_at: now,
                updated_at: now,
                merged: 0,
            });
        }
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bus_with(window: Duration, cap: usize) -> (NotificationBus, ManualClock) {
        let clock = ManualClock::default();
        let bus = NotificationBus::new(window, cap, Arc::new(clock.clone()), Arc::new(CoordinationMetrics::new()));
        (bus, clock)
    }

    fn region(before: &str, after: &str) -> ChangeRegion {
        ChangeRegion {
            holder: "agent-a".to_string(),
            before: before.to_string(),
            after: after.to_string(),
        }
    }

    #[test]
    fn test_drain_does_not_register_unknown_consumers() {
        let (bus, _) = bus_with(Duration::ZERO, 16);
        for request in 0..50 {
            assert!(bus.drain(&format!("dashboard-{request}"), 10).is_empty());
        }
        assert!(bus.consumers().is_empty());

        bus.publish(Notification::signal("agent-b", "agent-a", "review please"));
        assert!(bus.drain("ui", 10).is_empty());

        bus.subscribe("ui");
        bus.publish(Notification::signal("agent-b", "agent-a", "again"));
        let events = bus.drain("ui", 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Signal);
    }

    #[test]
    fn test_urgent_events_drain_first_and_sequence_order_holds_within_tier() {
        let (bus, _) = bus_with(Duration::ZERO, 16);
        bus.subscribe("ui");

        let first = bus.publish(Notification::content_changed("a.md", region("1", "2")));
        let second = bus.publish(Notification::content_changed("b.md", region("1", "2")));
        let urgent = bus.publish(Notification::phase_changed(Phase::Expansion, Phase::Convergence, 70, 100));

        let events = bus.drain("ui", 10);
        let sequences: Vec<u64> = events.iter().map(|event| event.sequence).collect();
        assert_eq!(sequences, vec![urgent, first, second]);
    }

    #[test]
    fn test_drain_respects_max() {
        let (bus, _) = bus_with(Duration::ZERO, 16);
        bus.subscribe("ui");
        for i in 0..5 {
            bus.publish(Notification::content_changed(&format!("{i}.md"), region("a", "b")));
        }

        assert_eq!(bus.drain("ui", 2).len(), 2);
        assert_eq!(bus.pending("ui"), 3);
        let rest = bus.drain("ui", 10);
        assert_eq!(rest.len(), 3);
        assert!(rest.windows(2).all(|pair| pair[0].sequence < pair[1].sequence));
    }

    #[test]
    fn test_rapid_changes_to_one_document_coalesce() {
        let (bus, clock) = bus_with(Duration::from_millis(750), 16);
        bus.subscribe("ui");

        bus.publish(Notification::content_changed("plan.md", region("a", "b")));
        clock.advance(Duration::from_millis(200));
        let latest = bus.publish(Notification::content_changed("plan.md", region("b", "c")));

        let events = bus.drain("ui", 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].merged, 1);
        assert_eq!(events[0].last_sequence, latest);
        match &events[0].payload {
            EventPayload::Change { regions } => assert_eq!(regions.len(), 2),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_coalescing_stops_outside_window_or_across_documents() {
        let (bus, clock) = bus_with(Duration::from_millis(500), 16);
        bus.subscribe("ui");

        bus.publish(Notification::content_changed("plan.md", region("a", "b")));
        clock.advance(Duration::from_millis(600));
        bus.publish(Notification::content_changed("plan.md", region("b", "c")));
        bus.publish(Notification::content_changed("other.md", region("x", "y")));
        bus.publish(Notification::content_changed("plan.md", region("c", "d")));

        assert_eq!(bus.drain("ui", 10).len(), 4);
    }

    #[test]
    fn test_overflow_drops_oldest_normal_and_signals_loss() {
        let (bus, _) = bus_with(Duration::ZERO, 3);
        bus.subscribe("ui");

        let urgent = bus.publish(Notification::lock_reclaimed("a.md", "crashed", "agent-b"));
        for i in 0..4 {
            bus.publish(Notification::content_changed(&format!("{i}.md"), region("a", "b")));
        }

        let events = bus.drain("ui", 10);
        let overflow: Vec<_> = events.iter().filter(|event| event.kind == EventKind::Overflow).collect();
        assert_eq!(overflow.len(), 1);
        assert_eq!(overflow[0].payload, EventPayload::Overflow { dropped: 2 });

        assert!(events.iter().any(|event| event.sequence == urgent));
        let targets: Vec<&str> = events
            .iter()
            .filter(|event| event.kind == EventKind::ContentChanged)
            .map(|event| event.target.as_str())
            .collect();
        assert_eq!(targets, vec!["2.md", "3.md"]);
    }

    #[test]
    fn test_consumers_have_independent_queues() {
        let (bus, _) = bus_with(Duration::ZERO, 16);
        bus.subscribe("ui");
        bus.subscribe("cli");
        bus.publish(Notification::signal("agent-b", "agent-a", "hello"));

        assert_eq!(bus.drain("ui", 10).len(), 1);
        assert_eq!(bus.pending("cli"), 1);
        assert_eq!(bus.consumers(), vec!["cli".to_string(), "ui".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_and_drain_wakes_on_publish() {
        let (bus, _) = bus_with(Duration::ZERO, 16);
        let bus = Arc::new(bus);
        bus.subscribe("ui");

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.wait_and_drain("ui", 10, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(Notification::signal("agent-b", "agent-a", "ping"));

        let events = waiter.await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_and_drain_times_out_empty() {
        let (bus, _) = bus_with(Duration::ZERO, 16);
        bus.subscribe("ui");
        let events = bus.wait_and_drain("ui", 10, Duration::from_millis(100)).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_wait_and_drain_returns_at_once_for_unknown_consumer() {
        let (bus, _) = bus_with(Duration::ZERO, 16);
        let waited = bus.wait_and_drain("ghost", 10, Duration::from_secs(30));
        let events = tokio::time::timeout(Duration::from_secs(1), waited).await.unwrap();
        assert!(events.is_empty());
        assert!(bus.consumers().is_empty());
    }
}

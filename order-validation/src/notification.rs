//! Outcome tracking stage.
//!
//! Records which orders were approved and which were denied. Insertion is
//! idempotent, so redelivered checked events are harmless. An order that
//! shows up in both sets is a data-integrity conflict: it is kept in both,
//! logged, counted and reported by [`NotificationService::conflicts`].

use crate::consumer::DeliveryHandler;
use crate::error::StageError;
use crate::poison::PoisonHandler;
use order_pipeline_core::event::Event;
use order_pipeline_core::message::Delivery;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Result of feeding one event to the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tracked {
    /// First time this outcome was seen for the order.
    Recorded,
    /// The order already had this outcome.
    Duplicate,
    /// The order now has both outcomes.
    Conflict,
    /// The event carries no outcome.
    Ignored,
}

#[derive(Debug, Default)]
struct OutcomeSets {
    approved: HashSet<String>,
    denied: HashSet<String>,
    conflicts: BTreeSet<String>,
}

/// In-memory outcome sets shared by the tracking consumer and callers.
///
/// # Example
///
/// ```
/// use order_pipeline_core::event::{Event, OrderChecked, OrderSubmitted};
/// use order_pipeline_core::command::PlaceOrder;
/// use order_pipeline_core::environment::SystemClock;
/// use order_validation::notification::{NotificationService, Tracked};
///
/// let command = PlaceOrder::new("O1", "C1", "P1", 5, "X-abc");
/// let submitted = OrderSubmitted::from_command(&command, &SystemClock);
/// let approved = Event::from(OrderChecked::from_submitted(&submitted, true, &SystemClock));
///
/// let notifications = NotificationService::new();
/// assert_eq!(notifications.on_event(&approved), Tracked::Recorded);
/// assert_eq!(notifications.on_event(&approved), Tracked::Duplicate);
/// assert!(notifications.is_approved("O1"));
/// assert!(!notifications.is_denied("O1"));
/// ```
#[derive(Debug, Default)]
pub struct NotificationService {
    sets: Mutex<OutcomeSets>,
}

impl NotificationService {
    /// Empty outcome sets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OutcomeSets> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome carried by an event.
    pub fn on_event(&self, event: &Event) -> Tracked {
        let (approved, checked) = match event {
            Event::OrderApproved(checked) => (true, checked),
            Event::OrderDenied(checked) => (false, checked),
            Event::OrderSubmitted(submitted) => {
                tracing::debug!(order_id = %submitted.order_id(), "Ignoring submitted order");
                return Tracked::Ignored;
            },
        };
        let order_id = checked.order_id();
        let outcome = if approved { "approved" } else { "denied" };

        let mut sets = self.lock();
        let OutcomeSets {
            approved: approved_set,
            denied: denied_set,
            conflicts,
        } = &mut *sets;
        let (own, other) = if approved {
            (approved_set, &*denied_set)
        } else {
            (denied_set, &*approved_set)
        };

        let inserted = own.insert(order_id.to_string());
        if inserted {
            metrics::counter!("pipeline.outcomes.recorded", "outcome" => outcome).increment(1);
        }

        if other.contains(order_id) {
            if conflicts.insert(order_id.to_string()) {
                metrics::counter!("pipeline.outcomes.conflicts").increment(1);
                tracing::warn!(order_id = %order_id, outcome, "Order is both approved and denied");
            }
            return Tracked::Conflict;
        }

        if inserted {
            tracing::info!(order_id = %order_id, outcome, "Order outcome recorded");
            Tracked::Recorded
        } else {
            tracing::debug!(order_id = %order_id, outcome, "Duplicate outcome");
            Tracked::Duplicate
        }
    }

    /// Whether the order was approved.
    #[must_use]
    pub fn is_approved(&self, order_id: &str) -> bool {
        self.lock().approved.contains(order_id)
    }

    /// Whether the order was denied.
    #[must_use]
    pub fn is_denied(&self, order_id: &str) -> bool {
        self.lock().denied.contains(order_id)
    }

    /// Number of approved orders.
    #[must_use]
    pub fn approved_count(&self) -> usize {
        self.lock().approved.len()
    }

    /// Number of denied orders.
    #[must_use]
    pub fn denied_count(&self) -> usize {
        self.lock().denied.len()
    }

    /// Orders recorded as both approved and denied, sorted.
    #[must_use]
    pub fn conflicts(&self) -> Vec<String> {
        self.lock().conflicts.iter().cloned().collect()
    }
}

/// Feeds deliveries from `checked-in` into a [`NotificationService`].
#[derive(Clone, Debug)]
pub struct CheckedOrderHandler {
    notifications: Arc<NotificationService>,
    poison: PoisonHandler,
}

impl CheckedOrderHandler {
    /// Create the handler.
    #[must_use]
    pub const fn new(notifications: Arc<NotificationService>, poison: PoisonHandler) -> Self {
        Self { notifications, poison }
    }

    /// Decode, record and acknowledge one delivery.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::DeadLetter`] if a poison delivery could not be
    /// dead-lettered.
    pub async fn on_delivery(&self, delivery: Delivery) -> Result<Tracked, StageError> {
        match delivery.decode() {
            Ok(event) => {
                let tracked = self.notifications.on_event(&event);
                delivery.ack();
                Ok(tracked)
            },
            Err(e) => {
                self.poison.handle(delivery, &e).await?;
                Ok(Tracked::Ignored)
            },
        }
    }
}

impl DeliveryHandler for CheckedOrderHandler {
    fn handle(&self, delivery: Delivery) -> Pin<Box<dyn Future<Output = Result<(), StageError>> + Send + '_>> {
        Box::pin(async move { self.on_delivery(delivery).await.map(|_| ()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use order_pipeline_core::event::{EventHeader, EventId, OrderChecked, OrderSubmitted};
    use std::thread;

    fn checked(order_id: &str, available: bool) -> Event {
        Event::from(OrderChecked::new(
            EventHeader::restore(EventId::generate(), 0),
            order_id,
            "C1",
            "P1",
            1,
            available,
            0,
        ))
    }

    #[test]
    fn records_each_outcome_once() {
        let service = NotificationService::new();
        assert_eq!(service.on_event(&checked("O1", true)), Tracked::Recorded);
        assert_eq!(service.on_event(&checked("O1", true)), Tracked::Duplicate);
        assert_eq!(service.on_event(&checked("O2", false)), Tracked::Recorded);

        assert_eq!(service.approved_count(), 1);
        assert_eq!(service.denied_count(), 1);
        assert!(service.is_approved("O1"));
        assert!(service.is_denied("O2"));
        assert!(!service.is_denied("O1"));
        assert!(service.conflicts().is_empty());
    }

    #[test]
    fn submitted_events_are_ignored() {
        let service = NotificationService::new();
        let submitted = Event::from(OrderSubmitted::new(
            EventHeader::restore(EventId::generate(), 0),
            "O1",
            "C1",
            "P1",
            1,
        ));
        assert_eq!(service.on_event(&submitted), Tracked::Ignored);
        assert!(!service.is_approved("O1"));
        assert!(!service.is_denied("O1"));
    }

    #[test]
    fn contradicting_outcomes_are_reported() {
        let service = NotificationService::new();
        service.on_event(&checked("O1", true));
        assert_eq!(service.on_event(&checked("O1", false)), Tracked::Conflict);
        assert_eq!(service.on_event(&checked("O1", true)), Tracked::Conflict);

        assert!(service.is_approved("O1"));
        assert!(service.is_denied("O1"));
        assert_eq!(service.conflicts(), vec!["O1".to_string()]);
    }

    #[test]
    fn queries_are_idempotent() {
        let service = NotificationService::new();
        service.on_event(&checked("O1", true));
        for _ in 0..3 {
            assert!(service.is_approved("O1"));
            assert!(!service.is_denied("O1"));
            assert_eq!(service.approved_count(), 1);
        }
    }

    #[test]
    fn concurrent_duplicates_record_once() {
        let service = Arc::new(NotificationService::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&service);
                thread::spawn(move || service.on_event(&checked("O1", true)))
            })
            .collect();

        let recorded = handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .filter(|tracked| *tracked == Tracked::Recorded)
            .count();
        assert_eq!(recorded, 1);
        assert_eq!(service.approved_count(), 1);
    }
}

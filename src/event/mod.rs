//! Event system for async notifications.
//!
//! Every reaction of the [`Scale`](crate::Scale) is also broadcast as an
//! [`Event`], for consumers that want a stream of discrete changes rather than
//! the latest snapshot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::calibration::CalibrationParameters;
use crate::error::CalibrationError;
use crate::state::ConnectionState;

/// Event types that can be dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Connection state changed.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        /// Failure reason when `to` is `Error`.
        reason: Option<String>,
    },
    /// A sample was weighed.
    Sample { raw_ratio: f64, weight: f64 },
    /// Tare offset was set.
    Tared(CalibrationParameters),
    /// Calibration succeeded.
    Calibrated(CalibrationParameters),
    /// Calibration was rejected; parameters are unchanged.
    CalibrationRejected(CalibrationError),
}

/// Discriminant of [`Event`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`Event::StateChanged`].
    StateChanged,
    /// [`Event::Sample`].
    Sample,
    /// [`Event::Tared`].
    Tared,
    /// [`Event::Calibrated`].
    Calibrated,
    /// [`Event::CalibrationRejected`].
    CalibrationRejected,
}

impl Event {
    /// Returns the kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::Sample { .. } => EventKind::Sample,
            Self::Tared(_) => EventKind::Tared,
            Self::Calibrated(_) => EventKind::Calibrated,
            Self::CalibrationRejected(_) => EventKind::CalibrationRejected,
        }
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event.
    ///
    /// Returns `None` once the dispatcher is gone. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("subscription lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Subscription filter for specific event types.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by event kinds.
    pub kinds: Option<Vec<EventKind>>,
    /// Filter on the target state of `StateChanged`.
    pub state: Option<ConnectionState>,
}

impl EventFilter {
    /// Creates a filter for specific event kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds: Some(kinds),
            state: None,
        }
    }

    /// Creates a filter for transitions into `state`.
    #[must_use]
    pub fn entered(state: ConnectionState) -> Self {
        Self {
            kinds: Some(vec![EventKind::StateChanged]),
            state: Some(state),
        }
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }

        if let Some(expected) = self.state {
            if let Event::StateChanged { to, .. } = event {
                if *to != expected {
                    return false;
                }
            } else {
                return false;
            }
        }

        true
    }
}

struct EventDispatcherInner {
    sender: broadcast::Sender<Event>,
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<EventDispatcherInner>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventDispatcherInner { sender }),
        }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No receivers is fine
        let _ = self.inner.sender.send(event);
    }

    /// Subscribes to all events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.inner.sender.subscribe(),
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Only events dispatched after the call are considered. Returns `None`
    /// if the timeout expires or the channel is closed.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<Event> {
        let subscription = self.subscribe();
        wait_on(subscription, filter, timeout).await
    }
}

/// Waits on an existing subscription for an event matching the filter.
///
/// Subscribe before triggering the action whose event is awaited, otherwise a
/// fast event can be missed.
pub async fn wait_on(
    mut subscription: Subscription,
    filter: EventFilter,
    timeout: Duration,
) -> Option<Event> {
    tokio::select! {
        biased;
        result = async {
            loop {
                if let Some(event) = subscription.recv().await {
                    if filter.matches(&event) {
                        return Some(event);
                    }
                } else {
                    return None;
                }
            }
        } => result,
        () = tokio::time::sleep(timeout) => None,
    }
}

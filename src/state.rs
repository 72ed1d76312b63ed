//! Connection lifecycle state machine.
//!
//! The machine is pure: [`transition`] maps a state and an event to the next
//! state and the action the caller must perform. [`StateMachine`] keeps the
//! current state and the reason of the last failure.

use std::fmt;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing attempted yet.
    #[default]
    Idle,
    /// Waiting for the transport connection.
    Connecting,
    /// Transport is up, waiting for the input channel.
    ChannelOpening,
    /// Samples are being accepted.
    Streaming,
    /// The last attempt failed.
    Error,
    /// Resources were released on request.
    Closed,
}

impl ConnectionState {
    /// Returns true while a connection attempt or session is in progress.
    ///
    /// `connect()` is a no-op in these states.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::ChannelOpening | Self::Streaming)
    }

    /// Returns true if samples may be transformed in this state.
    #[must_use]
    pub const fn accepts_samples(self) -> bool {
        matches!(self, Self::Streaming)
    }

    /// Short lowercase name, used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::ChannelOpening => "channel-opening",
            Self::Streaming => "streaming",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Operator asked to connect.
    ConnectRequested,
    /// Adapter established the transport.
    TransportConnected,
    /// Adapter could not establish the transport.
    TransportFailed { reason: String },
    /// Adapter opened the input channel.
    ChannelOpened,
    /// Adapter could not open the input channel.
    ChannelFailed { reason: String },
    /// A sample arrived.
    SampleReceived,
    /// Transport dropped while streaming.
    TransportLost { reason: String },
    /// Operator asked to close.
    CloseRequested,
}

impl ConnectionEvent {
    /// Short lowercase name, used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectRequested => "connect-requested",
            Self::TransportConnected => "transport-connected",
            Self::TransportFailed { .. } => "transport-failed",
            Self::ChannelOpened => "channel-opened",
            Self::ChannelFailed { .. } => "channel-failed",
            Self::SampleReceived => "sample-received",
            Self::TransportLost { .. } => "transport-lost",
            Self::CloseRequested => "close-requested",
        }
    }
}

/// Work the owner of the machine performs after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport connection.
    OpenTransport,
    /// Open the analog-ratio input channel.
    OpenChannel,
    /// Start accepting samples.
    AcceptSamples,
    /// Forward the sample to the calibration engine.
    ForwardSample,
    /// Keep the reason for the status display.
    RecordFailure { reason: String },
    /// Release transport and channel resources.
    ReleaseResources,
}

/// Result of a valid transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State before the event.
    pub from: ConnectionState,
    /// State after the event.
    pub to: ConnectionState,
    /// Action to perform.
    pub action: Action,
}

/// Computes the transition for `event` in `state`.
///
/// Returns `None` if the event is not valid in that state.
#[must_use]
pub fn transition(state: ConnectionState, event: &ConnectionEvent) -> Option<Transition> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    let (to, action) = match (state, event) {
        (_, E::CloseRequested) => (S::Closed, Action::ReleaseResources),
        (S::Idle | S::Error | S::Closed, E::ConnectRequested) => {
            (S::Connecting, Action::OpenTransport)
        }
        (S::Connecting, E::TransportConnected) => (S::ChannelOpening, Action::OpenChannel),
        (S::Connecting, E::TransportFailed { reason })
        | (S::ChannelOpening, E::ChannelFailed { reason })
        | (S::Streaming, E::TransportLost { reason }) => (
            S::Error,
            Action::RecordFailure {
                reason: reason.clone(),
            },
        ),
        (S::ChannelOpening, E::ChannelOpened) => (S::Streaming, Action::AcceptSamples),
        (S::Streaming, E::SampleReceived) => (S::Streaming, Action::ForwardSample),
        _ => return None,
    };

    Some(Transition {
        from: state,
        to,
        action,
    })
}

/// Holds the current connection state.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConnectionState,
    failure: Option<String>,
}

impl StateMachine {
    /// Creates a machine in [`ConnectionState::Idle`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the reason of the last transition into [`ConnectionState::Error`].
    ///
    /// Cleared when a new attempt starts or the connection is closed.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Applies an event.
    ///
    /// Invalid events leave the state untouched, are logged, and return `None`.
    pub fn apply(&mut self, event: &ConnectionEvent) -> Option<Transition> {
        let Some(transition) = transition(self.state, event) else {
            tracing::warn!(
                "rejected event {} in state {}",
                event.name(),
                self.state
            );
            return None;
        };

        match &transition.action {
            Action::RecordFailure { reason } => self.failure = Some(reason.clone()),
            Action::OpenTransport | Action::ReleaseResources => self.failure = None,
            Action::OpenChannel | Action::AcceptSamples | Action::ForwardSample => {}
        }

        if transition.from != transition.to {
            tracing::debug!(
                "connection state {} -> {} on {}",
                transition.from,
                transition.to,
                event.name()
            );
        }
        self.state = transition.to;
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(reason: &str) -> ConnectionEvent {
        ConnectionEvent::TransportFailed {
            reason: reason.into(),
        }
    }

    #[test]
    fn test_happy_path_order() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.state(), ConnectionState::Idle);

        let steps = [
            (ConnectionEvent::ConnectRequested, ConnectionState::Connecting),
            (
                ConnectionEvent::TransportConnected,
                ConnectionState::ChannelOpening,
            ),
            (ConnectionEvent::ChannelOpened, ConnectionState::Streaming),
            (ConnectionEvent::SampleReceived, ConnectionState::Streaming),
        ];
        for (event, expected) in steps {
            let t = machine.apply(&event).unwrap();
            assert_eq!(t.to, expected);
            assert_eq!(machine.state(), expected);
        }
    }

    #[test]
    fn test_cannot_skip_to_streaming() {
        let mut machine = StateMachine::new();
        assert!(machine.apply(&ConnectionEvent::ChannelOpened).is_none());
        assert!(machine.apply(&ConnectionEvent::TransportConnected).is_none());
        assert!(machine.apply(&ConnectionEvent::SampleReceived).is_none());
        assert_eq!(machine.state(), ConnectionState::Idle);

        machine.apply(&ConnectionEvent::ConnectRequested).unwrap();
        assert!(machine.apply(&ConnectionEvent::ChannelOpened).is_none());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_failures_record_reason() {
        let mut machine = StateMachine::new();
        machine.apply(&ConnectionEvent::ConnectRequested).unwrap();
        let t = machine.apply(&failed("no device")).unwrap();

        assert_eq!(t.to, ConnectionState::Error);
        assert_eq!(
            t.action,
            Action::RecordFailure {
                reason: "no device".into()
            }
        );
        assert_eq!(machine.failure(), Some("no device"));

        // Retry clears the old reason.
        machine.apply(&ConnectionEvent::ConnectRequested).unwrap();
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.failure(), None);
    }

    #[test]
    fn test_channel_failure_and_loss() {
        let mut machine = StateMachine::new();
        machine.apply(&ConnectionEvent::ConnectRequested).unwrap();
        machine.apply(&ConnectionEvent::TransportConnected).unwrap();
        machine
            .apply(&ConnectionEvent::ChannelFailed {
                reason: "timeout".into(),
            })
            .unwrap();
        assert_eq!(machine.state(), ConnectionState::Error);

        machine.apply(&ConnectionEvent::ConnectRequested).unwrap();
        machine.apply(&ConnectionEvent::TransportConnected).unwrap();
        machine.apply(&ConnectionEvent::ChannelOpened).unwrap();
        machine
            .apply(&ConnectionEvent::TransportLost {
                reason: "unplugged".into(),
            })
            .unwrap();
        assert_eq!(machine.state(), ConnectionState::Error);
        assert_eq!(machine.failure(), Some("unplugged"));
    }

    #[test]
    fn test_close_from_every_state() {
        let all = [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::ChannelOpening,
            ConnectionState::Streaming,
            ConnectionState::Error,
            ConnectionState::Closed,
        ];
        for state in all {
            let t = transition(state, &ConnectionEvent::CloseRequested).unwrap();
            assert_eq!(t.to, ConnectionState::Closed);
            assert_eq!(t.action, Action::ReleaseResources);
        }
    }

    #[test]
    fn test_connect_rejected_while_active() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::ChannelOpening,
            ConnectionState::Streaming,
        ] {
            assert!(state.is_active());
            assert!(transition(state, &ConnectionEvent::ConnectRequested).is_none());
        }
        assert!(!ConnectionState::Error.is_active());
        assert!(transition(ConnectionState::Closed, &ConnectionEvent::ConnectRequested).is_some());
    }

    #[test]
    fn test_samples_only_while_streaming() {
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::ChannelOpening,
            ConnectionState::Error,
            ConnectionState::Closed,
        ] {
            assert!(!state.accepts_samples());
            assert!(transition(state, &ConnectionEvent::SampleReceived).is_none());
        }
        assert!(ConnectionState::Streaming.accepts_samples());
    }

    #[test]
    fn test_loss_outside_streaming_is_rejected() {
        let lost = ConnectionEvent::TransportLost {
            reason: "gone".into(),
        };
        assert!(transition(ConnectionState::Idle, &lost).is_none());
        assert!(transition(ConnectionState::Closed, &lost).is_none());
    }
}

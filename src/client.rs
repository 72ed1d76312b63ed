//! Main [`Scale`] client implementation.
//!
//! This module provides the high-level [`Scale`] client that combines the
//! device channel, the connection state machine, the calibration engine and
//! the publisher into a unified interface.
//!
//! Every reaction runs under a single core lock: operator commands and
//! samples are applied one at a time, samples in arrival order. The lock is
//! never held while awaiting the adapter.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::calibration::{CalibrationEngine, CalibrationParameters, DEFAULT_KNOWN_MASS};
use crate::error::{CalibrationError, Error};
use crate::event::{Event, EventDispatcher, Subscription};
use crate::publisher::{PublishedState, Publisher, StatusCode, status_message};
use crate::state::{Action, ConnectionEvent, ConnectionState, StateMachine};
use crate::transport::{BridgeChannel, BridgeConfig, ChannelEvent, DeviceChannel, TransportKind};

/// Default time the adapter may take to open the input channel.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default event broadcast capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for a [`Scale`].
#[derive(Debug, Clone, Copy)]
pub struct ScaleConfig {
    /// Timeout passed to [`DeviceChannel::open_channel`].
    pub open_timeout: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Initial reference mass offered to the operator.
    pub known_mass: f64,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ScaleConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            known_mass: DEFAULT_KNOWN_MASS,
        }
    }

    /// Sets the channel open timeout.
    #[must_use]
    pub const fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Sets the event capacity.
    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets the initial reference mass.
    #[must_use]
    pub const fn known_mass(mut self, mass: f64) -> Self {
        self.known_mass = mass;
        self
    }
}

/// State shared between operator commands and the sample pump.
struct Core {
    machine: StateMachine,
    engine: CalibrationEngine,
    publisher: Publisher,
    dispatcher: EventDispatcher,
    kind: Option<TransportKind>,
    // Bumped by every connect and close; stale work checks it and bails.
    session: u64,
    pump: Option<JoinHandle<()>>,
}

impl Core {
    /// Applies a connection event, then publishes and broadcasts the change.
    fn apply(&mut self, event: &ConnectionEvent) -> bool {
        let Some(transition) = self.machine.apply(event) else {
            return false;
        };
        if transition.action == Action::ForwardSample {
            return true;
        }

        let state = transition.to;
        let failure = self.machine.failure().map(ToOwned::to_owned);
        if let Some(reason) = &failure {
            tracing::warn!("connection failed: {}", reason);
        }
        self.publisher.publish_status(
            StatusCode::from(state),
            status_message(state, self.kind.as_ref(), failure.as_deref()),
        );
        self.dispatcher.dispatch(Event::StateChanged {
            from: transition.from,
            to: state,
            reason: failure,
        });
        true
    }

    fn on_sample(&mut self, raw_ratio: f64) {
        if !self.machine.state().accepts_samples() {
            tracing::trace!("dropping sample in state {}", self.machine.state());
            return;
        }
        self.apply(&ConnectionEvent::SampleReceived);

        let params = *self.engine.parameters();
        self.publisher.publish_sample(raw_ratio, &params);
        let weight = params.weight(raw_ratio);
        tracing::trace!("sample {} -> {}", raw_ratio, weight);
        self.dispatcher.dispatch(Event::Sample { raw_ratio, weight });
    }

    /// Returns true if `session` is still the current, unclosed session.
    fn is_current(&self, session: u64) -> bool {
        self.session == session
    }
}

/// Client for a load-cell scale.
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`.
pub struct Scale<C> {
    adapter: Arc<Mutex<Option<C>>>,
    core: Arc<Mutex<Core>>,
    published: watch::Receiver<PublishedState>,
    dispatcher: EventDispatcher,
    // Bumped when a close starts; in-flight connects select on it.
    cancel: watch::Sender<u64>,
    // Highest cancel generation whose close has finished.
    closed: watch::Sender<u64>,
    closing: AtomicUsize,
    config: ScaleConfig,
}

/// Marks a `close()` in flight. Dropping it wakes cancelled connects.
struct CloseGuard<'a> {
    closing: &'a AtomicUsize,
    closed: &'a watch::Sender<u64>,
    generation: u64,
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        self.closing.fetch_sub(1, Ordering::SeqCst);
        let generation = self.generation;
        self.closed.send_modify(|done| *done = (*done).max(generation));
    }
}

impl Scale<BridgeChannel> {
    /// Creates a new client for a sensor bridge.
    ///
    /// # Returns
    ///
    /// A new client (not yet connected).
    #[must_use]
    pub fn bridge(kind: TransportKind) -> Self {
        Self::with_bridge_config(BridgeConfig::new(kind))
    }

    /// Creates a new client with custom bridge configuration.
    #[must_use]
    pub fn with_bridge_config(config: BridgeConfig) -> Self {
        Self::new(BridgeChannel::new(config))
    }
}

impl<C: DeviceChannel + 'static> Scale<C> {
    /// Creates a new client with the given adapter and default settings.
    #[must_use]
    pub fn new(adapter: C) -> Self {
        Self::with_config(adapter, ScaleConfig::default())
    }

    /// Creates a new client with the given adapter and configuration.
    #[must_use]
    pub fn with_config(adapter: C, config: ScaleConfig) -> Self {
        let kind = adapter.kind().clone();
        Self::build(Some(adapter), Some(kind), config)
    }

    /// Creates a client whose adapter is not available yet.
    ///
    /// `connect()` ends in [`ConnectionState::Error`] until
    /// [`attach`](Self::attach) is called.
    #[must_use]
    pub fn unattached(config: ScaleConfig) -> Self {
        Self::build(None, None, config)
    }

    fn build(adapter: Option<C>, kind: Option<TransportKind>, config: ScaleConfig) -> Self {
        let engine = CalibrationEngine::new();
        let publisher = Publisher::new(*engine.parameters(), config.known_mass);
        let published = publisher.subscribe();
        let dispatcher = EventDispatcher::new(config.event_capacity);
        let (cancel, _) = watch::channel(0);
        let (closed, _) = watch::channel(0);

        let core = Core {
            machine: StateMachine::new(),
            engine,
            publisher,
            dispatcher: dispatcher.clone(),
            kind,
            session: 0,
            pump: None,
        };

        Self {
            adapter: Arc::new(Mutex::new(adapter)),
            core: Arc::new(Mutex::new(core)),
            published,
            dispatcher,
            cancel,
            closed,
            closing: AtomicUsize::new(0),
            config,
        }
    }

    /// Attaches the adapter once the device capability becomes available.
    ///
    /// Replaces any previous adapter. Takes effect on the next `connect()`.
    pub async fn attach(&self, adapter: C) {
        let kind = adapter.kind().clone();
        tracing::info!("device adapter attached ({})", kind);
        *self.adapter.lock().await = Some(adapter);
        self.core.lock().await.kind = Some(kind);
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ScaleConfig {
        &self.config
    }

    // ==================== Connection ====================

    /// Connects and starts streaming.
    ///
    /// This will:
    /// 1. Open the transport connection
    /// 2. Open the analog-ratio input channel
    /// 3. Start the sample pump
    ///
    /// Failures never surface as errors here: they drive the state to
    /// [`ConnectionState::Error`] with a reason visible in the published
    /// status. A call while connecting, streaming or closing is a no-op.
    ///
    /// Returns the state reached. A connect cancelled by
    /// [`close`](Self::close) returns once that close has finished.
    pub async fn connect(&self) -> ConnectionState {
        let (session, mut cancel) = {
            let mut core = self.core.lock().await;
            let state = core.machine.state();
            if state.is_active() {
                tracing::debug!("connect ignored, already {}", state);
                return state;
            }
            if self.closing.load(Ordering::SeqCst) > 0 {
                tracing::debug!("connect ignored, close in progress");
                return state;
            }

            let cancel = self.cancel.subscribe();
            core.session += 1;
            core.apply(&ConnectionEvent::ConnectRequested);
            (core.session, cancel)
        };

        tracing::info!("connecting");
        let cancelled = tokio::select! {
            biased;
            _ = cancel.changed() => true,
            () = self.run_connect(session) => false,
        };

        if cancelled {
            // Only close() cancels; it finishes releasing the adapter.
            tracing::debug!("connect cancelled by close");
            let generation = *cancel.borrow_and_update();
            let mut closed = self.closed.subscribe();
            let _ = closed.wait_for(|done| *done >= generation).await;
        }
        self.state().await
    }

    async fn run_connect(&self, session: u64) {
        let mut adapter = self.adapter.lock().await;
        let Some(device) = adapter.as_mut() else {
            let reason = Error::TransportUnavailable {
                reason: "device library not loaded".into(),
            }
            .to_string();
            self.advance(session, ConnectionEvent::TransportFailed { reason })
                .await;
            return;
        };

        // A retry starts from scratch.
        if device.is_connected() {
            if let Err(e) = device.close().await {
                tracing::warn!("failed to release previous connection: {}", e);
            }
        }

        if let Err(e) = device.connect().await {
            let reason = e.to_string();
            self.advance(session, ConnectionEvent::TransportFailed { reason })
                .await;
            return;
        }
        if !self
            .advance(session, ConnectionEvent::TransportConnected)
            .await
        {
            release(device).await;
            return;
        }

        let rx = match device.open_channel(self.config.open_timeout).await {
            Ok(rx) => rx,
            Err(e) => {
                let reason = e.to_string();
                // Kept connected in Error; the next connect releases it.
                if !self
                    .advance(session, ConnectionEvent::ChannelFailed { reason })
                    .await
                {
                    release(device).await;
                }
                return;
            }
        };

        {
            let mut core = self.core.lock().await;
            if core.is_current(session) && core.apply(&ConnectionEvent::ChannelOpened) {
                let pump = tokio::spawn(pump_samples(rx, Arc::clone(&self.core), session));
                if let Some(old) = core.pump.replace(pump) {
                    old.abort();
                }
                tracing::info!("streaming");
                return;
            }
        }

        drop(rx);
        release(device).await;
    }

    /// Applies `event` if `session` is still current.
    async fn advance(&self, session: u64, event: ConnectionEvent) -> bool {
        let mut core = self.core.lock().await;
        if !core.is_current(session) {
            tracing::debug!("stale {} ignored", event.name());
            return false;
        }
        core.apply(&event)
    }

    /// Closes the connection.
    ///
    /// Accepted in every state, including while a connect is in flight. The
    /// sample pump is stopped and the adapter released before the state
    /// becomes [`ConnectionState::Closed`]; no sample is processed afterwards.
    pub async fn close(&self) -> ConnectionState {
        tracing::info!("closing");
        let (pump, guard) = {
            let mut core = self.core.lock().await;
            core.session += 1;
            self.closing.fetch_add(1, Ordering::SeqCst);
            self.cancel.send_modify(|generation| *generation += 1);
            let guard = CloseGuard {
                closing: &self.closing,
                closed: &self.closed,
                generation: *self.cancel.borrow(),
            };
            (core.pump.take(), guard)
        };

        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }

        {
            let mut adapter = self.adapter.lock().await;
            if let Some(device) = adapter.as_mut() {
                if let Err(e) = device.close().await {
                    tracing::warn!("failed to release device: {}", e);
                }
            }
        }

        let mut core = self.core.lock().await;
        core.apply(&ConnectionEvent::CloseRequested);
        drop(guard);
        core.machine.state()
    }

    /// Returns the current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.core.lock().await.machine.state()
    }

    // ==================== Calibration ====================

    /// Zeroes the scale at the latest published raw ratio.
    ///
    /// Always succeeds. Before any sample the offset becomes 0.
    pub async fn tare(&self) -> CalibrationParameters {
        let mut core = self.core.lock().await;
        let raw = core.publisher.raw_ratio();
        let params = core.engine.tare(raw);
        core.publisher.publish_calibration(&params);
        core.dispatcher.dispatch(Event::Tared(params));
        tracing::info!("tared at {}", raw);
        params
    }

    /// Calibrates with `known_mass` on the scale, using the latest published
    /// raw ratio.
    ///
    /// Also records `known_mass` as the operator input. On error the
    /// parameters are unchanged and the rejection is published.
    pub async fn calibrate(
        &self,
        known_mass: f64,
    ) -> Result<CalibrationParameters, CalibrationError> {
        let mut core = self.core.lock().await;
        core.publisher.publish_known_mass(known_mass);
        Self::calibrate_locked(&mut core, known_mass)
    }

    /// Calibrates with the reference mass last set by
    /// [`set_known_mass`](Self::set_known_mass).
    pub async fn calibrate_with_input(&self) -> Result<CalibrationParameters, CalibrationError> {
        let mut core = self.core.lock().await;
        let known_mass = core.publisher.known_mass();
        Self::calibrate_locked(&mut core, known_mass)
    }

    fn calibrate_locked(
        core: &mut Core,
        known_mass: f64,
    ) -> Result<CalibrationParameters, CalibrationError> {
        let raw = core.publisher.raw_ratio();
        match core.engine.calibrate(raw, known_mass) {
            Ok(params) => {
                core.publisher.publish_calibration(&params);
                core.dispatcher.dispatch(Event::Calibrated(params));
                tracing::info!(
                    "calibrated with {} at {}: factor {}",
                    known_mass,
                    raw,
                    params.calibration_factor
                );
                Ok(params)
            }
            Err(e) => {
                tracing::warn!("calibration rejected: {}", e);
                core.publisher.publish_rejection(e);
                core.dispatcher.dispatch(Event::CalibrationRejected(e));
                Err(e)
            }
        }
    }

    /// Sets the operator's reference mass. Validated on calibration.
    pub async fn set_known_mass(&self, known_mass: f64) {
        self.core.lock().await.publisher.publish_known_mass(known_mass);
    }

    /// Returns the current calibration parameters.
    pub async fn parameters(&self) -> CalibrationParameters {
        *self.core.lock().await.engine.parameters()
    }

    // ==================== Observation ====================

    /// Returns a receiver for published snapshots.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<PublishedState> {
        self.published.clone()
    }

    /// Returns a copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> PublishedState {
        self.published.borrow().clone()
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.dispatcher.subscribe()
    }

    /// Returns the event dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }
}

/// Releases a transport that a stale or rejected connect left open.
async fn release<C: DeviceChannel>(device: &mut C) {
    tracing::debug!("releasing transport of abandoned connect");
    if let Err(e) = device.close().await {
        tracing::warn!("failed to release device: {}", e);
    }
}

/// Feeds samples from one session into the core, in order.
async fn pump_samples(
    mut rx: mpsc::Receiver<ChannelEvent>,
    shared: Arc<Mutex<Core>>,
    session: u64,
) {
    while let Some(event) = rx.recv().await {
        let mut core = shared.lock().await;
        if !core.is_current(session) {
            return;
        }
        match event {
            ChannelEvent::Sample(sample) => core.on_sample(sample.ratio),
            ChannelEvent::Lost { reason } => {
                core.apply(&ConnectionEvent::TransportLost { reason });
                core.pump = None;
                return;
            }
        }
    }

    let mut core = shared.lock().await;
    if core.is_current(session) {
        core.apply(&ConnectionEvent::TransportLost {
            reason: "sample stream ended".into(),
        });
        core.pump = None;
    }
}

impl<C> Drop for Scale<C> {
    fn drop(&mut self) {
        // Abort the pump
        if let Ok(mut core) = self.core.try_lock() {
            if let Some(pump) = core.pump.take() {
                pump.abort();
            }
        }
    }
}

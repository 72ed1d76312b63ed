//! Scriptable in-memory device channel.
//!
//! [`MockChannel`] stands in for real hardware; its [`MockHandle`] scripts
//! failures, holds adapter calls suspended, injects samples and counts calls.
//!
//! ```
//! use loadcell::transport::{MockChannel, TransportKind};
//!
//! let (channel, handle) = MockChannel::new(TransportKind::usb());
//! handle.fail_connect("device busy");
//! # drop(channel);
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc};

use crate::error::{Error, Result};
use crate::transport::{
    ChannelEvent, DeviceChannel, RawSample, SAMPLE_CHANNEL_CAPACITY, TransportKind,
};

#[derive(Debug, Default)]
struct Script {
    connect_calls: usize,
    open_calls: usize,
    close_calls: usize,
    connect_error: Option<String>,
    open_error: Option<String>,
    hold_connect: bool,
    hold_open: bool,
    hold_close: bool,
    connected: bool,
    sender: Option<mpsc::Sender<ChannelEvent>>,
}

#[derive(Debug, Default)]
struct Shared {
    script: Mutex<Script>,
    release_connect: Notify,
    release_open: Notify,
    release_close: Notify,
}

impl Shared {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory [`DeviceChannel`].
#[derive(Debug)]
pub struct MockChannel {
    kind: TransportKind,
    shared: Arc<Shared>,
}

/// Controls a [`MockChannel`] from the outside.
#[derive(Debug, Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

impl MockChannel {
    /// Creates a channel and its control handle.
    #[must_use]
    pub fn new(kind: TransportKind) -> (Self, MockHandle) {
        let shared = Arc::new(Shared::default());
        let channel = Self {
            kind,
            shared: Arc::clone(&shared),
        };
        (channel, MockHandle { shared })
    }
}

impl DeviceChannel for MockChannel {
    fn kind(&self) -> &TransportKind {
        &self.kind
    }

    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let hold = {
                let mut script = self.shared.script();
                script.connect_calls += 1;
                script.hold_connect
            };
            if hold {
                self.shared.release_connect.notified().await;
            }

            let mut script = self.shared.script();
            if let Some(message) = script.connect_error.clone() {
                return Err(Error::TransportFailure { message });
            }
            script.connected = true;
            Ok(())
        })
    }

    fn open_channel(
        &mut self,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<ChannelEvent>>> {
        Box::pin(async move {
            let hold = {
                let mut script = self.shared.script();
                if !script.connected {
                    return Err(Error::NotConnected);
                }
                script.open_calls += 1;
                script.hold_open
            };
            if hold {
                self.shared.release_open.notified().await;
            }

            let mut script = self.shared.script();
            if let Some(message) = script.open_error.clone() {
                return Err(Error::ChannelFailure { message });
            }

            let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
            script.sender = Some(tx);
            Ok(rx)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let hold = {
                let mut script = self.shared.script();
                script.close_calls += 1;
                script.hold_close
            };
            if hold {
                self.shared.release_close.notified().await;
            }

            let mut script = self.shared.script();
            script.sender = None;
            script.connected = false;
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.script().connected
    }
}

impl MockHandle {
    /// Makes every following `connect()` fail with `message`.
    pub fn fail_connect(&self, message: impl Into<String>) {
        self.shared.script().connect_error = Some(message.into());
    }

    /// Makes every following `open_channel()` fail with `message`.
    pub fn fail_open(&self, message: impl Into<String>) {
        self.shared.script().open_error = Some(message.into());
    }

    /// Clears scripted failures.
    pub fn succeed(&self) {
        let mut script = self.shared.script();
        script.connect_error = None;
        script.open_error = None;
    }

    /// When set, `connect()` suspends until [`release_connect`](Self::release_connect).
    pub fn hold_connect(&self, hold: bool) {
        self.shared.script().hold_connect = hold;
    }

    /// Lets one held `connect()` proceed.
    pub fn release_connect(&self) {
        self.shared.release_connect.notify_one();
    }

    /// When set, `open_channel()` suspends until [`release_open`](Self::release_open).
    pub fn hold_open(&self, hold: bool) {
        self.shared.script().hold_open = hold;
    }

    /// Lets one held `open_channel()` proceed.
    pub fn release_open(&self) {
        self.shared.release_open.notify_one();
    }

    /// When set, `close()` suspends until [`release_close`](Self::release_close).
    pub fn hold_close(&self, hold: bool) {
        self.shared.script().hold_close = hold;
    }

    /// Lets one held `close()` proceed.
    pub fn release_close(&self) {
        self.shared.release_close.notify_one();
    }

    /// Returns true while the transport is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.script().connected
    }

    /// Number of `connect()` calls so far.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.shared.script().connect_calls
    }

    /// Number of `open_channel()` calls so far.
    #[must_use]
    pub fn open_calls(&self) -> usize {
        self.shared.script().open_calls
    }

    /// Number of `close()` calls so far.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.shared.script().close_calls
    }

    /// Returns true while a channel is open.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.shared.script().sender.is_some()
    }

    /// Delivers a sample. Returns false if no channel is open or the
    /// receiver is gone.
    pub async fn push_sample(&self, ratio: f64) -> bool {
        self.deliver(ChannelEvent::Sample(RawSample::now(ratio)))
            .await
    }

    /// Reports a transport loss and ends the sample stream.
    pub async fn lose(&self, reason: impl Into<String>) -> bool {
        let delivered = self
            .deliver(ChannelEvent::Lost {
                reason: reason.into(),
            })
            .await;
        self.shared.script().sender = None;
        delivered
    }

    async fn deliver(&self, event: ChannelEvent) -> bool {
        let sender = self.shared.script().sender.clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

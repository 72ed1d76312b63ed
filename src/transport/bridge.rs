//! Sensor bridge transport.
//!
//! Talks the line protocol in [`crate::protocol`] to a bridge that exposes the
//! load-cell input either on a USB serial port or on a TCP socket.

use std::io;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;

use crate::error::{Error, Result};
use crate::protocol::{DeviceMessage, HostCommand, LineDecoder};
use crate::transport::{
    ChannelEvent, DeviceChannel, RawSample, SAMPLE_CHANNEL_CAPACITY, TransportKind,
};

/// Default baud rate for USB bridges.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default delay after opening the port before talking to the bridge.
pub const DEFAULT_CONNECTION_DELAY: Duration = Duration::from_millis(300);

/// Default input channel on the bridge.
pub const DEFAULT_CHANNEL: u8 = 0;

/// Read buffer size.
const READ_BUF_SIZE: usize = 1024;

/// Configuration for the bridge transport.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Where the bridge is.
    pub kind: TransportKind,
    /// Baud rate (USB only).
    pub baud_rate: u32,
    /// Delay after the transport opens.
    pub connection_delay: Duration,
    /// Input channel index on the bridge.
    pub channel: u8,
}

impl BridgeConfig {
    /// Creates a new bridge configuration with default settings.
    #[must_use]
    pub const fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            baud_rate: DEFAULT_BAUD_RATE,
            connection_delay: DEFAULT_CONNECTION_DELAY,
            channel: DEFAULT_CHANNEL,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the connection delay.
    #[must_use]
    pub const fn connection_delay(mut self, delay: Duration) -> Self {
        self.connection_delay = delay;
        self
    }

    /// Sets the input channel index.
    #[must_use]
    pub const fn channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }
}

/// Byte stream to the bridge, serial or TCP.
trait BridgeStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BridgeStream for T {}

type Reader = ReadHalf<Box<dyn BridgeStream>>;
type Writer = WriteHalf<Box<dyn BridgeStream>>;

/// Bridge transport for load-cell sensors.
///
/// Uses split read/write halves; after the channel opens, the read half moves
/// into a background task that forwards samples.
pub struct BridgeChannel {
    config: BridgeConfig,
    writer: Option<Writer>,
    reader: Option<Reader>,
    decoder: LineDecoder,
    read_task: Option<JoinHandle<()>>,
}

impl BridgeChannel {
    /// Creates a new bridge transport with the given configuration.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            writer: None,
            reader: None,
            decoder: LineDecoder::new(),
            read_task: None,
        }
    }

    /// Creates a new bridge transport with default settings.
    #[must_use]
    pub fn with_kind(kind: TransportKind) -> Self {
        Self::new(BridgeConfig::new(kind))
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    async fn open_stream(config: &BridgeConfig) -> Result<Box<dyn BridgeStream>> {
        match &config.kind {
            TransportKind::Usb { port } => {
                let port = match port {
                    Some(port) => port.clone(),
                    None => list_ports()?.into_iter().next().ok_or_else(|| {
                        Error::TransportUnavailable {
                            reason: "no serial ports found".into(),
                        }
                    })?,
                };
                tracing::info!("opening serial port: {}", port);
                let stream = tokio_serial::new(&port, config.baud_rate)
                    .open_native_async()
                    .map_err(Error::Serial)?;
                Ok(Box::new(stream))
            }
            TransportKind::Network { host, port } => {
                tracing::info!("connecting to bridge at {}:{}", host, port);
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    async fn send(&mut self, command: HostCommand) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;
        let line = command.encode();
        tracing::trace!("sending {:?}", command);
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads lines until the bridge acknowledges the open command.
    async fn await_open_ack(reader: &mut Reader, decoder: &mut LineDecoder) -> Result<()> {
        let mut buf = [0u8; READ_BUF_SIZE];

        loop {
            loop {
                match decoder.decode() {
                    Ok(Some(line)) => match DeviceMessage::parse(&line) {
                        Ok(DeviceMessage::Ok) => return Ok(()),
                        Ok(DeviceMessage::Err { message }) => {
                            return Err(Error::ChannelFailure { message });
                        }
                        Ok(DeviceMessage::Ratio(_)) => {
                            tracing::trace!("ignoring sample before open acknowledgment");
                        }
                        Err(e) => tracing::warn!("bad line from bridge: {}", e),
                    },
                    Ok(None) => break, // Need more data
                    Err(e) => tracing::warn!("line decode error: {}", e),
                }
            }

            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::ChannelFailure {
                    message: "bridge closed the connection while opening the channel".into(),
                });
            }
            decoder.feed(&buf[..n]);
        }
    }

    /// Forwards samples from the bridge until the stream ends.
    ///
    /// Exactly one `Lost` event is sent when the stream fails, unless the
    /// receiver has gone away.
    async fn run_read_loop(
        mut reader: Reader,
        mut decoder: LineDecoder,
        tx: mpsc::Sender<ChannelEvent>,
    ) {
        let mut buf = [0u8; READ_BUF_SIZE];

        let reason = 'read: loop {
            // Lines buffered during the handshake come first.
            loop {
                match decoder.decode() {
                    Ok(Some(line)) => match DeviceMessage::parse(&line) {
                        Ok(DeviceMessage::Ratio(ratio)) => {
                            tracing::trace!("sample {}", ratio);
                            if tx
                                .send(ChannelEvent::Sample(RawSample::now(ratio)))
                                .await
                                .is_err()
                            {
                                tracing::debug!("sample receiver dropped");
                                return;
                            }
                        }
                        Ok(DeviceMessage::Err { message }) => break 'read message,
                        Ok(DeviceMessage::Ok) => tracing::trace!("stray acknowledgment"),
                        Err(e) => tracing::warn!("bad line from bridge: {}", e),
                    },
                    Ok(None) => break, // Need more data
                    Err(e) => tracing::warn!("line decode error: {}", e),
                }
            }

            match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("bridge closed the connection");
                    break Error::Io(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "bridge closed the connection",
                    ))
                    .to_string();
                }
                Ok(n) => {
                    tracing::trace!("received {} bytes", n);
                    decoder.feed(&buf[..n]);
                }
                Err(e) => {
                    tracing::error!("bridge read error: {}", e);
                    break Error::Io(e).to_string();
                }
            }
        };

        let _ = tx.send(ChannelEvent::Lost { reason }).await;
    }
}

impl DeviceChannel for BridgeChannel {
    fn kind(&self) -> &TransportKind {
        &self.config.kind
    }

    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }

            let stream = Self::open_stream(&self.config).await?;

            // Wait for the bridge to settle
            tokio::time::sleep(self.config.connection_delay).await;

            let (reader, writer) = tokio::io::split(stream);
            self.reader = Some(reader);
            self.writer = Some(writer);
            self.decoder.clear();

            tracing::info!("connected to bridge ({})", self.config.kind);
            Ok(())
        })
    }

    fn open_channel(
        &mut self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<ChannelEvent>>> {
        Box::pin(async move {
            let channel = self.config.channel;
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            self.send(HostCommand::Open {
                channel,
                timeout_ms,
            })
            .await?;

            let mut reader = self.reader.take().ok_or(Error::NotConnected)?;
            let mut decoder = std::mem::take(&mut self.decoder);

            tokio::time::timeout(timeout, Self::await_open_ack(&mut reader, &mut decoder))
                .await
                .map_err(|_| Error::Timeout { timeout_ms })??;

            tracing::info!("channel {} open", channel);

            let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
            self.read_task = Some(tokio::spawn(Self::run_read_loop(reader, decoder, tx)));
            Ok(rx)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(task) = self.read_task.take() {
                task.abort();
            }

            if self.writer.is_some() {
                tracing::info!("closing bridge connection");
                if let Err(e) = self.send(HostCommand::Close).await {
                    tracing::warn!("failed to send close: {}", e);
                }
                if let Some(mut writer) = self.writer.take() {
                    if let Err(e) = writer.shutdown().await {
                        tracing::debug!("shutdown failed: {}", e);
                    }
                }
            }
            self.reader = None;
            self.decoder.clear();
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}

impl Drop for BridgeChannel {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

use crate::config::{AmsConfig, TransportConfig};
use crate::error::{AmsError, Result};
use crate::protocol::{self, Expect, Request};
use crate::types::{InputId, Level, OutputId, StepDirection, StepSize, ZoneId};
use crate::volume::{VolumeCurve, VOLUME_STEPS};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

const FRAME_TERMINATOR: u8 = 0x00;

/// Open socket halves
struct Stream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Low-level TCP transport to one switch
///
/// Holds at most one socket. The socket mutex doubles as the single-flight
/// guard: one command/response exchange at a time. The socket is opened
/// lazily by the first command and reopened after any reset.
pub struct Connection {
    host: String,
    port: u16,
    input_count: u8,
    config: TransportConfig,
    curve: VolumeCurve,
    stream: Mutex<Option<Stream>>,
    /// Set by `close_now` while an exchange holds the guard
    reset_requested: AtomicBool,
}

impl Connection {
    /// Transport with default timings and the measured volume curve
    pub fn new(host: impl Into<String>, port: u16, input_count: u8) -> Self {
        Self::with_config(
            host,
            port,
            input_count,
            TransportConfig::default(),
            VolumeCurve::default(),
        )
    }

    pub fn with_config(
        host: impl Into<String>,
        port: u16,
        input_count: u8,
        config: TransportConfig,
        curve: VolumeCurve,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            input_count,
            config,
            curve,
            stream: Mutex::new(None),
            reset_requested: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &AmsConfig) -> Self {
        Self::with_config(
            config.host.clone(),
            config.port,
            config.input_count,
            config.transport.clone(),
            config.volume_curve.clone(),
        )
    }

    /// Get the device host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the device port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of inputs; routing to this (0-based) index disconnects an output
    pub fn input_count(&self) -> u8 {
        self.input_count
    }

    /// Whether a socket is open
    ///
    /// Reports `true` while an exchange is in flight.
    pub fn is_connected(&self) -> bool {
        match self.stream.try_lock() {
            Ok(slot) => slot.is_some() && !self.reset_requested.load(Ordering::SeqCst),
            Err(_) => true,
        }
    }

    /// Open the socket if it is not already open
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.stream.lock().await;
        self.apply_reset(&mut slot);
        self.open(&mut slot).await
    }

    /// Flush and close the socket, if any
    pub async fn disconnect(&self) -> Result<()> {
        let mut slot = self.stream.lock().await;
        self.reset_requested.store(false, Ordering::SeqCst);
        if let Some(mut stream) = slot.take() {
            let closed = stream.writer.shutdown().await;
            tracing::info!("Disconnected from Triad AMS at {}:{}", self.host, self.port);
            closed?;
        }
        Ok(())
    }

    /// Drop the socket without waiting; never fails
    ///
    /// If an exchange currently holds the socket, the drop happens as soon as
    /// the next exchange starts.
    pub fn close_now(&self) {
        match self.stream.try_lock() {
            Ok(mut slot) => {
                self.reset_requested.store(false, Ordering::SeqCst);
                if slot.take().is_some() {
                    tracing::debug!("close_now(): dropped connection");
                }
            }
            Err(_) => {
                self.reset_requested.store(true, Ordering::SeqCst);
                tracing::trace!("close_now(): exchange in flight; reset deferred");
            }
        }
    }

    fn apply_reset(&self, slot: &mut Option<Stream>) {
        if self.reset_requested.swap(false, Ordering::SeqCst) {
            *slot = None;
        }
    }

    async fn open(&self, slot: &mut Option<Stream>) -> Result<()> {
        if slot.is_some() {
            tracing::trace!("connect(): already connected; skipping");
            return Ok(());
        }

        let address = format!("{}:{}", self.host, self.port);
        tracing::trace!("connect(): begin to {}", address);
        let socket = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|source| AmsError::Connection {
                address: address.clone(),
                source,
            })?;
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Could not disable Nagle on {}: {}", address, e);
        }
        tracing::info!("Connected to Triad AMS at {}", address);

        // The device ignores commands that arrive right after connect
        sleep(self.config.connect_settle()).await;

        let (reader, writer) = socket.into_split();
        *slot = Some(Stream {
            reader: BufReader::new(reader),
            writer,
        });
        tracing::trace!("connect(): ready");
        Ok(())
    }

    /// Write one command and read its response frame.
    ///
    /// With `expect`, a response that does not match is tolerated once if it
    /// is an unsolicited AudioSense event; the next frame is read instead.
    /// A mismatch after that, an empty frame, or `command error` drops the
    /// socket and fails with [`AmsError::Protocol`]. Timeouts and short reads
    /// are returned as-is; the caller decides whether to reconnect.
    pub async fn send_command(&self, command: &[u8], expect: Option<Expect>) -> Result<String> {
        tracing::trace!("send_command(): waiting for lock");
        let mut slot = self.stream.lock().await;
        self.apply_reset(&mut slot);
        if slot.is_none() {
            tracing::trace!("send_command(): transport missing; connecting");
            self.open(&mut slot).await?;
        }
        let Some(stream) = slot.as_mut() else {
            return Err(AmsError::Protocol("connection unavailable".to_string()));
        };

        tracing::debug!("Sending raw bytes: {}", protocol::to_hex(command));
        stream.writer.write_all(command).await?;
        stream.writer.flush().await?;
        sleep(self.config.command_settle()).await;

        let mut text = self.read_frame(stream).await?;

        if let Some(expect) = expect {
            if !text.is_empty() && !expect.matches(&text) {
                if protocol::is_audio_sense_event(&text) {
                    tracing::debug!("Skipping unsolicited AudioSense event: {}", text);
                    text = self.read_frame(stream).await?;
                }
                if !text.is_empty() && !expect.matches(&text) {
                    tracing::warn!("Unexpected response: {}", text);
                    *slot = None;
                    return Err(AmsError::Protocol(format!("unexpected response: {}", text)));
                }
            }
        }

        if text.is_empty() || protocol::is_command_error(&text) {
            tracing::warn!(
                "Device returned error/empty response for command {}; resetting connection",
                protocol::to_hex(command)
            );
            *slot = None;
            return Err(AmsError::Protocol(if text.is_empty() {
                "empty response".to_string()
            } else {
                text
            }));
        }

        Ok(text)
    }

    async fn read_frame(&self, stream: &mut Stream) -> Result<String> {
        let mut frame = Vec::new();
        let read = timeout(
            self.config.read_timeout(),
            stream.reader.read_until(FRAME_TERMINATOR, &mut frame),
        )
        .await
        .map_err(|_| AmsError::Timeout)??;

        if read == 0 || frame.last() != Some(&FRAME_TERMINATOR) {
            return Err(AmsError::IncompleteRead);
        }
        tracing::debug!("Raw response: {:?}", String::from_utf8_lossy(&frame));
        Ok(protocol::decode_frame(&frame))
    }

    async fn request(&self, request: Request) -> Result<String> {
        let bytes = request.encode()?;
        tracing::trace!("{}: {:?}", request.name(), request);
        self.send_command(&bytes, request.expect()).await
    }

    /// Send arbitrary bytes and return the decoded response frame
    pub async fn send_raw(&self, command: &[u8]) -> Result<String> {
        self.send_command(command, None).await
    }

    /// Set an output's absolute volume (0.0..=1.0, quantized to a device step)
    pub async fn set_output_volume(&self, output: OutputId, level: Level) -> Result<()> {
        tracing::debug!("Request to set volume for output {} to {:.2}", output, level);
        if !level.is_finite() {
            return Err(AmsError::InvalidCommand(format!(
                "volume level {} is not a number",
                level
            )));
        }
        let capped = level.clamp(0.0, 1.0);
        let value = (capped * f64::from(VOLUME_STEPS)).round() as u8;
        let response = self.request(Request::SetVolume { output, value }).await?;
        tracing::info!(
            "Set volume for output {} to {:.2} (resp: {})",
            output,
            capped,
            response
        );
        Ok(())
    }

    pub async fn get_output_volume(&self, output: OutputId) -> Result<Level> {
        let response = self.request(Request::GetVolume { output }).await?;
        protocol::parse_volume(&self.curve, &response)
    }

    pub async fn set_output_mute(&self, output: OutputId, mute: bool) -> Result<()> {
        let response = self.request(Request::SetMute { output, mute }).await?;
        tracing::info!("Set mute for output {} to {} (resp: {})", output, mute, response);
        Ok(())
    }

    pub async fn get_output_mute(&self, output: OutputId) -> Result<bool> {
        let response = self.request(Request::GetMute { output }).await?;
        protocol::parse_mute(&response)
    }

    /// Relative volume change; the device does not echo the new level
    pub async fn step_volume(
        &self,
        output: OutputId,
        direction: StepDirection,
        size: StepSize,
    ) -> Result<()> {
        let response = self
            .request(Request::StepVolume {
                output,
                direction,
                size,
            })
            .await?;
        tracing::debug!(
            "Volume step {:?} ({:?}) for output {} (resp: {})",
            direction,
            size,
            output,
            response
        );
        Ok(())
    }

    pub async fn set_output_to_input(&self, output: OutputId, input: InputId) -> Result<()> {
        let response = self
            .request(Request::Route {
                output,
                input,
                input_count: self.input_count,
            })
            .await?;
        tracing::info!("Set output {} to input {} (resp: {})", output, input, response);
        Ok(())
    }

    /// Input routed to `output`, or `None` for Audio Off
    pub async fn get_output_source(&self, output: OutputId) -> Result<Option<InputId>> {
        let response = self.request(Request::GetSource { output }).await?;
        protocol::parse_source(&response)
    }

    pub async fn set_trigger_zone(&self, zone: ZoneId, on: bool) -> Result<()> {
        let response = self.request(Request::TriggerZone { zone, on }).await?;
        tracing::info!("Set trigger zone {} to {} (resp: {})", zone, on, response);
        Ok(())
    }

    /// Unroute an output by pointing it at the first invalid input
    pub async fn disconnect_output(&self, output: OutputId) -> Result<()> {
        let response = self
            .request(Request::Disconnect {
                output,
                input_count: self.input_count,
            })
            .await?;
        tracing::info!("Disconnected output {} (resp: {})", output, response);
        Ok(())
    }
}

//! In-process stand-in for a Triad AMS switch.
//!
//! [`Simulator`] listens on a loopback port and speaks the same framed
//! protocol as the hardware: fixed-length binary commands in, one
//! `0x00`-terminated text frame out. It keeps per-output volume, mute and
//! routing, and lets tests inject the faults seen on real units.
//!
//! Trigger relays change only on explicit trigger commands, so tests can
//! check that the client drives them.

use crate::protocol::ZONE_COUNT;
use crate::volume::VolumeCurve;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const HEADER_LEN: usize = 5;

/// Device state shared by every client connection
struct DeviceState {
    input_count: u8,
    volumes: Vec<u8>,
    mutes: Vec<bool>,
    sources: Vec<Option<u8>>,
    zones: [bool; ZONE_COUNT as usize],
    received: Vec<Vec<u8>>,
    unsolicited: VecDeque<String>,
    stall: usize,
    fail_next: bool,
    volume_as_db: bool,
    connections: usize,
    curve: VolumeCurve,
}

impl DeviceState {
    fn new(input_count: u8, output_count: u8) -> Self {
        let outputs = usize::from(output_count);
        Self {
            input_count,
            volumes: vec![50; outputs],
            mutes: vec![false; outputs],
            sources: vec![None; outputs],
            zones: [false; ZONE_COUNT as usize],
            received: Vec::new(),
            unsolicited: VecDeque::new(),
            stall: 0,
            fail_next: false,
            volume_as_db: false,
            connections: 0,
            curve: VolumeCurve::measured(),
        }
    }

    /// Frames to write back, or `None` to stay silent
    fn handle(&mut self, command: &[u8]) -> Option<Vec<String>> {
        self.received.push(command.to_vec());
        if self.stall > 0 {
            self.stall -= 1;
            tracing::debug!("Simulator: stalling on {:02x?}", command);
            return None;
        }

        let mut frames: Vec<String> = self.unsolicited.drain(..).collect();
        let response = if std::mem::take(&mut self.fail_next) {
            "command error".to_string()
        } else {
            self.respond(command).unwrap_or_else(|| {
                tracing::warn!("Simulator: unknown command {:02x?}", command);
                "command error".to_string()
            })
        };
        frames.push(response);
        Some(frames)
    }

    fn output(&self, wire: u8) -> Option<usize> {
        let index = usize::from(wire);
        (index < self.volumes.len()).then_some(index)
    }

    fn respond(&mut self, command: &[u8]) -> Option<String> {
        match *command {
            [0xFF, 0x55, 0x04, 0x03, 0x1E, 0xF5, out] => {
                let volume = self.volumes[self.output(out)?];
                if self.volume_as_db && volume > 0 {
                    let db = self.curve.db_for_step(volume).ok()?;
                    Some(format!("Volume : {}", db))
                } else {
                    Some(format!("Volume : 0x{:02X}", volume))
                }
            }
            [0xFF, 0x55, 0x04, 0x03, 0x1E, out, value] => {
                let index = self.output(out)?;
                self.volumes[index] = value.min(100);
                Some(format!("Output Volume : 0x{:02X}", self.volumes[index]))
            }
            [0xFF, 0x55, 0x03, 0x03, op @ (0x17 | 0x18), out] => {
                let index = self.output(out)?;
                self.mutes[index] = op == 0x17;
                Some(self.mute_status(index))
            }
            [0xFF, 0x55, 0x04, 0x03, 0x17, 0xF5, out] => {
                let index = self.output(out)?;
                Some(self.mute_status(index))
            }
            [0xFF, 0x55, 0x03, 0x03, op @ 0x13..=0x16, out] => {
                let index = self.output(out)?;
                let volume = i16::from(self.volumes[index]);
                let delta = match op {
                    0x13 => 1,
                    0x15 => 5,
                    0x14 => -1,
                    _ => -5,
                };
                self.volumes[index] = (volume + delta).clamp(0, 100) as u8;
                if self.volumes[index] == 0 {
                    Some("Audio Off".to_string())
                } else {
                    Some("Input Source : input 1".to_string())
                }
            }
            [0xFF, 0x55, 0x04, 0x03, 0x1D, 0xF5, out] => {
                let index = self.output(out)?;
                Some(match self.sources[index] {
                    Some(input) => format!("Input Source : input {}", input),
                    None => "Audio Off".to_string(),
                })
            }
            [0xFF, 0x55, 0x04, 0x03, 0x1D, out, input] => {
                let index = self.output(out)?;
                if input >= self.input_count {
                    self.sources[index] = None;
                    Some("Set Output : 0x00".to_string())
                } else {
                    self.sources[index] = Some(input + 1);
                    Some(format!("Set output {} to input {}", index + 1, input + 1))
                }
            }
            [0xFF, 0x55, 0x03, 0x05, op @ (0x50 | 0x51), zone] => {
                let relay = self.zones.get_mut(usize::from(zone))?;
                *relay = op == 0x50;
                Some("Max Volume : 0x64".to_string())
            }
            _ => None,
        }
    }

    fn mute_status(&self, index: usize) -> String {
        let status = if self.mutes[index] { "mute" } else { "Unmute" };
        format!("Get Out[{}] Mute status : {}", index + 1, status)
    }
}

/// Command length implied by the header, `None` for headers the device does not know
fn command_len(header: &[u8; HEADER_LEN]) -> Option<usize> {
    match header[..4] {
        [0xFF, 0x55, 0x03, 0x03] | [0xFF, 0x55, 0x03, 0x05] => Some(6),
        [0xFF, 0x55, 0x04, 0x03] => Some(7),
        _ => None,
    }
}

/// A simulated switch listening on `127.0.0.1`
pub struct Simulator {
    state: Arc<Mutex<DeviceState>>,
    address: SocketAddr,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl Simulator {
    /// Bind an ephemeral port and start accepting clients
    pub async fn start(input_count: u8, output_count: u8) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let state = Arc::new(Mutex::new(DeviceState::new(input_count, output_count)));
        let (shutdown, _) = broadcast::channel(1);

        let task = tokio::spawn(accept_loop(listener, state.clone(), shutdown.clone()));
        tracing::info!("Simulator listening on {}", address);

        Ok(Self {
            state,
            address,
            shutdown,
            task: Some(task),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn host(&self) -> String {
        self.address.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Close the listener and every client connection
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::info!("Simulator on {} stopped", self.address);
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw volume step (0..=100) of a 1-based output
    pub fn volume(&self, output: u8) -> u8 {
        let state = self.lock();
        output
            .checked_sub(1)
            .and_then(|wire| state.output(wire))
            .map_or(0, |index| state.volumes[index])
    }

    pub fn set_volume(&self, output: u8, step: u8) {
        let mut state = self.lock();
        if let Some(index) = output.checked_sub(1).and_then(|wire| state.output(wire)) {
            state.volumes[index] = step.min(100);
        }
    }

    pub fn muted(&self, output: u8) -> bool {
        let state = self.lock();
        output
            .checked_sub(1)
            .and_then(|wire| state.output(wire))
            .is_some_and(|index| state.mutes[index])
    }

    /// 1-based input routed to a 1-based output
    pub fn source(&self, output: u8) -> Option<u8> {
        let state = self.lock();
        let index = output.checked_sub(1).and_then(|wire| state.output(wire))?;
        state.sources[index]
    }

    pub fn set_source(&self, output: u8, input: Option<u8>) {
        let mut state = self.lock();
        if let Some(index) = output.checked_sub(1).and_then(|wire| state.output(wire)) {
            state.sources[index] = input;
        }
    }

    /// Relay state of a 1-based trigger zone
    pub fn zone_state(&self, zone: u8) -> bool {
        let state = self.lock();
        zone.checked_sub(1)
            .and_then(|index| state.zones.get(usize::from(index)))
            .copied()
            .unwrap_or(false)
    }

    /// Every command received so far, in order
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.lock().received.clone()
    }

    pub fn clear_received(&self) {
        self.lock().received.clear();
    }

    /// Number of client connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.lock().connections
    }

    /// Queue a frame to write ahead of the next response
    pub fn push_unsolicited(&self, frame: impl Into<String>) {
        self.lock().unsolicited.push_back(frame.into());
    }

    /// Swallow the next `count` commands without answering
    pub fn stall_next(&self, count: usize) {
        self.lock().stall += count;
    }

    /// Answer the next command with `command error`
    pub fn fail_next(&self) {
        self.lock().fail_next = true;
    }

    /// Report volume reads as measured dB text instead of a hex step
    pub fn report_volume_as_db(&self, enabled: bool) {
        self.lock().volume_as_db = enabled;
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<Mutex<DeviceState>>,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!("Simulator: client connected from {}", peer);
                    state.lock().unwrap_or_else(PoisonError::into_inner).connections += 1;
                    tokio::spawn(handle_client(socket, state.clone(), shutdown.subscribe()));
                }
                Err(e) => {
                    tracing::warn!("Simulator: accept failed: {}", e);
                    break;
                }
            },
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    state: Arc<Mutex<DeviceState>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let mut header = [0u8; HEADER_LEN];
        let read = tokio::select! {
            _ = shutdown_rx.recv() => break,
            read = reader.read_exact(&mut header) => read,
        };
        if read.is_err() {
            tracing::debug!("Simulator: client disconnected");
            break;
        }

        let mut command = header.to_vec();
        match command_len(&header) {
            Some(len) => {
                let mut rest = vec![0u8; len - HEADER_LEN];
                if reader.read_exact(&mut rest).await.is_err() {
                    break;
                }
                command.extend_from_slice(&rest);
            }
            None => {
                let mut rest = Vec::new();
                match reader.read_until(0x00, &mut rest).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                if rest.last() == Some(&0x00) {
                    rest.pop();
                }
                command.extend_from_slice(&rest);
            }
        }

        let frames = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle(&command);
        let Some(frames) = frames else {
            continue;
        };
        for frame in frames {
            let mut bytes = frame.into_bytes();
            bytes.push(0x00);
            if writer.write_all(&bytes).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lengths() {
        assert_eq!(command_len(&[0xFF, 0x55, 0x03, 0x03, 0x17]), Some(6));
        assert_eq!(command_len(&[0xFF, 0x55, 0x03, 0x05, 0x50]), Some(6));
        assert_eq!(command_len(&[0xFF, 0x55, 0x04, 0x03, 0x1E]), Some(7));
        assert_eq!(command_len(&[0xFF, 0x55, 0x09, 0x09, 0x09]), None);
    }

    #[test]
    fn test_routing_and_disconnect() {
        let mut state = DeviceState::new(8, 8);
        let frames = state.handle(&[0xFF, 0x55, 0x04, 0x03, 0x1D, 0x01, 0x02]).unwrap();
        assert_eq!(frames, vec!["Set output 2 to input 3"]);
        assert_eq!(state.sources[1], Some(3));
        // routing alone never touches the relays
        assert!(!state.zones[0]);

        let frames = state.handle(&[0xFF, 0x55, 0x04, 0x03, 0x1D, 0x01, 0x08]).unwrap();
        assert_eq!(frames, vec!["Set Output : 0x00"]);
        assert_eq!(state.sources[1], None);
    }

    #[test]
    fn test_faults() {
        let mut state = DeviceState::new(8, 8);
        state.stall = 1;
        assert!(state.handle(&[0xFF, 0x55, 0x04, 0x03, 0x1E, 0xF5, 0x00]).is_none());

        state.unsolicited.push_back("AudioSense:Input[1] : 1".to_string());
        let frames = state.handle(&[0xFF, 0x55, 0x04, 0x03, 0x1E, 0xF5, 0x00]).unwrap();
        assert_eq!(frames, vec!["AudioSense:Input[1] : 1", "Volume : 0x32"]);

        state.fail_next = true;
        let frames = state.handle(&[0xFF, 0x55, 0x04, 0x03, 0x1E, 0xF5, 0x00]).unwrap();
        assert_eq!(frames, vec!["command error"]);
        assert_eq!(state.received.len(), 3);
    }

    #[test]
    fn test_unknown_command_and_bad_output() {
        let mut state = DeviceState::new(8, 8);
        assert_eq!(state.handle(&[0xFF, 0x55, 0x09, 0x09, 0x09]).unwrap(), vec!["command error"]);
        assert_eq!(
            state.handle(&[0xFF, 0x55, 0x04, 0x03, 0x1E, 0xF5, 0x20]).unwrap(),
            vec!["command error"]
        );
    }

    #[test]
    fn test_volume_as_db() {
        let mut state = DeviceState::new(8, 8);
        state.volume_as_db = true;
        state.volumes[0] = 100;
        let frames = state.handle(&[0xFF, 0x55, 0x04, 0x03, 0x1E, 0xF5, 0x00]).unwrap();
        assert_eq!(frames, vec!["Volume : 0"]);
    }
}

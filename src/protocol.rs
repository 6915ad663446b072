//! Binary command encoding and response parsing for the AMS wire protocol.
//!
//! Commands are short byte strings starting with `FF 55`. Channels are
//! 1-based in this crate and 0-based on the wire. Every response is one ASCII
//! frame terminated by `0x00`.

use crate::error::{AmsError, Result};
use crate::types::{InputId, OutputId, StepDirection, StepSize, ZoneId};
use crate::volume::{percentage_for_step, VolumeCurve, VOLUME_STEPS};

/// Largest output or input number any matrix variant exposes
pub const MAX_CHANNELS: u8 = 24;

/// Number of trigger zones
pub const ZONE_COUNT: u8 = 3;

/// Outputs sharing one trigger relay
pub const OUTPUTS_PER_ZONE: u8 = 8;

const QUERY: u8 = 0xF5;

/// One device command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SetVolume { output: OutputId, value: u8 },
    GetVolume { output: OutputId },
    SetMute { output: OutputId, mute: bool },
    GetMute { output: OutputId },
    StepVolume {
        output: OutputId,
        direction: StepDirection,
        size: StepSize,
    },
    Route {
        output: OutputId,
        input: InputId,
        input_count: u8,
    },
    GetSource { output: OutputId },
    /// Routes the output to the first invalid input, which the device treats as off
    Disconnect { output: OutputId, input_count: u8 },
    TriggerZone { zone: ZoneId, on: bool },
    Raw(Vec<u8>),
}

impl Request {
    /// Short operation name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Request::SetVolume { .. } => "set_output_volume",
            Request::GetVolume { .. } => "get_output_volume",
            Request::SetMute { .. } => "set_output_mute",
            Request::GetMute { .. } => "get_output_mute",
            Request::StepVolume { .. } => "step_volume",
            Request::Route { .. } => "set_output_to_input",
            Request::GetSource { .. } => "get_output_source",
            Request::Disconnect { .. } => "disconnect_output",
            Request::TriggerZone { .. } => "set_trigger_zone",
            Request::Raw(_) => "send_raw",
        }
    }

    /// Encode into the exact bytes sent to the device
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Request::SetVolume { output, value } => {
                if *value > VOLUME_STEPS {
                    return Err(AmsError::StepOutOfRange(i64::from(*value)));
                }
                vec![0xFF, 0x55, 0x04, 0x03, 0x1E, wire_output(*output)?, *value]
            }
            Request::GetVolume { output } => {
                vec![0xFF, 0x55, 0x04, 0x03, 0x1E, QUERY, wire_output(*output)?]
            }
            Request::SetMute { output, mute } => {
                let op = if *mute { 0x17 } else { 0x18 };
                vec![0xFF, 0x55, 0x03, 0x03, op, wire_output(*output)?]
            }
            Request::GetMute { output } => {
                vec![0xFF, 0x55, 0x04, 0x03, 0x17, QUERY, wire_output(*output)?]
            }
            Request::StepVolume {
                output,
                direction,
                size,
            } => {
                let op = match (direction, size) {
                    (StepDirection::Up, StepSize::Small) => 0x13,
                    (StepDirection::Down, StepSize::Small) => 0x14,
                    (StepDirection::Up, StepSize::Large) => 0x15,
                    (StepDirection::Down, StepSize::Large) => 0x16,
                };
                vec![0xFF, 0x55, 0x03, 0x03, op, wire_output(*output)?]
            }
            Request::Route {
                output,
                input,
                input_count,
            } => {
                if *input == 0 || input > input_count {
                    return Err(AmsError::InvalidChannel(format!(
                        "input {} outside 1..={}",
                        input, input_count
                    )));
                }
                vec![0xFF, 0x55, 0x04, 0x03, 0x1D, wire_output(*output)?, input - 1]
            }
            Request::GetSource { output } => {
                vec![0xFF, 0x55, 0x04, 0x03, 0x1D, QUERY, wire_output(*output)?]
            }
            Request::Disconnect {
                output,
                input_count,
            } => {
                vec![0xFF, 0x55, 0x04, 0x03, 0x1D, wire_output(*output)?, *input_count]
            }
            Request::TriggerZone { zone, on } => {
                if *zone == 0 || *zone > ZONE_COUNT {
                    return Err(AmsError::InvalidChannel(format!(
                        "zone {} outside 1..={}",
                        zone, ZONE_COUNT
                    )));
                }
                let op = if *on { 0x50 } else { 0x51 };
                vec![0xFF, 0x55, 0x03, 0x05, op, zone - 1]
            }
            Request::Raw(bytes) => bytes.clone(),
        };
        Ok(bytes)
    }

    /// Response shape that belongs to this command, if the device answers with one
    pub fn expect(&self) -> Option<Expect> {
        match self {
            Request::SetVolume { .. } => Some(Expect::SetVolume),
            Request::GetVolume { .. } => Some(Expect::Volume),
            Request::SetMute { .. } => None,
            Request::GetMute { .. } => Some(Expect::Mute),
            Request::StepVolume { .. } => Some(Expect::StepAck),
            Request::Route { .. } => Some(Expect::RouteAck),
            Request::GetSource { .. } => Some(Expect::Source),
            Request::Disconnect { .. } => Some(Expect::DisconnectAck),
            Request::TriggerZone { .. } => Some(Expect::TriggerAck),
            Request::Raw(_) => None,
        }
    }
}

fn wire_output(output: OutputId) -> Result<u8> {
    if output == 0 || output > MAX_CHANNELS {
        return Err(AmsError::InvalidChannel(format!(
            "output {} outside 1..={}",
            output, MAX_CHANNELS
        )));
    }
    Ok(output - 1)
}

/// Expected response shapes, matched case-insensitively anywhere in the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// `Output Volume` or `Volume :`
    SetVolume,
    /// `Volume :`
    Volume,
    /// anything mentioning mute
    Mute,
    /// `Input Source` or `Audio Off`
    StepAck,
    /// `Trigger` or `Set ...`
    RouteAck,
    /// `Audio Off`, `Input Source` or `Set ...`
    Source,
    /// `Max Volume`, `0x`, `dB` or `Set ...`
    TriggerAck,
    /// `Start Vol`, `0x`, `dB` or `Set ...`
    DisconnectAck,
}

impl Expect {
    pub fn matches(self, text: &str) -> bool {
        let text = text.to_ascii_lowercase();
        let t = text.as_str();
        match self {
            Expect::SetVolume => has_phrase(t, &["output", "volume"]) || has_label(t, "volume"),
            Expect::Volume => has_label(t, "volume"),
            Expect::Mute => t.contains("mute"),
            Expect::StepAck => has_phrase(t, &["input", "source"]) || has_phrase(t, &["audio", "off"]),
            Expect::RouteAck => t.contains("trigger") || has_set_clause(t),
            Expect::Source => {
                has_phrase(t, &["audio", "off"])
                    || has_phrase(t, &["input", "source"])
                    || has_set_clause(t)
            }
            Expect::TriggerAck => {
                has_phrase(t, &["max", "volume"])
                    || t.contains("0x")
                    || t.contains("db")
                    || has_set_clause(t)
            }
            Expect::DisconnectAck => {
                has_phrase(t, &["start", "vol"])
                    || t.contains("0x")
                    || t.contains("db")
                    || has_set_clause(t)
            }
        }
    }
}

/// `AudioSense:Input[<n>] : 0|1`, pushed by the device whenever an input
/// detects or loses signal
pub fn is_audio_sense_event(text: &str) -> bool {
    let lower = text.trim_end().to_ascii_lowercase();
    let Some(rest) = lower.strip_prefix("audiosense:input[") else {
        return false;
    };
    let Some((index, rest)) = rest.split_once(']') else {
        return false;
    };
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    match rest.trim_start().strip_prefix(':') {
        Some(state) => matches!(state.trim_start(), "0" | "1"),
        None => false,
    }
}

/// The device's generic rejection frame
pub fn is_command_error(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    match lower.strip_prefix("command") {
        Some(rest) => rest.starts_with(char::is_whitespace) && rest.trim_start() == "error",
        None => false,
    }
}

/// Decode one raw frame: lossy UTF-8, terminator and surrounding whitespace removed
pub fn decode_frame(frame: &[u8]) -> String {
    String::from_utf8_lossy(frame)
        .trim_matches('\0')
        .trim()
        .to_string()
}

/// Parse a volume response into 0..=1.
///
/// Prefers the raw step (`Volume : 0x32`); falls back to a measured dB value
/// (`Volume : -21.2`) mapped through `curve`.
pub fn parse_volume(curve: &VolumeCurve, text: &str) -> Result<f64> {
    let lower = text.to_ascii_lowercase();
    let values: Vec<&str> = label_values(&lower, "volume").collect();

    for value in &values {
        if let Some(hex) = value.strip_prefix("0x") {
            let end = hex
                .find(|c: char| !c.is_ascii_hexdigit())
                .unwrap_or(hex.len());
            if let Ok(raw) = u32::from_str_radix(&hex[..end], 16) {
                return Ok((f64::from(raw) / f64::from(VOLUME_STEPS)).clamp(0.0, 1.0));
            }
        }
    }
    for value in &values {
        if let Some(db) = leading_number(value) {
            return Ok(percentage_for_step(curve.step_for_db(db)));
        }
    }
    Err(AmsError::InvalidResponse(format!(
        "no volume in response: {}",
        text
    )))
}

const MUTED_TOKENS: &[&str] = &["on", "mute", "muted", "1", "true", "yes"];
const UNMUTED_TOKENS: &[&str] = &["off", "unmute", "unmuted", "0", "false", "no"];

/// Parse a mute response.
///
/// Observed shapes: `Get Out[1] Mute status : Unmute`, `Mute : On`,
/// `Muted`, `Unmuted`.
pub fn parse_mute(text: &str) -> Result<bool> {
    let lower = text.to_ascii_lowercase();

    for (at, word) in lower.match_indices("mute") {
        let mut tail = &lower[at + word.len()..];
        if let Some(rest) = strip_spaced_word(tail, "status") {
            tail = rest;
        }
        if let Some(value) = tail.trim_start().strip_prefix(':') {
            let value = value.trim_start();
            let end = value
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(value.len());
            let token = &value[..end];
            if MUTED_TOKENS.contains(&token) {
                return Ok(true);
            }
            if UNMUTED_TOKENS.contains(&token) {
                return Ok(false);
            }
        }
    }

    let words: Vec<&str> = lower.split(|c: char| !c.is_ascii_alphanumeric()).collect();
    if words.contains(&"muted") {
        return Ok(true);
    }
    if words.iter().any(|w| *w == "unmuted" || *w == "unmute") {
        return Ok(false);
    }
    Err(AmsError::InvalidResponse(format!(
        "no mute state in response: {}",
        text
    )))
}

/// Parse a routing response. `None` means the output is not routed.
pub fn parse_source(text: &str) -> Result<Option<InputId>> {
    let lower = text.to_ascii_lowercase();
    if has_phrase(&lower, &["audio", "off"]) {
        return Ok(None);
    }
    for (at, word) in lower.match_indices("input") {
        let tail = &lower[at + word.len()..];
        let digits = tail.trim_start();
        if digits.len() == tail.len() {
            continue;
        }
        let end = digits
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(digits.len());
        if let Ok(input) = digits[..end].parse::<InputId>() {
            return Ok(Some(input));
        }
    }
    Err(AmsError::InvalidResponse(format!(
        "no input source in response: {}",
        text
    )))
}

/// Trigger zone an output belongs to: `clamp(ceil(output / 8), 1, 3)`
pub fn zone_for_output(output: OutputId) -> ZoneId {
    let zone = (u16::from(output) + u16::from(OUTPUTS_PER_ZONE) - 1) / u16::from(OUTPUTS_PER_ZONE);
    zone.clamp(1, u16::from(ZONE_COUNT)) as ZoneId
}

/// Parse a human-written hex command such as `"FF 55 03 05 50 00"`.
///
/// Anything that is not a hex digit is ignored.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = input
        .chars()
        .filter_map(|c| c.to_digit(16))
        .map(|d| d as u8)
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(AmsError::InvalidCommand(
            "hex must contain an even number of hex digits".to_string(),
        ));
    }
    Ok(digits.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
}

/// Lowercase hex without separators, for logs
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Whether `words` appear in sequence, separated by at least one whitespace
fn has_phrase(text: &str, words: &[&str]) -> bool {
    let Some((first, rest)) = words.split_first() else {
        return false;
    };
    text.match_indices(first).any(|(at, _)| {
        let mut tail = &text[at + first.len()..];
        rest.iter().all(|word| match strip_spaced_word(tail, word) {
            Some(next) => {
                tail = next;
                true
            }
            None => false,
        })
    })
}

/// `word` followed by optional whitespace and a colon
fn has_label(text: &str, word: &str) -> bool {
    label_values(text, word).next().is_some()
}

/// `set` followed by whitespace
fn has_set_clause(text: &str) -> bool {
    text.match_indices("set")
        .any(|(at, _)| text[at + 3..].starts_with(char::is_whitespace))
}

/// Text after each `word :` occurrence, leading whitespace removed
fn label_values<'a>(text: &'a str, word: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    text.match_indices(word).filter_map(move |(at, _)| {
        text[at + word.len()..]
            .trim_start()
            .strip_prefix(':')
            .map(str::trim_start)
    })
}

/// Strip `\s+word` from the front of `text`
fn strip_spaced_word<'a>(text: &'a str, word: &str) -> Option<&'a str> {
    let trimmed = text.trim_start();
    if trimmed.len() == text.len() {
        return None;
    }
    trimmed.strip_prefix(word)
}

/// `-?\d+(\.\d+)?` at the start of `text`
fn leading_number(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let mut end = usize::from(bytes.first() == Some(&b'-'));
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return None;
    }
    if end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit() {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    text[..end].parse().ok()
}

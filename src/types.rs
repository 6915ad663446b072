use serde::{Deserialize, Serialize};

/// Output channel number (1-based)
pub type OutputId = u8;

/// Input channel number (1-based)
pub type InputId = u8;

/// Trigger zone number (1..=3)
pub type ZoneId = u8;

/// Volume level, 0.0 (off) to 1.0 (max)
pub type Level = f64;

/// Direction of a relative volume step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepDirection {
    Up,
    Down,
}

/// Size of a relative volume step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepSize {
    Small,
    Large,
}

impl StepSize {
    pub fn from_large(large: bool) -> Self {
        if large {
            StepSize::Large
        } else {
            StepSize::Small
        }
    }
}

/// Snapshot of the dispatcher and its registered outputs for troubleshooting
///
/// The device host is left out so the snapshot can be shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub port: u16,
    pub input_count: u8,
    pub available: bool,
    pub outputs: Vec<OutputDiagnostics>,
}

/// Cached state of one output as seen by [`Diagnostics`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDiagnostics {
    pub number: OutputId,
    pub name: String,
    pub volume: Option<Level>,
    pub muted: bool,
    pub source: Option<InputId>,
    pub has_source: bool,
}

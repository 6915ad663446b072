//! Device volume steps and the measured dB curve.
//!
//! The switch exposes volume as an integer step. Depending on firmware it
//! reports the current level either as that raw step (`Volume : 0x32`) or as
//! a measured attenuation (`Volume : -21.2`). [`VolumeCurve`] maps between the
//! two using a table captured from a physical unit with the `sweep_volume`
//! demo. Other units or matrix sizes may need their own table, which is why
//! the curve is part of [`AmsConfig`](crate::AmsConfig).

use crate::error::{AmsError, Result};
use serde::{Deserialize, Serialize};

/// Highest device volume step; `0x64` on the wire
pub const VOLUME_STEPS: u8 = 100;

/// dB reported by the device for steps 1..=100 (index 0 is step 1)
const MEASURED_DB: [f64; VOLUME_STEPS as usize] = [
    -100.3, -92.7, -85.8, -79.5, -73.9, -69.0, -64.6, -61.0, -58.0, -55.6, //
    -53.9, -52.0, -50.5, -49.6, -48.7, -47.7, -46.8, -45.9, -45.0, -44.1, //
    -43.2, -42.3, -41.4, -40.6, -39.7, -38.9, -38.0, -37.2, -36.4, -35.6, //
    -34.8, -34.0, -33.2, -32.4, -31.7, -30.9, -30.2, -29.4, -28.7, -28.0, //
    -27.2, -26.5, -25.8, -25.1, -24.5, -23.8, -23.1, -22.5, -21.8, -21.2, //
    -20.5, -19.9, -19.3, -18.7, -18.1, -17.5, -16.9, -16.4, -15.8, -15.3, //
    -14.7, -14.2, -13.7, -13.1, -12.6, -12.1, -11.6, -11.1, -10.7, -10.2, //
    -9.7, -9.3, -8.9, -8.4, -8.0, -7.6, -7.2, -6.8, -6.4, -6.0, //
    -5.6, -5.3, -4.9, -4.6, -4.2, -3.9, -3.6, -3.3, -3.0, -2.7, //
    -2.4, -2.1, -1.8, -1.6, -1.3, -1.1, -0.9, -0.6, -0.4, 0.0,
];

/// Bidirectional step ↔ dB lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct VolumeCurve {
    db: Vec<f64>,
}

impl VolumeCurve {
    /// The table measured on the reference unit
    pub fn measured() -> Self {
        Self {
            db: MEASURED_DB.to_vec(),
        }
    }

    /// Build a curve from a custom calibration table.
    ///
    /// `db[i]` is the level for step `i + 1`. The table must hold exactly 100
    /// finite, strictly increasing values.
    pub fn from_table(db: Vec<f64>) -> Result<Self> {
        if db.len() != VOLUME_STEPS as usize {
            return Err(AmsError::InvalidConfig(format!(
                "volume curve needs {} entries, got {}",
                VOLUME_STEPS,
                db.len()
            )));
        }
        if let Some(bad) = db.iter().position(|v| !v.is_finite()) {
            return Err(AmsError::InvalidConfig(format!(
                "volume curve entry for step {} is not finite",
                bad + 1
            )));
        }
        if let Some(pair) = db.windows(2).position(|w| w[1] <= w[0]) {
            return Err(AmsError::InvalidConfig(format!(
                "volume curve is not increasing at step {}",
                pair + 2
            )));
        }
        Ok(Self { db })
    }

    /// dB for a device step in 1..=100
    pub fn db_for_step(&self, step: u8) -> Result<f64> {
        if step == 0 || step > VOLUME_STEPS {
            return Err(AmsError::StepOutOfRange(i64::from(step)));
        }
        Ok(self.db[usize::from(step) - 1])
    }

    /// Nearest device step for a dB value, clamped to 1..=100.
    ///
    /// Equidistant values resolve to the lower step.
    pub fn step_for_db(&self, db: f64) -> u8 {
        let i = self.db.partition_point(|&v| v < db);
        if i == 0 {
            return 1;
        }
        if i >= self.db.len() {
            return VOLUME_STEPS;
        }
        let below = db - self.db[i - 1];
        let above = self.db[i] - db;
        // db[i - 1] is step i, db[i] is step i + 1
        if above < below {
            (i + 1) as u8
        } else {
            i as u8
        }
    }
}

impl Default for VolumeCurve {
    fn default() -> Self {
        Self::measured()
    }
}

impl TryFrom<Vec<f64>> for VolumeCurve {
    type Error = AmsError;

    fn try_from(db: Vec<f64>) -> Result<Self> {
        Self::from_table(db)
    }
}

impl From<VolumeCurve> for Vec<f64> {
    fn from(curve: VolumeCurve) -> Self {
        curve.db
    }
}

/// Map a raw device step to 0..=1, clamping the step to 1..=100
pub fn percentage_for_step(step: u8) -> f64 {
    f64::from(step.clamp(1, VOLUME_STEPS)) / f64::from(VOLUME_STEPS)
}

/// Nearest device step (1..=100) for a 0..=1 level
pub fn step_for_percentage(pct: f64) -> u8 {
    let scaled = (pct.clamp(0.0, 1.0) * f64::from(VOLUME_STEPS)).round();
    if scaled.is_nan() {
        return 1;
    }
    (scaled as u8).clamp(1, VOLUME_STEPS)
}

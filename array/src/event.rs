//! Records exchanged between the simulator and the reconstructor, one JSON object per
//! line.
use crate::ion::Ion;
use multidet_common::{Energy, EventNumber};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::{BufRead, Write},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line {line}: {source}")]
    Malformed {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Cannot serialise event: {0}")]
    Serialise(#[from] serde_json::Error),
}

/// What the per-detector records of an event contain.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SimulationMode {
    /// Energy losses.
    #[default]
    Filter,
    /// Raw acquisition parameters.
    Physical,
}

/// Why a particle was not detected.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum UndetectedReason {
    #[strum(serialize = "STOPPED IN TARGET")]
    StoppedInTarget,
    #[strum(serialize = "SUPERHEAVY")]
    Superheavy,
    #[strum(serialize = "NEUTRON")]
    Neutron,
    #[strum(serialize = "NO ENERGY")]
    NoEnergy,
    #[strum(serialize = "NO HIT")]
    NoHit,
    #[strum(serialize = "DEAD ZONE")]
    DeadZone,
    #[strum(serialize = "GEOMETRY INCOHERENCY")]
    GeometryIncoherency,
    #[strum(serialize = "THRESHOLD")]
    Threshold,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Detection {
    Undetected(UndetectedReason),
    Detected {
        /// No ready telescope can identify the particle.
        incomplete: bool,
        /// The particle left the array with some energy.
        punch_through: bool,
    },
}

impl Detection {
    pub fn is_detected(&self) -> bool {
        matches!(self, Self::Detected { .. })
    }

    /// Label used when counting outcomes.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Undetected(reason) => reason.into(),
            Self::Detected {
                punch_through: true,
                ..
            } => "PUNCH THROUGH",
            Self::Detected {
                incomplete: true, ..
            } => "INCOMPLETE",
            Self::Detected { .. } => "DETECTED",
        }
    }
}

/// Fate of one simulated particle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimulatedParticle {
    /// The particle as emitted at the interaction point.
    pub ion: Ion,
    pub detection: Detection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopping_detector: Option<String>,
    /// Energy lost in each detector crossed.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub energy_losses: BTreeMap<String, Energy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telescope: Option<String>,
    #[serde(default)]
    pub target_loss: Energy,
    #[serde(default)]
    pub residual_energy: Energy,
}

impl SimulatedParticle {
    pub fn new(ion: Ion, detection: Detection) -> Self {
        Self {
            ion,
            detection,
            stopping_detector: None,
            energy_losses: BTreeMap::new(),
            telescope: None,
            target_loss: 0.0,
            residual_energy: 0.0,
        }
    }
}

/// Data of one fired detector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DetectorRecord {
    pub detector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_loss: Option<Energy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signals: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArrayEvent {
    pub event_number: EventNumber,
    pub mode: SimulationMode,
    pub detectors: Vec<DetectorRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub particles: Vec<SimulatedParticle>,
}

impl ArrayEvent {
    pub fn record(&self, detector: &str) -> Option<&DetectorRecord> {
        self.detectors
            .iter()
            .find(|record| record.detector == detector)
    }
}

/// Writes `record` as one line of JSON.
pub fn write_line<W: Write, T: Serialize>(writer: &mut W, record: &T) -> Result<(), EventError> {
    serde_json::to_writer(&mut *writer, record)?;
    writeln!(writer)?;
    Ok(())
}

/// Reads one record per non-empty line.
pub fn read_lines<R, T>(reader: R) -> impl Iterator<Item = Result<T, EventError>>
where
    R: BufRead,
    T: for<'de> Deserialize<'de>,
{
    reader
        .lines()
        .enumerate()
        .filter_map(|(index, line)| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(
                serde_json::from_str(&line).map_err(|source| EventError::Malformed {
                    line: index + 1,
                    source,
                }),
            ),
            Err(e) => Some(Err(e.into())),
        })
}

use crate::{
    ion::Ion,
    material::{Absorber, AbsorberError, InversionError, LayerConfig, MaterialTable, StoppingFunctions},
};
use multidet_common::{ChargeNumber, Energy, MassNumber};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest direction cosine used for paths through the target.
const MIN_PATH_COSINE: f64 = 0.01;

#[derive(Debug, Error, PartialEq)]
pub enum TargetError {
    #[error("Target orientation is not set")]
    OrientationUnset,
    #[error("{0}")]
    Inversion(#[from] InversionError),
}

/// Whether energy-loss corrections concern the beam entering the target or a reaction
/// product leaving it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TargetOrientation {
    Incoming,
    Outgoing,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetConfig {
    #[serde(flatten)]
    pub layer: LayerConfig,
    pub orientation: Option<TargetOrientation>,
}

/// Absorber at the interaction point. Reactions take place in its middle plane, so
/// particles cross half of its thickness.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    absorber: Absorber,
    orientation: Option<TargetOrientation>,
}

impl Target {
    pub fn new(absorber: Absorber) -> Self {
        Self {
            absorber,
            orientation: None,
        }
    }

    pub fn from_config(config: &TargetConfig, table: &MaterialTable) -> Result<Self, AbsorberError> {
        Ok(Self {
            absorber: Absorber::from_config(&config.layer, table)?,
            orientation: config.orientation,
        })
    }

    pub fn with_orientation(mut self, orientation: TargetOrientation) -> Self {
        self.orientation = Some(orientation);
        self
    }

    pub fn set_orientation(&mut self, orientation: TargetOrientation) {
        self.orientation = Some(orientation);
    }

    pub fn orientation(&self) -> Option<TargetOrientation> {
        self.orientation
    }

    pub fn absorber(&self) -> &Absorber {
        &self.absorber
    }

    /// Half of the target as seen along a direction of polar angle `theta`.
    fn effective_half(&self, theta: f64) -> Result<Absorber, TargetError> {
        let cosine = match self.orientation.ok_or(TargetError::OrientationUnset)? {
            TargetOrientation::Incoming => 1.0,
            TargetOrientation::Outgoing => theta.to_radians().cos().abs().max(MIN_PATH_COSINE),
        };
        Ok(Absorber::from_area_density(
            self.absorber.material(),
            0.5 * self.absorber.area_density() / cosine,
        ))
    }

    /// Energy lost in the target by `ion`.
    pub fn energy_loss(&self, ion: &Ion) -> Result<Energy, TargetError> {
        Ok(self
            .effective_half(ion.theta)?
            .delta_e(ion.z, ion.a, ion.energy))
    }

    /// Energy at the interaction point of an ion leaving the target with `e_res` at `theta`.
    pub fn incident_energy_from_e_res(
        &self,
        z: ChargeNumber,
        a: MassNumber,
        e_res: Energy,
        theta: f64,
    ) -> Result<Energy, TargetError> {
        if e_res <= 0.0 {
            return Ok(0.0);
        }
        Ok(self
            .effective_half(theta)?
            .solve_incident_energy_from_e_res(z, a, e_res)?)
    }
}
